//! Stage executors, one per execution mode.
//!
//! Every executor takes a [`StageEnv`] plus the current execution context
//! and returns a [`StageResult`]. Executors never return `Err`: failures are
//! folded into the result so the orchestrator can decide whether the run
//! continues.

mod adversarial;
pub mod discovery;
mod dynamic;
mod iterative;
mod parallel;
mod single;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agentflow_state::{
    DocumentStore, IndividualRunRecord, RunErrorEntry, RunId, RunStatus, StorageError,
    TokenUsage,
};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, error, warn};

use crate::agent::{AgentRequest, AgentRunner, RunFailure, RunOutcome};
use crate::context::ExecutionContext;
use crate::domain::{Artifact, StageConfig, StageMode};
use crate::obs;
use crate::progress::ProgressTracker;
use crate::recording::RunRecorder;
use crate::template::{self, Bindings};
use crate::worktree::WorktreePool;

/// Longest file-name fragment derived from a run label.
const MAX_LOG_LABEL: usize = 60;

/// Everything a stage executor needs. Shared across the stage's tasks.
pub struct StageEnv {
    pub run_id: RunId,
    pub stage: StageConfig,
    pub stage_run_id: String,
    pub runner: Arc<dyn AgentRunner>,
    pub documents: Arc<dyn DocumentStore>,
    pub recorder: Arc<RunRecorder>,
    pub progress: Arc<ProgressTracker>,
    /// Present when the run is isolated.
    pub pool: Option<Arc<WorktreePool>>,
    /// Working directory when not isolated, and for discovery and synthesis.
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub discovery_timeout: Duration,
    pub log_dir: PathBuf,
    pub cancel: watch::Receiver<bool>,
    pub concurrency: usize,
    pub retain_worktrees: bool,
}

/// Result of one individual run as seen by the executors.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub index: u32,
    pub label: String,
    pub record_id: String,
    pub artifact: Option<Artifact>,
    pub usage: TokenUsage,
    pub failure: Option<RunFailure>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.artifact.is_some()
    }
}

/// Outcome of executing one stage.
#[derive(Debug, Clone, Default)]
pub struct StageResult {
    pub success: bool,
    /// Final output: the single run, the last iteration, the synthesis.
    pub output: Option<Artifact>,
    pub synthesis: Option<Artifact>,
    /// Successful individual outputs in run order.
    pub outputs: Vec<Artifact>,
    /// Ids of the individual run records written.
    pub individual_refs: Vec<String>,
    pub usage: TokenUsage,
    pub duration_ms: u64,
    pub errors: Vec<RunErrorEntry>,
    pub runs_total: u32,
    pub runs_completed: u32,
    pub runs_failed: u32,
}

impl StageResult {
    pub(crate) fn with_total(runs_total: u32) -> Self {
        Self {
            runs_total,
            ..Default::default()
        }
    }

    /// Fold one finished run into the counters.
    pub(crate) fn absorb(&mut self, stage: &str, run: &RunResult) {
        self.individual_refs.push(run.record_id.clone());
        self.usage += run.usage;
        match &run.artifact {
            Some(artifact) => {
                self.runs_completed += 1;
                self.outputs.push(artifact.clone());
            }
            None => {
                self.runs_failed += 1;
                let failure = run.failure.clone().unwrap_or(RunFailure::NoArtifact);
                self.errors.push(RunErrorEntry {
                    stage: stage.to_string(),
                    run_index: Some(run.index),
                    kind: failure.kind().to_string(),
                    message: format!("{}: {failure}", run.label),
                });
            }
        }
    }

    /// Record a stage-level error (discovery, synthesis).
    pub(crate) fn fail(&mut self, stage: &str, kind: &str, message: impl Into<String>) {
        self.success = false;
        self.errors.push(RunErrorEntry {
            stage: stage.to_string(),
            run_index: None,
            kind: kind.to_string(),
            message: message.into(),
        });
    }

    pub fn status(&self, cancelled: bool) -> RunStatus {
        if cancelled {
            RunStatus::Cancelled
        } else if self.success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        }
    }
}

fn sanitize_label(label: &str) -> String {
    let mut out: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(MAX_LOG_LABEL)
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Truncate a dynamic item to a readable run label.
pub(crate) fn item_label(item: &str) -> String {
    let label: String = item.chars().take(MAX_LOG_LABEL).collect();
    if label.len() < item.len() {
        format!("{label}...")
    } else {
        label
    }
}

impl StageEnv {
    pub fn name(&self) -> &str {
        &self.stage.name
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub(crate) fn resolve(&self, template: &str, bindings: &Bindings) -> String {
        let resolved = template::resolve(template, bindings);
        if !resolved.missing.is_empty() {
            debug!(stage = %self.stage.name, missing = ?resolved.missing, "prompt resolved with gaps");
        }
        resolved.text
    }

    /// Transcript log path for a run: `<log_dir>/<run_id>/<stage>-<label>.log`.
    pub(crate) fn log_path(&self, index: u32, label: &str) -> PathBuf {
        let stem = match self.stage.mode {
            // Item text may repeat after truncation; keep the index.
            StageMode::Dynamic { .. } => format!("{}-{}-{}", self.stage.name, index + 1, label),
            _ => format!("{}-{}", self.stage.name, label),
        };
        self.log_dir
            .join(self.run_id.to_string())
            .join(format!("{}.log", sanitize_label(&stem)))
    }

    fn request(&self, prompt: String, label: &str, working_dir: Option<PathBuf>, log_path: PathBuf) -> AgentRequest {
        AgentRequest {
            prompt,
            working_dir,
            timeout: self.timeout,
            label: label.to_string(),
            log_path: Some(log_path),
            cancel: Some(self.cancel.clone()),
        }
    }

    /// Invoke the agent once, inside a pooled checkout when isolated.
    async fn invoke(&self, index: u32, label: &str, prompt: String) -> RunOutcome {
        let log_path = self.log_path(index, label);
        let Some(pool) = &self.pool else {
            let request = self.request(prompt, label, self.working_dir.clone(), log_path);
            return self.runner.run(request).await;
        };

        let slot = tokio::select! {
            slot = pool.reserve() => slot,
            _ = crate::agent::wait_for_cancel(Some(self.cancel.clone())) => {
                return RunOutcome::failed(RunFailure::Cancelled, TokenUsage::default(), 0);
            }
        };
        // Not raced against cancellation; see `WorktreePool::fill`.
        let dir = match slot {
            Ok(slot) => pool.fill(slot).await,
            Err(e) => Err(e),
        };
        let dir = match dir {
            Ok(dir) => dir,
            Err(e) => {
                return RunOutcome::failed(
                    RunFailure::Checkout {
                        message: e.to_string(),
                    },
                    TokenUsage::default(),
                    0,
                )
            }
        };
        if self.is_cancelled() {
            pool.release(dir, false).await;
            return RunOutcome::failed(RunFailure::Cancelled, TokenUsage::default(), 0);
        }
        let request = self.request(prompt, label, Some(dir.path().to_path_buf()), log_path);
        let outcome = self.runner.run(request).await;
        pool.release(dir, self.retain_worktrees).await;
        outcome
    }

    /// Look up the reported artifact. A missing document fails the run.
    pub(crate) async fn fetch_artifact(&self, outcome: RunOutcome) -> (RunOutcome, Option<Artifact>) {
        let Some(id) = outcome.artifact_id.clone().filter(|_| outcome.success) else {
            return (outcome, None);
        };
        match self.documents.get(&id).await {
            Ok(doc) => (outcome, Some(Artifact::from(doc))),
            Err(StorageError::DocumentNotFound { .. }) => (outcome.into_missing_artifact(), None),
            Err(e) => {
                warn!(stage = %self.stage.name, id = %id, error = %e, "failed to load artifact");
                (outcome.into_missing_artifact(), None)
            }
        }
    }

    async fn persist(&self, record: &IndividualRunRecord) {
        if let Err(e) = self.recorder.put_individual(record).await {
            obs::emit_record_error("individual_run", &e);
        }
    }

    /// Execute one individual run end to end: record, invoke, parse, finalize.
    ///
    /// Returns `None` when the run was skipped because the workflow was
    /// cancelled before it started; no record is written in that case.
    pub async fn run_one(&self, index: u32, label: String, prompt: String) -> Option<RunResult> {
        if self.is_cancelled() {
            return None;
        }

        let mut record = IndividualRunRecord::new(
            self.stage_run_id.clone(),
            self.run_id.clone(),
            index,
            label.clone(),
            prompt.clone(),
        );
        self.persist(&record).await;
        self.progress.run_started(&self.stage.name);

        let start = Instant::now();
        let outcome = self.invoke(index, &label, prompt).await;
        let (outcome, artifact) = self.fetch_artifact(outcome).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let success = artifact.is_some();
        record.success = success;
        record.status = if success {
            RunStatus::Completed
        } else if matches!(outcome.failure, Some(RunFailure::Cancelled)) {
            RunStatus::Cancelled
        } else {
            RunStatus::Failed
        };
        record.output_ref = artifact.as_ref().map(|a| a.id.to_string());
        record.error_kind = outcome.failure.as_ref().map(|f| f.kind().to_string());
        record.error = outcome.failure.as_ref().map(|f| f.to_string());
        record.usage = outcome.usage;
        record.duration_ms = duration_ms;
        record.completed_at = Some(chrono::Utc::now());
        self.persist(&record).await;

        self.progress
            .run_finished(&self.stage.name, success, outcome.usage);
        obs::emit_run_finished(
            &self.stage.name,
            &label,
            success,
            outcome.failure.as_ref().map(|f| f.kind()),
            duration_ms,
        );

        Some(RunResult {
            index,
            label,
            record_id: record.individual_run_id,
            artifact,
            usage: outcome.usage,
            failure: outcome.failure,
        })
    }
}

/// Unwrap joined run tasks, logging tasks that panicked.
pub(crate) fn collect_joined(
    stage: &str,
    joined: Vec<Result<Option<RunResult>, JoinError>>,
) -> Vec<RunResult> {
    joined
        .into_iter()
        .filter_map(|r| match r {
            Ok(run) => run,
            Err(e) => {
                error!(stage = %stage, error = %e, "run task failed to complete");
                None
            }
        })
        .collect()
}

/// Content list binding for a set of artifacts.
pub(crate) fn contents(artifacts: &[Artifact]) -> Value {
    json!(artifacts.iter().map(|a| a.content.clone()).collect::<Vec<_>>())
}

/// Run the stage according to its mode.
pub async fn execute(env: Arc<StageEnv>, ctx: &ExecutionContext) -> StageResult {
    let start = Instant::now();
    let mut result = match env.stage.mode.clone() {
        StageMode::Single { prompt } => single::execute(&env, ctx, &prompt).await,
        StageMode::Parallel {
            prompt,
            runs,
            synthesis,
        } => {
            let runs = runs.unwrap_or(prompt.templates().len() as u32);
            parallel::execute(&env, ctx, prompt.templates(), runs, synthesis.as_deref()).await
        }
        StageMode::Iterative { prompt, runs } => iterative::execute(&env, ctx, &prompt, runs).await,
        StageMode::Adversarial {
            advocate,
            critic,
            synthesizer,
        } => {
            adversarial::execute(
                &env,
                ctx,
                advocate.as_deref(),
                critic.as_deref(),
                synthesizer.as_deref(),
            )
            .await
        }
        StageMode::Dynamic {
            prompt,
            discovery,
            item_var,
            synthesis,
        } => {
            dynamic::execute(&env, ctx, &prompt, &discovery, &item_var, synthesis.as_deref()).await
        }
    };
    result.duration_ms = start.elapsed().as_millis() as u64;
    result
}
