//! Walks a workflow's stages, dispatching each to its executor.
//!
//! Stages run strictly in order. Each stage's successful output is merged
//! into the execution context under the stage name before the next stage
//! starts. Run records are written as execution proceeds so a status query
//! from another process can reconstruct progress.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use agentflow_state::{
    DocumentStore, RunErrorEntry, RunFilter, RunId, RunStatus, RunStore, StageRunRecord,
    StorageError, WorkflowRunRecord,
};
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, warn, Instrument};

use crate::agent::AgentRunner;
use crate::config::EngineConfig;
use crate::context::{ExecutionContext, StageOutput, WorkflowInput};
use crate::domain::{ConfigError, FlowError, Result, StageConfig, WorkflowDefinition};
use crate::obs;
use crate::progress::{ProgressReport, ProgressTracker};
use crate::recording::RunRecorder;
use crate::stage::{self, StageEnv, StageResult};
use crate::worktree::{CheckoutProvider, PoolConfig, WorktreePool};

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Override the workflow's default variables.
    pub variables: BTreeMap<String, String>,
    /// Give every run its own checkout.
    pub isolate: bool,
    /// Concurrency override for every stage.
    pub concurrency: Option<usize>,
    pub working_dir: Option<PathBuf>,
    /// Overrides the engine's `retain_worktrees`.
    pub retain_worktrees: Option<bool>,
    /// Use this id instead of generating one, so callers can query or
    /// cancel the run while `execute` is still pending.
    pub run_id: Option<RunId>,
}

struct LiveRun {
    progress: Arc<ProgressTracker>,
    cancel: watch::Sender<bool>,
}

/// The workflow engine.
pub struct Orchestrator {
    config: EngineConfig,
    runner: Arc<dyn AgentRunner>,
    documents: Arc<dyn DocumentStore>,
    runs: Arc<dyn RunStore>,
    checkouts: Option<Arc<dyn CheckoutProvider>>,
    live: Mutex<HashMap<RunId, LiveRun>>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        runner: Arc<dyn AgentRunner>,
        documents: Arc<dyn DocumentStore>,
        runs: Arc<dyn RunStore>,
    ) -> Self {
        Self {
            config,
            runner,
            documents,
            runs,
            checkouts: None,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Enable isolated runs.
    pub fn with_checkout_provider(mut self, provider: Arc<dyn CheckoutProvider>) -> Self {
        self.checkouts = Some(provider);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, LiveRun>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live progress handle of a run still executing in this process.
    pub fn progress(&self, run_id: &RunId) -> Option<Arc<ProgressTracker>> {
        self.live().get(run_id).map(|r| Arc::clone(&r.progress))
    }

    async fn load_input(&self, input: &WorkflowInput, ctx: &mut ExecutionContext) -> Result<()> {
        match input {
            WorkflowInput::Document(id) => {
                let doc = self.documents.get(id).await?;
                ctx.set_input_document(doc);
            }
            WorkflowInput::Tasks(tasks) => ctx.set_tasks(tasks.clone()),
            WorkflowInput::Inline { title, content } => ctx.set_input(title.clone(), content.clone()),
        }
        Ok(())
    }

    /// Execute `workflow` against `input` to completion.
    ///
    /// Configuration problems are reported before any record is written.
    /// Once the run has started, stage failures are recorded on the returned
    /// record rather than returned as errors; `Err` after that point means
    /// the run records themselves could not be written.
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        input: WorkflowInput,
        options: RunOptions,
    ) -> Result<WorkflowRunRecord> {
        workflow.validate()?;
        if options.isolate && self.checkouts.is_none() {
            return Err(ConfigError::InvalidSetting {
                key: "isolate".to_string(),
                value: "no checkout provider configured".to_string(),
            }
            .into());
        }

        let mut ctx = ExecutionContext::new();
        self.load_input(&input, &mut ctx).await?;
        let mut variables = workflow.variables.clone();
        variables.extend(options.variables.clone());
        for (name, value) in &variables {
            ctx.set_variable(name.clone(), value.clone());
        }
        ctx.set_working_dir(options.working_dir.clone());
        ctx.set_concurrency_override(options.concurrency);

        let mut record = WorkflowRunRecord::new(&workflow.name, workflow.stages.len() as u32);
        if let Some(id) = &options.run_id {
            record.run_id = id.clone();
        }
        record.input_ref = Some(input.input_ref());
        record.variables = variables;
        record.working_dir = options.working_dir.clone();
        record.isolated = options.isolate;
        let run_id = record.run_id.clone();

        let recorder = Arc::new(RunRecorder::start(Arc::clone(&self.runs), record).await?);
        let progress = Arc::new(ProgressTracker::new(run_id.clone(), &workflow.name));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.live().insert(
            run_id.clone(),
            LiveRun {
                progress: Arc::clone(&progress),
                cancel: cancel_tx,
            },
        );

        let start = Instant::now();
        let outcome = self
            .run_stages(workflow, &mut ctx, &recorder, &progress, &options, cancel_rx)
            .instrument(obs::run_span(&run_id.to_string()))
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let finished = match outcome {
            Ok(status) => {
                progress.finish(status);
                recorder.finish(status, duration_ms).await
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "workflow run aborted");
                let entry = RunErrorEntry {
                    stage: recorder.snapshot().await.current_stage.unwrap_or_default(),
                    run_index: None,
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                };
                if let Err(record_err) = recorder.add_error(entry).await {
                    obs::emit_record_error("workflow_run", &record_err);
                }
                progress.finish(RunStatus::Failed);
                if let Err(record_err) = recorder.finish(RunStatus::Failed, duration_ms).await {
                    obs::emit_record_error("workflow_run", &record_err);
                }
                self.live().remove(&run_id);
                return Err(e);
            }
        };
        self.live().remove(&run_id);
        Ok(finished?)
    }

    async fn run_stages(
        &self,
        workflow: &WorkflowDefinition,
        ctx: &mut ExecutionContext,
        recorder: &Arc<RunRecorder>,
        progress: &Arc<ProgressTracker>,
        options: &RunOptions,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunStatus> {
        let run_id = recorder.run_id().clone();
        let retain = options
            .retain_worktrees
            .unwrap_or(self.config.retain_worktrees);
        let mut next_checkout = 1;

        for (index, stage) in workflow.stages.iter().enumerate() {
            if *cancel.borrow() {
                return Ok(RunStatus::Cancelled);
            }
            let index = index as u32;
            let planned = stage.mode.planned_runs();
            recorder.stage_started(&stage.name, index).await?;
            let mut stage_record =
                StageRunRecord::new(run_id.clone(), &stage.name, index, stage.mode.as_str());
            stage_record.runs_total = planned.unwrap_or(0);
            recorder.put_stage(&stage_record).await?;
            progress.stage_started(&stage.name, stage.mode.as_str(), planned);
            obs::emit_stage_started(
                &run_id.to_string(),
                &stage.name,
                stage.mode.as_str(),
                planned,
            );

            let concurrency = self
                .config
                .effective_concurrency(ctx.concurrency_override(), stage.concurrency);
            let pool = self.stage_pool(&run_id, options.isolate, concurrency, next_checkout);

            let env = Arc::new(StageEnv {
                run_id: run_id.clone(),
                stage: stage.clone(),
                stage_run_id: stage_record.stage_run_id.clone(),
                runner: Arc::clone(&self.runner),
                documents: Arc::clone(&self.documents),
                recorder: Arc::clone(recorder),
                progress: Arc::clone(progress),
                pool: pool.clone(),
                working_dir: ctx.working_dir().cloned(),
                timeout: self.config.stage_timeout(stage),
                discovery_timeout: self.config.discovery_timeout(),
                log_dir: self.config.log_dir.clone(),
                cancel: cancel.clone(),
                concurrency,
                retain_worktrees: retain,
            });
            let result = stage::execute(env, ctx)
                .instrument(obs::stage_span(&run_id.to_string(), &stage.name))
                .await;

            if let Some(pool) = pool {
                next_checkout = pool.next_index();
                let removed = pool.shutdown().await;
                debug!(stage = %stage.name, removed, "stage checkouts cleaned up");
            }

            let cancelled = *cancel.borrow();
            let status = result.status(cancelled);
            finalize_stage_record(&mut stage_record, &result, status);
            recorder.put_stage(&stage_record).await?;
            recorder.stage_finished(result.usage, &result.errors).await?;
            progress.stage_finished(&stage.name, status, &result.errors);
            obs::emit_stage_finished(
                &run_id.to_string(),
                &stage.name,
                result.success,
                result.runs_completed,
                result.runs_failed,
                result.duration_ms,
            );

            if cancelled {
                return Ok(RunStatus::Cancelled);
            }
            if !self.merge_stage(stage, result, ctx) {
                return Ok(RunStatus::Failed);
            }
        }
        Ok(RunStatus::Completed)
    }

    /// Merge a stage's output into the context. Returns whether the run
    /// should continue.
    fn merge_stage(&self, stage: &StageConfig, result: StageResult, ctx: &mut ExecutionContext) -> bool {
        if result.success {
            ctx.record_stage_output(
                stage.name.clone(),
                StageOutput {
                    artifact: result.output,
                    outputs: result.outputs,
                    synthesis: result.synthesis,
                },
            );
            return true;
        }
        if stage.continue_on_failure {
            warn!(stage = %stage.name, "stage failed; continuing without its output");
            return true;
        }
        false
    }

    fn stage_pool(
        &self,
        run_id: &RunId,
        isolate: bool,
        capacity: usize,
        first_index: usize,
    ) -> Option<Arc<WorktreePool>> {
        if !isolate {
            return None;
        }
        let provider = self.checkouts.as_ref()?;
        Some(Arc::new(WorktreePool::new(
            Arc::clone(provider),
            PoolConfig {
                root: self.config.worktree_dir.join(run_id.short()),
                branch_prefix: format!("agentflow/{}", run_id.short()),
                capacity,
                first_index,
                retry: self.config.checkout_retry,
            },
        )))
    }

    /// Progress of a run: live while it executes here, otherwise rebuilt
    /// from the persisted records.
    pub async fn status(&self, run_id: &RunId) -> Result<ProgressReport> {
        if let Some(progress) = self.progress(run_id) {
            return Ok(progress.snapshot());
        }
        let run = self
            .runs
            .get_workflow_run(run_id)
            .await
            .map_err(|e| match e {
                StorageError::RunNotFound { run_id } => FlowError::RunNotFound(run_id),
                other => other.into(),
            })?;
        let mut stages = Vec::new();
        for stage in self.runs.list_stage_runs(run_id).await? {
            let runs = self.runs.list_individual_runs(&stage.stage_run_id).await?;
            stages.push((stage, runs));
        }
        Ok(ProgressReport::from_records(&run, &stages))
    }

    /// Recent runs, newest first.
    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRunRecord>> {
        Ok(self.runs.list_workflow_runs(filter).await?)
    }

    /// Signal a running workflow to stop. In-flight agent processes are
    /// killed; runs that have not started never start.
    ///
    /// Returns false if the run is not executing in this process.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        match self.live().get(run_id) {
            Some(run) => {
                warn!(run_id = %run_id, "cancelling workflow run");
                run.cancel.send(true).is_ok()
            }
            None => false,
        }
    }

    /// Cancel every run executing in this process.
    pub fn cancel_all(&self) -> usize {
        let live = self.live();
        for (run_id, run) in live.iter() {
            warn!(run_id = %run_id, "cancelling workflow run");
            let _ = run.cancel.send(true);
        }
        live.len()
    }
}

fn finalize_stage_record(record: &mut StageRunRecord, result: &StageResult, status: RunStatus) {
    record.status = status;
    record.runs_total = result.runs_total;
    record.runs_completed = result.runs_completed;
    record.runs_failed = result.runs_failed;
    record.usage = result.usage;
    record.output_ref = result.output.as_ref().map(|a| a.id.to_string());
    record.synthesis_ref = result.synthesis.as_ref().map(|a| a.id.to_string());
    record.errors = result.errors.clone();
    record.duration_ms = result.duration_ms;
    record.completed_at = Some(Utc::now());
}
