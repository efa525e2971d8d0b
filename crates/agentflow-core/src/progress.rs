//! Live progress of a workflow run, and its reconstruction from records.

use std::sync::Mutex;

use agentflow_state::{
    IndividualRunRecord, RunErrorEntry, RunId, RunStatus, StageRunRecord, TokenUsage,
    WorkflowRunRecord,
};
use serde::Serialize;

/// Counters for one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageProgress {
    pub name: String,
    pub mode: String,
    pub status: RunStatus,
    pub runs_total: u32,
    pub runs_running: u32,
    pub runs_completed: u32,
    pub runs_failed: u32,
    pub usage: TokenUsage,
}

impl StageProgress {
    fn new(name: &str, mode: &str, runs_total: u32) -> Self {
        Self {
            name: name.to_string(),
            mode: mode.to_string(),
            status: RunStatus::Running,
            runs_total,
            runs_running: 0,
            runs_completed: 0,
            runs_failed: 0,
            usage: TokenUsage::default(),
        }
    }
}

/// Status report for one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    pub run_id: RunId,
    pub workflow_name: String,
    pub status: RunStatus,
    pub current_stage: Option<String>,
    pub stages: Vec<StageProgress>,
    pub usage: TokenUsage,
    pub errors: Vec<RunErrorEntry>,
}

impl ProgressReport {
    /// Rebuild a report from persisted records.
    ///
    /// `stages` pairs each stage run with its individual runs.
    pub fn from_records(
        run: &WorkflowRunRecord,
        stages: &[(StageRunRecord, Vec<IndividualRunRecord>)],
    ) -> Self {
        let stages = stages
            .iter()
            .map(|(stage, runs)| {
                let finished = |success: bool| {
                    runs.iter()
                        .filter(|r| r.status.is_terminal() && r.success == success)
                        .count() as u32
                };
                StageProgress {
                    name: stage.stage_name.clone(),
                    mode: stage.mode.clone(),
                    status: stage.status,
                    runs_total: stage.runs_total,
                    runs_running: runs.iter().filter(|r| !r.status.is_terminal()).count() as u32,
                    runs_completed: finished(true),
                    runs_failed: finished(false),
                    usage: stage.usage,
                }
            })
            .collect();
        Self {
            run_id: run.run_id.clone(),
            workflow_name: run.workflow_name.clone(),
            status: run.status,
            current_stage: run.current_stage.clone(),
            stages,
            usage: run.usage,
            errors: run.errors.clone(),
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageProgress> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Thread-safe live counters, updated by stage executors while they run.
#[derive(Debug)]
pub struct ProgressTracker {
    report: Mutex<ProgressReport>,
}

impl ProgressTracker {
    pub fn new(run_id: RunId, workflow_name: impl Into<String>) -> Self {
        Self {
            report: Mutex::new(ProgressReport {
                run_id,
                workflow_name: workflow_name.into(),
                status: RunStatus::Running,
                current_stage: None,
                stages: Vec::new(),
                usage: TokenUsage::default(),
                errors: Vec::new(),
            }),
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut ProgressReport) -> R) -> R {
        let mut report = self.report.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut report)
    }

    fn update_stage(&self, stage: &str, f: impl FnOnce(&mut StageProgress)) {
        self.update(|report| {
            if let Some(s) = report.stages.iter_mut().find(|s| s.name == stage) {
                f(s);
            }
        });
    }

    pub fn stage_started(&self, stage: &str, mode: &str, runs_total: Option<u32>) {
        self.update(|report| {
            report.current_stage = Some(stage.to_string());
            report
                .stages
                .push(StageProgress::new(stage, mode, runs_total.unwrap_or(0)));
        });
    }

    pub fn set_runs_total(&self, stage: &str, total: u32) {
        self.update_stage(stage, |s| s.runs_total = total);
    }

    pub fn run_started(&self, stage: &str) {
        self.update_stage(stage, |s| s.runs_running += 1);
    }

    pub fn run_finished(&self, stage: &str, success: bool, usage: TokenUsage) {
        self.update_stage(stage, |s| {
            s.runs_running = s.runs_running.saturating_sub(1);
            if success {
                s.runs_completed += 1;
            } else {
                s.runs_failed += 1;
            }
            s.usage += usage;
        });
        self.update(|report| report.usage += usage);
    }

    /// Usage not tied to an individual run (synthesis).
    pub fn add_usage(&self, stage: &str, usage: TokenUsage) {
        self.update_stage(stage, |s| s.usage += usage);
        self.update(|report| report.usage += usage);
    }

    pub fn stage_finished(&self, stage: &str, status: RunStatus, errors: &[RunErrorEntry]) {
        self.update_stage(stage, |s| s.status = status);
        self.update(|report| report.errors.extend_from_slice(errors));
    }

    pub fn finish(&self, status: RunStatus) {
        self.update(|report| report.status = status);
    }

    pub fn snapshot(&self) -> ProgressReport {
        self.update(|report| report.clone())
    }
}
