//! Run lifecycle adapter: keeps the persisted `WorkflowRunRecord` in step
//! with execution and writes stage and individual run records.

use std::sync::Arc;

use agentflow_state::{
    IndividualRunRecord, RunErrorEntry, RunId, RunStatus, RunStore, StageRunRecord,
    StorageResult, TokenUsage, WorkflowRunRecord,
};
use tokio::sync::Mutex;

/// Records one workflow run into a [`RunStore`].
///
/// Usage:
/// 1. [`RunRecorder::start`] creates the run and marks it running.
/// 2. [`RunRecorder::stage_started`] / [`RunRecorder::put_stage`] /
///    [`RunRecorder::put_individual`] as execution proceeds.
/// 3. [`RunRecorder::stage_finished`] folds stage usage and errors into the run.
/// 4. [`RunRecorder::finish`] writes the terminal status.
pub struct RunRecorder {
    store: Arc<dyn RunStore>,
    run_id: RunId,
    record: Mutex<WorkflowRunRecord>,
}

impl RunRecorder {
    /// Persist `record` as pending, then move it to running.
    pub async fn start(store: Arc<dyn RunStore>, mut record: WorkflowRunRecord) -> StorageResult<Self> {
        store.create_workflow_run(&record).await?;
        record.mark_running();
        store.update_workflow_run(&record).await?;
        crate::obs::emit_workflow_started(
            &record.run_id.to_string(),
            &record.workflow_name,
            record.stage_count as usize,
        );
        Ok(Self {
            store,
            run_id: record.run_id.clone(),
            record: Mutex::new(record),
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Point the run at the stage about to execute.
    pub async fn stage_started(&self, stage: &str, index: u32) -> StorageResult<()> {
        let mut record = self.record.lock().await;
        record.current_stage = Some(stage.to_string());
        record.current_stage_index = Some(index);
        self.store.update_workflow_run(&record).await
    }

    pub async fn put_stage(&self, stage: &StageRunRecord) -> StorageResult<()> {
        self.store.put_stage_run(stage).await
    }

    pub async fn put_individual(&self, run: &IndividualRunRecord) -> StorageResult<()> {
        self.store.put_individual_run(run).await
    }

    /// Fold a finished stage's usage and errors into the run totals.
    pub async fn stage_finished(&self, usage: TokenUsage, errors: &[RunErrorEntry]) -> StorageResult<()> {
        let mut record = self.record.lock().await;
        record.usage += usage;
        record.errors.extend_from_slice(errors);
        self.store.update_workflow_run(&record).await
    }

    /// Add an error not tied to a stage result.
    pub async fn add_error(&self, error: RunErrorEntry) -> StorageResult<()> {
        let mut record = self.record.lock().await;
        record.errors.push(error);
        self.store.update_workflow_run(&record).await
    }

    /// Write the terminal status. Returns the final record.
    pub async fn finish(&self, status: RunStatus, duration_ms: u64) -> StorageResult<WorkflowRunRecord> {
        let mut record = self.record.lock().await;
        record.finish(status);
        crate::obs::emit_workflow_finished(
            &record.run_id.to_string(),
            status.as_str(),
            duration_ms,
            &record.usage,
        );
        self.store.update_workflow_run(&record).await?;
        Ok(record.clone())
    }

    pub async fn snapshot(&self) -> WorkflowRunRecord {
        self.record.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_state::fakes::MemoryRunStore;
    use agentflow_state::StorageError;

    #[tokio::test]
    async fn test_lifecycle_is_persisted() {
        let store = Arc::new(MemoryRunStore::new());
        let recorder = RunRecorder::start(store.clone(), WorkflowRunRecord::new("wf", 2))
            .await
            .unwrap();

        let persisted = store.get_workflow_run(recorder.run_id()).await.unwrap();
        assert_eq!(persisted.status, RunStatus::Running);
        assert!(persisted.started_at.is_some());

        recorder.stage_started("plan", 0).await.unwrap();
        let stage = StageRunRecord::new(recorder.run_id().clone(), "plan", 0, "single");
        recorder.put_stage(&stage).await.unwrap();
        let usage = TokenUsage {
            input_tokens: 4,
            output_tokens: 2,
            cost_usd: 0.01,
        };
        let error = RunErrorEntry {
            stage: "plan".into(),
            run_index: Some(0),
            kind: "exit".into(),
            message: "agent exited with status 1".into(),
        };
        recorder.stage_finished(usage, &[error]).await.unwrap();

        let done = recorder.finish(RunStatus::Failed, 10).await.unwrap();
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.current_stage.as_deref(), Some("plan"));
        assert_eq!(done.usage, usage);
        assert_eq!(done.errors.len(), 1);

        let persisted = store.get_workflow_run(recorder.run_id()).await.unwrap();
        assert_eq!(persisted.status, RunStatus::Failed);
        assert!(persisted.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_run_rejects_updates() {
        let store = Arc::new(MemoryRunStore::new());
        let recorder = RunRecorder::start(store, WorkflowRunRecord::new("wf", 1))
            .await
            .unwrap();
        recorder.finish(RunStatus::Completed, 1).await.unwrap();
        let err = recorder.stage_started("late", 1).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidRunState { .. }));
    }
}
