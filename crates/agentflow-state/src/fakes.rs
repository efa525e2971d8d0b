//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryDocumentStore` and `MemoryRunStore` that satisfy the trait
//! contracts without any external dependencies.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryDocumentStore
// ---------------------------------------------------------------------------

/// In-memory document store handing out sequential numeric identifiers.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<HashMap<String, Document>>,
    next_id: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, doc: NewDocument) -> StorageResult<DocumentId> {
        let id = DocumentId((self.next_id.fetch_add(1, Ordering::SeqCst) + 1).to_string());
        let document = Document {
            id: id.clone(),
            digest: ContentDigest::from_bytes(doc.content.as_bytes()),
            title: doc.title,
            content: doc.content,
            tags: doc.tags,
            created_at: Utc::now(),
        };
        self.docs
            .lock()
            .unwrap()
            .insert(id.0.clone(), document);
        Ok(id)
    }

    async fn get(&self, id: &DocumentId) -> StorageResult<Document> {
        self.docs
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| StorageError::DocumentNotFound { id: id.0.clone() })
    }

    async fn contains(&self, id: &DocumentId) -> StorageResult<bool> {
        Ok(self.docs.lock().unwrap().contains_key(id.as_str()))
    }
}

// ---------------------------------------------------------------------------
// MemoryRunStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RunTables {
    /// Insertion order doubles as creation order.
    workflow_runs: Vec<WorkflowRunRecord>,
    stage_runs: HashMap<String, StageRunRecord>,
    individual_runs: HashMap<String, IndividualRunRecord>,
}

/// In-memory run store.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    tables: Mutex<RunTables>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every individual run across all stages (test inspection helper).
    pub fn all_individual_runs(&self) -> Vec<IndividualRunRecord> {
        let tables = self.tables.lock().unwrap();
        let mut runs: Vec<_> = tables.individual_runs.values().cloned().collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.index.cmp(&b.index)));
        runs
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_workflow_run(&self, record: &WorkflowRunRecord) -> StorageResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables
            .workflow_runs
            .iter()
            .any(|r| r.run_id == record.run_id)
        {
            return Err(StorageError::Duplicate {
                id: record.run_id.0.clone(),
            });
        }
        tables.workflow_runs.push(record.clone());
        Ok(())
    }

    async fn update_workflow_run(&self, record: &WorkflowRunRecord) -> StorageResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let existing = tables
            .workflow_runs
            .iter_mut()
            .find(|r| r.run_id == record.run_id)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: record.run_id.0.clone(),
            })?;
        if existing.status.is_terminal() {
            return Err(StorageError::InvalidRunState {
                run_id: record.run_id.0.clone(),
                status: existing.status.to_string(),
                expected: "pending or running".to_string(),
            });
        }
        *existing = record.clone();
        Ok(())
    }

    async fn get_workflow_run(&self, run_id: &RunId) -> StorageResult<WorkflowRunRecord> {
        let tables = self.tables.lock().unwrap();
        tables
            .workflow_runs
            .iter()
            .find(|r| &r.run_id == run_id)
            .cloned()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn list_workflow_runs(
        &self,
        filter: &RunFilter,
    ) -> StorageResult<Vec<WorkflowRunRecord>> {
        let tables = self.tables.lock().unwrap();
        let records = tables
            .workflow_runs
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(records)
    }

    async fn put_stage_run(&self, record: &StageRunRecord) -> StorageResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if !tables
            .workflow_runs
            .iter()
            .any(|r| r.run_id == record.run_id)
        {
            return Err(StorageError::RunNotFound {
                run_id: record.run_id.0.clone(),
            });
        }
        tables
            .stage_runs
            .insert(record.stage_run_id.clone(), record.clone());
        Ok(())
    }

    async fn list_stage_runs(&self, run_id: &RunId) -> StorageResult<Vec<StageRunRecord>> {
        let tables = self.tables.lock().unwrap();
        let mut stages: Vec<_> = tables
            .stage_runs
            .values()
            .filter(|s| &s.run_id == run_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.stage_index);
        Ok(stages)
    }

    async fn put_individual_run(&self, record: &IndividualRunRecord) -> StorageResult<()> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.stage_runs.contains_key(&record.stage_run_id) {
            return Err(StorageError::StageRunNotFound {
                stage_run_id: record.stage_run_id.clone(),
            });
        }
        tables
            .individual_runs
            .insert(record.individual_run_id.clone(), record.clone());
        Ok(())
    }

    async fn list_individual_runs(
        &self,
        stage_run_id: &str,
    ) -> StorageResult<Vec<IndividualRunRecord>> {
        let tables = self.tables.lock().unwrap();
        let mut runs: Vec<_> = tables
            .individual_runs
            .values()
            .filter(|r| r.stage_run_id == stage_run_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.index);
        Ok(runs)
    }
}
