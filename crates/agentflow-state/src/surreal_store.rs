//! SurrealDB-backed `RunStore` and `DocumentStore` implementations
//!
//! Run records are persisted as-is; documents go through `schema::DocumentRow`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::debug;

use crate::connection::{self, StoreConfig};
use crate::error::StorageError;
use crate::schema::DocumentRow;
use crate::storage_traits::{
    Document, DocumentId, DocumentStore, IndividualRunRecord, NewDocument, RunFilter, RunId,
    RunStore, StageRunRecord, StorageResult, WorkflowRunRecord,
};

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Run `SELECT * FROM <table> WHERE <column> = $key`.
async fn select_where<T: DeserializeOwned>(
    db: &Surreal<Any>,
    table: &str,
    column: &str,
    key: &str,
) -> StorageResult<Vec<T>> {
    let sql = format!("SELECT * FROM {table} WHERE {column} = $key");
    let mut res = db
        .query(sql)
        .bind(("key", key.to_string()))
        .await
        .map_err(backend)?;
    res.take(0).map_err(backend)
}

/// Replace the row matching `column = key`, or create it.
async fn upsert_where<T>(
    db: &Surreal<Any>,
    table: &'static str,
    column: &str,
    key: &str,
    row: T,
) -> StorageResult<()>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let existing: Vec<T> = select_where(db, table, column, key).await?;
    if existing.is_empty() {
        let _created: Option<T> = db
            .create(table)
            .content(row)
            .await
            .map_err(backend)?;
    } else {
        let sql = format!("UPDATE {table} CONTENT $row WHERE {column} = $key");
        db.query(sql)
            .bind(("row", row))
            .bind(("key", key.to_string()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
    }
    Ok(())
}

/// SurrealDB-backed implementation of [`RunStore`].
#[derive(Clone)]
pub struct SurrealRunStore {
    db: Surreal<Any>,
}

impl SurrealRunStore {
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = connection::connect(&StoreConfig::in_memory()).await?;
        Ok(Self { db })
    }

    async fn fetch_run(&self, run_id: &RunId) -> StorageResult<WorkflowRunRecord> {
        let rows: Vec<WorkflowRunRecord> =
            select_where(&self.db, "workflow_runs", "run_id", &run_id.0).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }
}

#[async_trait]
impl RunStore for SurrealRunStore {
    async fn create_workflow_run(&self, record: &WorkflowRunRecord) -> StorageResult<()> {
        match self.fetch_run(&record.run_id).await {
            Ok(_) => {
                return Err(StorageError::Duplicate {
                    id: record.run_id.0.clone(),
                })
            }
            Err(StorageError::RunNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        debug!(run_id = %record.run_id, "creating workflow run");
        let _created: Option<WorkflowRunRecord> = self
            .db
            .create("workflow_runs")
            .content(record.clone())
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn update_workflow_run(&self, record: &WorkflowRunRecord) -> StorageResult<()> {
        let existing = self.fetch_run(&record.run_id).await?;
        if existing.status.is_terminal() {
            return Err(StorageError::InvalidRunState {
                run_id: record.run_id.0.clone(),
                status: existing.status.to_string(),
                expected: "pending or running".to_string(),
            });
        }

        self.db
            .query("UPDATE workflow_runs CONTENT $row WHERE run_id = $rid")
            .bind(("row", record.clone()))
            .bind(("rid", record.run_id.0.clone()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn get_workflow_run(&self, run_id: &RunId) -> StorageResult<WorkflowRunRecord> {
        self.fetch_run(run_id).await
    }

    async fn list_workflow_runs(
        &self,
        filter: &RunFilter,
    ) -> StorageResult<Vec<WorkflowRunRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM workflow_runs")
            .await
            .map_err(backend)?;
        let mut rows: Vec<WorkflowRunRecord> = res.take(0).map_err(backend)?;

        // Timestamps are stored as strings, so order here rather than in the query.
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .filter(|r| filter.matches(r))
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn put_stage_run(&self, record: &StageRunRecord) -> StorageResult<()> {
        self.fetch_run(&record.run_id).await?;
        upsert_where(
            &self.db,
            "stage_runs",
            "stage_run_id",
            &record.stage_run_id,
            record.clone(),
        )
        .await
    }

    async fn list_stage_runs(&self, run_id: &RunId) -> StorageResult<Vec<StageRunRecord>> {
        let mut rows: Vec<StageRunRecord> =
            select_where(&self.db, "stage_runs", "run_id", &run_id.0).await?;
        rows.sort_by_key(|s| s.stage_index);
        Ok(rows)
    }

    async fn put_individual_run(&self, record: &IndividualRunRecord) -> StorageResult<()> {
        let parents: Vec<StageRunRecord> =
            select_where(&self.db, "stage_runs", "stage_run_id", &record.stage_run_id).await?;
        if parents.is_empty() {
            return Err(StorageError::StageRunNotFound {
                stage_run_id: record.stage_run_id.clone(),
            });
        }
        upsert_where(
            &self.db,
            "individual_runs",
            "individual_run_id",
            &record.individual_run_id,
            record.clone(),
        )
        .await
    }

    async fn list_individual_runs(
        &self,
        stage_run_id: &str,
    ) -> StorageResult<Vec<IndividualRunRecord>> {
        let mut rows: Vec<IndividualRunRecord> =
            select_where(&self.db, "individual_runs", "stage_run_id", stage_run_id).await?;
        rows.sort_by_key(|r| r.index);
        Ok(rows)
    }
}

/// SurrealDB-backed implementation of [`DocumentStore`].
#[derive(Clone)]
pub struct SurrealDocumentStore {
    db: Surreal<Any>,
}

impl SurrealDocumentStore {
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    pub async fn in_memory() -> crate::Result<Self> {
        let db = connection::connect(&StoreConfig::in_memory()).await?;
        Ok(Self { db })
    }
}

#[async_trait]
impl DocumentStore for SurrealDocumentStore {
    async fn put(&self, doc: NewDocument) -> StorageResult<DocumentId> {
        let row = DocumentRow::new(doc);
        let id = DocumentId(row.doc_id.clone());
        debug!(doc_id = %id, digest = %row.digest, "storing document");

        let _created: Option<DocumentRow> = self
            .db
            .create("documents")
            .content(row)
            .await
            .map_err(backend)?;
        Ok(id)
    }

    async fn get(&self, id: &DocumentId) -> StorageResult<Document> {
        let rows: Vec<DocumentRow> = select_where(&self.db, "documents", "doc_id", id.as_str()).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::DocumentNotFound { id: id.0.clone() })?
            .into_document()
    }

    async fn contains(&self, id: &DocumentId) -> StorageResult<bool> {
        let rows: Vec<DocumentRow> = select_where(&self.db, "documents", "doc_id", id.as_str()).await?;
        Ok(!rows.is_empty())
    }
}
