//! Storage trait definitions for agentflow
//!
//! These traits define the two storage seams the engine talks to:
//! - `DocumentStore`: artifacts produced by agents (put/get by identifier)
//! - `RunStore`: workflow/stage/individual run records
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// DocumentStore: agent artifacts
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier of a stored document (the "artifact id" agents report).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        DocumentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A document as handed to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDocument {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewDocument {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// A stored document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub digest: ContentDigest,
    pub created_at: DateTime<Utc>,
}

/// Artifact store shared with the agents.
///
/// Guarantees:
/// - `put` returns a fresh identifier; documents are never overwritten.
/// - `get` returns exactly what was stored, or `DocumentNotFound`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store a document and return its identifier.
    async fn put(&self, doc: NewDocument) -> StorageResult<DocumentId>;

    /// Retrieve a document by identifier.
    async fn get(&self, id: &DocumentId) -> StorageResult<Document>;

    /// Check whether an identifier exists.
    async fn contains(&self, id: &DocumentId) -> StorageResult<bool>;
}

// ---------------------------------------------------------------------------
// RunStore: workflow run records
// ---------------------------------------------------------------------------

/// Unique identifier for a workflow run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }

    /// First eight characters, used for branch and log names.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status shared by workflow, stage and individual runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Completed, failed and cancelled runs never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" | "canceled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Token and cost counters reported by an agent invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.cost_usd == 0.0
    }
}

impl std::ops::Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
            cost_usd: self.cost_usd + rhs.cost_usd,
        }
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for TokenUsage {
    fn sum<I: Iterator<Item = TokenUsage>>(iter: I) -> Self {
        iter.fold(TokenUsage::default(), |acc, u| acc + u)
    }
}

/// One entry in a run's error list. The underlying message is kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunErrorEntry {
    pub stage: String,
    pub run_index: Option<u32>,
    pub kind: String,
    pub message: String,
}

/// Persisted form of one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunRecord {
    pub run_id: RunId,
    pub workflow_name: String,
    pub status: RunStatus,
    /// Name of the stage currently (or last) executing.
    pub current_stage: Option<String>,
    pub current_stage_index: Option<u32>,
    pub stage_count: u32,
    /// Document id, or `tasks` / `inline` for ad-hoc inputs.
    pub input_ref: Option<String>,
    pub variables: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub isolated: bool,
    pub usage: TokenUsage,
    pub errors: Vec<RunErrorEntry>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRunRecord {
    /// Create a new record in `pending` state.
    pub fn new(workflow_name: impl Into<String>, stage_count: u32) -> Self {
        Self {
            run_id: RunId::new(),
            workflow_name: workflow_name.into(),
            status: RunStatus::Pending,
            current_stage: None,
            current_stage_index: None,
            stage_count,
            input_ref: None,
            variables: BTreeMap::new(),
            working_dir: None,
            isolated: false,
            usage: TokenUsage::default(),
            errors: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}

/// Persisted form of one stage execution inside a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRunRecord {
    pub stage_run_id: String,
    pub run_id: RunId,
    pub stage_name: String,
    pub stage_index: u32,
    pub mode: String,
    pub status: RunStatus,
    pub runs_total: u32,
    pub runs_completed: u32,
    pub runs_failed: u32,
    pub usage: TokenUsage,
    pub output_ref: Option<String>,
    pub synthesis_ref: Option<String>,
    pub errors: Vec<RunErrorEntry>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageRunRecord {
    pub fn new(
        run_id: RunId,
        stage_name: impl Into<String>,
        stage_index: u32,
        mode: impl Into<String>,
    ) -> Self {
        Self {
            stage_run_id: uuid::Uuid::new_v4().to_string(),
            run_id,
            stage_name: stage_name.into(),
            stage_index,
            mode: mode.into(),
            status: RunStatus::Running,
            runs_total: 0,
            runs_completed: 0,
            runs_failed: 0,
            usage: TokenUsage::default(),
            output_ref: None,
            synthesis_ref: None,
            errors: Vec::new(),
            duration_ms: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Persisted form of one agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndividualRunRecord {
    pub individual_run_id: String,
    pub stage_run_id: String,
    pub run_id: RunId,
    pub index: u32,
    pub label: String,
    pub prompt: String,
    pub status: RunStatus,
    pub success: bool,
    pub output_ref: Option<String>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub usage: TokenUsage,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IndividualRunRecord {
    /// Create a record in `running` state, before the process is spawned.
    pub fn new(
        stage_run_id: impl Into<String>,
        run_id: RunId,
        index: u32,
        label: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            individual_run_id: uuid::Uuid::new_v4().to_string(),
            stage_run_id: stage_run_id.into(),
            run_id,
            index,
            label: label.into(),
            prompt: prompt.into(),
            status: RunStatus::Running,
            success: false,
            output_ref: None,
            error_kind: None,
            error: None,
            usage: TokenUsage::default(),
            duration_ms: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Filter for [`RunStore::list_workflow_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub workflow_name: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn matches(&self, record: &WorkflowRunRecord) -> bool {
        self.workflow_name
            .as_deref()
            .map(|n| record.workflow_name == n)
            .unwrap_or(true)
            && self.status.map(|s| record.status == s).unwrap_or(true)
    }
}

/// Workflow run record store.
///
/// Guarantees:
/// - A workflow run transitions Pending → Running → Completed | Failed | Cancelled.
/// - Terminal workflow runs are immutable.
/// - `list_workflow_runs` returns newest first; stage runs come back ordered
///   by stage index and individual runs by index.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new workflow run. Fails with `Duplicate` if the id exists.
    async fn create_workflow_run(&self, record: &WorkflowRunRecord) -> StorageResult<()>;

    /// Replace a non-terminal workflow run.
    async fn update_workflow_run(&self, record: &WorkflowRunRecord) -> StorageResult<()>;

    /// Retrieve a workflow run by id.
    async fn get_workflow_run(&self, run_id: &RunId) -> StorageResult<WorkflowRunRecord>;

    /// List workflow runs, newest first.
    async fn list_workflow_runs(&self, filter: &RunFilter)
        -> StorageResult<Vec<WorkflowRunRecord>>;

    /// Insert or replace a stage run (keyed by `stage_run_id`).
    async fn put_stage_run(&self, record: &StageRunRecord) -> StorageResult<()>;

    /// All stage runs of a workflow run, ordered by stage index.
    async fn list_stage_runs(&self, run_id: &RunId) -> StorageResult<Vec<StageRunRecord>>;

    /// Insert or replace an individual run (keyed by `individual_run_id`).
    async fn put_individual_run(&self, record: &IndividualRunRecord) -> StorageResult<()>;

    /// All individual runs of a stage run, ordered by index.
    async fn list_individual_runs(
        &self,
        stage_run_id: &str,
    ) -> StorageResult<Vec<IndividualRunRecord>>;
}
