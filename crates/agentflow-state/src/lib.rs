//! agentflow-state: persistence for the agentflow workflow engine
//!
//! Two storage seams:
//!
//! - `DocumentStore`: artifacts agents produce, addressed by an opaque id
//! - `RunStore`: workflow, stage and individual run records
//!
//! In-memory fakes live in [`fakes`]; SurrealDB implementations in
//! [`surreal_store`].

mod connection;
mod error;
pub mod fakes;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use connection::{connect, StoreConfig};
pub use error::{StateError, StorageError};
pub use storage_traits::{
    ContentDigest, Document, DocumentId, DocumentStore, IndividualRunRecord, NewDocument,
    RunErrorEntry, RunFilter, RunId, RunStatus, RunStore, StageRunRecord, StorageResult,
    TokenUsage, WorkflowRunRecord,
};
pub use surreal_store::{SurrealDocumentStore, SurrealRunStore};

/// Result type for agentflow-state operations
pub type Result<T> = std::result::Result<T, StateError>;
