//! Errors for the run and document stores.
//!
//! [`StateError`] covers opening a store; [`StorageError`] is what the
//! storage traits return once a store is up.

use thiserror::Error;

/// Opening the SurrealDB store failed.
#[derive(Error, Debug)]
pub enum StateError {
    /// The URL could not be reached, or namespace/database selection failed.
    #[error("cannot open store: {0}")]
    Connection(String),

    /// A table or index definition was rejected.
    #[error("cannot define store schema: {0}")]
    SchemaSetup(String),
}

/// Errors returned through the [`crate::storage_traits`] contracts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("workflow run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("stage run not found: {stage_run_id}")]
    StageRunNotFound { stage_run_id: String },

    #[error("document not found: {id}")]
    DocumentNotFound { id: String },

    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    #[error("duplicate record: {id}")]
    Duplicate { id: String },

    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}
