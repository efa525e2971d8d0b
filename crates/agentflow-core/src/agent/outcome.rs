//! Outcome of one agent invocation.

use std::fmt;
use std::path::PathBuf;

use agentflow_state::{DocumentId, TokenUsage};
use serde::{Deserialize, Serialize};

/// Why an invocation did not produce a usable artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    /// The process could not be started.
    Spawn { message: String },
    /// The process exited unsuccessfully.
    Exit {
        code: Option<i32>,
        stderr_tail: String,
    },
    /// The process ran past its timeout and was killed.
    Timeout { millis: u64 },
    /// Clean exit, but no artifact identifier was reported.
    NoArtifact,
    /// An identifier was reported but the document store does not know it.
    ArtifactMissing { id: String },
    /// A working-directory checkout could not be provided.
    Checkout { message: String },
    /// The workflow run was cancelled while this invocation was in flight.
    Cancelled,
}

impl RunFailure {
    /// Stable kind string recorded on run records.
    pub fn kind(&self) -> &'static str {
        match self {
            RunFailure::Spawn { .. } => "spawn",
            RunFailure::Exit { .. } => "exit",
            RunFailure::Timeout { .. } => "timeout",
            RunFailure::NoArtifact => "no_artifact",
            RunFailure::ArtifactMissing { .. } => "artifact_missing",
            RunFailure::Checkout { .. } => "checkout",
            RunFailure::Cancelled => "cancelled",
        }
    }

    /// Whether re-running the same invocation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RunFailure::Timeout { .. })
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFailure::Spawn { message } => write!(f, "failed to start agent: {message}"),
            RunFailure::Exit { code, stderr_tail } => {
                match code {
                    Some(c) => write!(f, "agent exited with status {c}")?,
                    None => write!(f, "agent terminated by signal")?,
                }
                if !stderr_tail.is_empty() {
                    write!(f, ": {stderr_tail}")?;
                }
                Ok(())
            }
            RunFailure::Timeout { millis } => write!(
                f,
                "agent timed out after {:?}",
                std::time::Duration::from_millis(*millis)
            ),
            RunFailure::NoArtifact => write!(f, "no artifact produced"),
            RunFailure::ArtifactMissing { id } => {
                write!(f, "reported artifact {id} not found in document store")
            }
            RunFailure::Checkout { message } => write!(f, "checkout unavailable: {message}"),
            RunFailure::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of one agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub success: bool,
    pub artifact_id: Option<DocumentId>,
    pub usage: TokenUsage,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    pub failure: Option<RunFailure>,
    /// Transcript log, when one was written.
    pub log_path: Option<PathBuf>,
}

impl RunOutcome {
    pub fn succeeded(artifact_id: DocumentId, usage: TokenUsage, duration_ms: u64) -> Self {
        Self {
            success: true,
            artifact_id: Some(artifact_id),
            usage,
            duration_ms,
            exit_code: Some(0),
            failure: None,
            log_path: None,
        }
    }

    pub fn failed(failure: RunFailure, usage: TokenUsage, duration_ms: u64) -> Self {
        Self {
            success: false,
            artifact_id: None,
            usage,
            duration_ms,
            exit_code: None,
            failure: Some(failure),
            log_path: None,
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_log_path(mut self, path: Option<PathBuf>) -> Self {
        self.log_path = path;
        self
    }

    /// Turn a success into an `ArtifactMissing` failure.
    pub fn into_missing_artifact(mut self) -> Self {
        let id = self
            .artifact_id
            .take()
            .map(|id| id.to_string())
            .unwrap_or_default();
        self.success = false;
        self.failure = Some(RunFailure::ArtifactMissing { id });
        self
    }
}
