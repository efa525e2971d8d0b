//! Error taxonomy for the agentflow engine.

use agentflow_state::StorageError;

/// Invalid workflow or engine configuration. Raised before anything runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("workflow name must not be empty")]
    EmptyWorkflowName,

    #[error("workflow {workflow} has no stages")]
    NoStages { workflow: String },

    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("stage {stage}: {reason}")]
    InvalidStage { stage: String, reason: String },

    #[error("failed to parse {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("invalid value for {key}: {value}")]
    InvalidSetting { key: String, value: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn stage(stage: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidStage {
            stage: stage.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors from the version-control checkout provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckoutError {
    /// Lock contention and similar conditions worth retrying.
    #[error("transient checkout failure: {0}")]
    Transient(String),

    #[error("checkout failed: {0}")]
    Fatal(String),

    #[error("worktree pool is shut down")]
    PoolClosed,
}

impl CheckoutError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CheckoutError::Transient(_))
    }
}

/// Engine errors.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("checkout error: {0}")]
    Checkout(#[from] CheckoutError),

    #[error("synthesis requires at least one output")]
    EmptySynthesis,

    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("discovery command failed: {0}")]
    Discovery(String),

    #[error("workflow run was cancelled")]
    Cancelled,

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Short machine-readable kind, used in run error lists.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowError::Config(_) => "config",
            FlowError::Storage(_) => "storage",
            FlowError::Checkout(_) => "checkout",
            FlowError::EmptySynthesis | FlowError::Synthesis(_) => "synthesis",
            FlowError::Discovery(_) => "discovery",
            FlowError::Cancelled => "cancelled",
            FlowError::RunNotFound(_) => "not_found",
            FlowError::Io(_) => "io",
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, FlowError>;
