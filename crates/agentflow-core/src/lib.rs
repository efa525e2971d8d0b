//! agentflow core library
//!
//! The workflow orchestration engine: runs multi-stage workflows of external
//! coding-agent invocations, resolves prompt templates between stages,
//! synthesizes parallel outputs and isolates concurrent runs in disposable
//! checkouts.

pub mod agent;
pub mod config;
pub mod context;
pub mod domain;
pub mod fakes;
pub mod git;
pub mod obs;
pub mod orchestrator;
pub mod progress;
pub mod recording;
pub mod registry;
pub mod retry;
pub mod stage;
pub mod synthesis;
pub mod telemetry;
pub mod template;
pub mod worktree;

pub use agent::{
    AgentCommand, AgentRequest, AgentRunner, ProcessAgentRunner, PromptDelivery, RunFailure,
    RunOutcome,
};
pub use config::{EngineConfig, DEFAULT_CONCURRENCY};
pub use context::{ExecutionContext, StageOutput, WorkflowInput};
pub use domain::{
    Artifact, CheckoutError, ConfigError, FlowError, PromptSet, Result, StageConfig, StageMode,
    WorkflowDefinition,
};
pub use orchestrator::{Orchestrator, RunOptions};
pub use progress::{ProgressReport, ProgressTracker, StageProgress};
pub use recording::RunRecorder;
pub use registry::WorkflowRegistry;
pub use retry::RetryPolicy;
pub use stage::{StageEnv, StageResult};
pub use telemetry::init_tracing;
pub use worktree::{
    CheckoutProvider, GitCheckoutProvider, PoolConfig, Slot, WorkingDir, WorktreePool,
};

pub use agentflow_state::{
    DocumentId, DocumentStore, RunFilter, RunId, RunStatus, RunStore, TokenUsage,
    WorkflowRunRecord,
};
