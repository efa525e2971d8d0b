//! Domain models for agentflow.
//!
//! - `WorkflowDefinition` / `StageConfig` / `StageMode`: what to run
//! - `Artifact`: what an agent produced
//! - error taxonomy shared by the engine

pub mod artifact;
pub mod error;
pub mod workflow;

pub use artifact::Artifact;
pub use error::{CheckoutError, ConfigError, FlowError, Result};
pub use workflow::{PromptSet, StageConfig, StageMode, WorkflowDefinition, DEFAULT_ITEM_VAR};
