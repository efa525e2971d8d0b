//! Agent invocation: spawning, output parsing, outcomes.

pub mod outcome;
pub mod parser;
pub mod runner;

pub use outcome::{RunFailure, RunOutcome};
pub use runner::{
    wait_for_cancel, AgentCommand, AgentRequest, AgentRunner, ProcessAgentRunner, PromptDelivery,
    ARTIFACT_INSTRUCTION, RESULT_FILE_ENV,
};
