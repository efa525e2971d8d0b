//! Structured observability hooks for workflow lifecycle events.
//!
//! This module provides:
//! - Run- and stage-scoped tracing spans
//! - Emission functions for workflow, stage, run and worktree events
//!
//! Events are emitted at `info!` level (configurable via `AGENTFLOW_LOG`).

use std::path::Path;

use agentflow_state::TokenUsage;
use tracing::{info, warn};

/// Span for one workflow run; attach to the run future with `Instrument`.
///
/// # Example
///
/// ```ignore
/// run_stages(..).instrument(obs::run_span(&run_id)).await
/// // every event below carries run_id
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("agentflow.run", run_id = %run_id)
}

/// Span for one stage; attach to the stage future with `Instrument`.
pub fn stage_span(run_id: &str, stage: &str) -> tracing::Span {
    tracing::info_span!("agentflow.stage", run_id = %run_id, stage = %stage)
}

pub fn emit_workflow_started(run_id: &str, workflow: &str, stage_count: usize) {
    info!(
        event = "workflow.started",
        run_id = %run_id,
        workflow = %workflow,
        stage_count = stage_count,
    );
}

pub fn emit_workflow_finished(run_id: &str, status: &str, duration_ms: u64, usage: &TokenUsage) {
    info!(
        event = "workflow.finished",
        run_id = %run_id,
        status = %status,
        duration_ms = duration_ms,
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        cost_usd = usage.cost_usd,
    );
}

pub fn emit_stage_started(run_id: &str, stage: &str, mode: &str, planned_runs: Option<u32>) {
    info!(
        event = "stage.started",
        run_id = %run_id,
        stage = %stage,
        mode = %mode,
        planned_runs = planned_runs,
    );
}

pub fn emit_stage_finished(
    run_id: &str,
    stage: &str,
    success: bool,
    completed: u32,
    failed: u32,
    duration_ms: u64,
) {
    info!(
        event = "stage.finished",
        run_id = %run_id,
        stage = %stage,
        success = success,
        runs_completed = completed,
        runs_failed = failed,
        duration_ms = duration_ms,
    );
}

/// Emit event: one agent invocation finished.
pub fn emit_run_finished(
    stage: &str,
    label: &str,
    success: bool,
    error_kind: Option<&str>,
    duration_ms: u64,
) {
    info!(
        event = "run.finished",
        stage = %stage,
        label = %label,
        success = success,
        error_kind = error_kind,
        duration_ms = duration_ms,
    );
}

pub fn emit_synthesis_finished(
    stage: &str,
    inputs: usize,
    failed: usize,
    success: bool,
    duration_ms: u64,
) {
    info!(
        event = "synthesis.finished",
        stage = %stage,
        inputs = inputs,
        failed = failed,
        success = success,
        duration_ms = duration_ms,
    );
}

pub fn emit_discovery_finished(stage: &str, items: usize) {
    info!(event = "discovery.finished", stage = %stage, items = items);
}

pub fn emit_worktree_created(path: &Path, branch: &str) {
    info!(event = "worktree.created", path = %path.display(), branch = %branch);
}

pub fn emit_worktree_released(path: &Path, retained: bool) {
    info!(event = "worktree.released", path = %path.display(), retained = retained);
}

/// Emit event: a run record could not be persisted (warning level).
pub fn emit_record_error(what: &str, error: &dyn std::fmt::Display) {
    warn!(event = "record.error", record = %what, error = %error);
}
