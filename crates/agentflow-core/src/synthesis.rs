//! Combining several run outputs into one through a further agent call.

use std::time::Instant;

use agentflow_state::TokenUsage;
use serde_json::Value;

use crate::agent::AgentRequest;
use crate::domain::{Artifact, FlowError, Result};
use crate::obs;
use crate::stage::StageEnv;
use crate::template::Bindings;

/// Placed between outputs in the `{{outputs}}` binding.
pub const SEPARATOR: &str = "\n\n---\n\n";

/// A finished synthesis call.
#[derive(Debug, Clone)]
pub struct Synthesized {
    pub artifact: Artifact,
    pub usage: TokenUsage,
}

/// Join outputs for the prompt, noting any failed runs up front.
pub fn join_outputs(outputs: &[Artifact], failed_count: usize) -> String {
    let joined = outputs
        .iter()
        .map(|a| a.content.as_str())
        .collect::<Vec<_>>()
        .join(SEPARATOR);
    if failed_count == 0 {
        return joined;
    }
    let total = outputs.len() + failed_count;
    format!("[{failed_count} of {total} runs failed and are not included]{SEPARATOR}{joined}")
}

/// Bindings for a synthesis template: `base` plus `outputs`,
/// `output_count` and `failed_count`.
///
/// Zero outputs is an error; callers short-circuit before getting here.
pub fn synthesis_bindings(
    outputs: &[Artifact],
    failed_count: usize,
    mut base: Bindings,
) -> Result<Bindings> {
    if outputs.is_empty() {
        return Err(FlowError::EmptySynthesis);
    }
    base.insert(
        "outputs".into(),
        Value::String(join_outputs(outputs, failed_count)),
    );
    base.insert("output_count".into(), Value::from(outputs.len()));
    base.insert("failed_count".into(), Value::from(failed_count));
    Ok(base)
}

/// Run exactly one agent call over `outputs` and load the resulting artifact.
///
/// The call is not an individual run: it writes no run record. A successful
/// call's usage is added to the stage's progress counters here.
pub async fn synthesize(
    env: &StageEnv,
    template: &str,
    outputs: &[Artifact],
    failed_count: usize,
    base: Bindings,
) -> Result<Synthesized> {
    let bindings = synthesis_bindings(outputs, failed_count, base)?;
    let prompt = env.resolve(template, &bindings);
    let start = Instant::now();

    let request = AgentRequest {
        prompt,
        working_dir: env.working_dir.clone(),
        timeout: env.timeout,
        label: "synthesis".to_string(),
        log_path: Some(env.log_path(0, "synthesis")),
        cancel: Some(env.cancel.clone()),
    };
    let outcome = env.runner.run(request).await;
    let (outcome, artifact) = env.fetch_artifact(outcome).await;
    obs::emit_synthesis_finished(
        env.name(),
        outputs.len(),
        failed_count,
        artifact.is_some(),
        start.elapsed().as_millis() as u64,
    );

    match artifact {
        Some(artifact) => {
            env.progress.add_usage(env.name(), outcome.usage);
            Ok(Synthesized {
                artifact,
                usage: outcome.usage,
            })
        }
        None => {
            let reason = outcome
                .failure
                .map(|f| f.to_string())
                .unwrap_or_else(|| "no artifact produced".to_string());
            Err(FlowError::Synthesis(reason))
        }
    }
}
