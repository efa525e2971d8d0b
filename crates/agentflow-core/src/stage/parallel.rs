//! Fan-out over N prompts, then synthesis over the successes.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{warn, Instrument};

use crate::context::ExecutionContext;
use crate::stage::{collect_joined, StageEnv, StageResult};
use crate::synthesis;

pub(crate) async fn execute(
    env: &Arc<StageEnv>,
    ctx: &ExecutionContext,
    templates: &[String],
    runs: u32,
    synthesis_template: Option<&str>,
) -> StageResult {
    let mut result = StageResult::with_total(runs);
    if templates.is_empty() {
        result.fail(env.name(), "config", "no prompt templates");
        return result;
    }

    // Resolve every prompt up front so the spawned tasks own their input.
    let prompts: Vec<(String, String)> = (0..runs)
        .map(|i| {
            let template = &templates[i as usize % templates.len()];
            let bindings = ctx.bindings_with([
                ("run_index".to_string(), Value::from(i)),
                ("run_number".to_string(), Value::from(i + 1)),
                ("run_count".to_string(), Value::from(runs)),
            ]);
            (format!("run-{}", i + 1), env.resolve(template, &bindings))
        })
        .collect();

    let permits = Arc::new(Semaphore::new(env.concurrency.max(1)));
    let handles = prompts.into_iter().enumerate().map(|(i, (label, prompt))| {
        let env = Arc::clone(env);
        let permits = Arc::clone(&permits);
        tokio::spawn(
            async move {
                let _permit = permits.acquire_owned().await.ok()?;
                env.run_one(i as u32, label, prompt).await
            }
            .instrument(tracing::Span::current()),
        )
    });
    let runs_done = collect_joined(env.name(), join_all(handles).await);

    for run in &runs_done {
        result.absorb(env.name(), run);
    }
    if env.is_cancelled() {
        return result;
    }
    if result.outputs.is_empty() {
        result.fail(env.name(), "synthesis", "every run failed; nothing to synthesize");
        return result;
    }

    let Some(template) = synthesis_template else {
        // Validation guarantees a template; without one the last output stands.
        result.output = result.outputs.last().cloned();
        result.success = true;
        return result;
    };

    let failed = result.runs_failed as usize;
    match synthesis::synthesize(env, template, &result.outputs, failed, ctx.bindings()).await {
        Ok(done) => {
            result.usage += done.usage;
            result.output = Some(done.artifact.clone());
            result.synthesis = Some(done.artifact);
            result.success = true;
        }
        Err(e) => {
            warn!(stage = %env.name(), error = %e, "synthesis failed");
            result.fail(env.name(), e.kind(), e.to_string());
        }
    }
    result
}
