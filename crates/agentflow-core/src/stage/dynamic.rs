//! Discovery-driven fan-out: one run per discovered item.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn, Instrument};

use crate::context::ExecutionContext;
use crate::obs;
use crate::stage::{collect_joined, discovery, item_label, StageEnv, StageResult};
use crate::synthesis;

pub(crate) async fn execute(
    env: &Arc<StageEnv>,
    ctx: &ExecutionContext,
    template: &str,
    discovery_command: &str,
    item_var: &str,
    synthesis_template: Option<&str>,
) -> StageResult {
    let command = env.resolve(discovery_command, &ctx.bindings());
    let items = match discovery::discover(
        &command,
        env.working_dir.as_deref(),
        env.discovery_timeout,
        Some(env.cancel.clone()),
    )
    .await
    {
        Ok(items) => items,
        Err(e) => {
            let mut result = StageResult::default();
            result.fail(env.name(), e.kind(), e.to_string());
            return result;
        }
    };
    obs::emit_discovery_finished(env.name(), items.len());

    let count = items.len() as u32;
    env.progress.set_runs_total(env.name(), count);
    let mut result = StageResult::with_total(count);
    if items.is_empty() {
        info!(stage = %env.name(), "discovery found no items; nothing to do");
        result.success = true;
        return result;
    }

    let prompts: Vec<(String, String)> = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let bindings = ctx.bindings_with([
                (item_var.to_string(), Value::String(item.clone())),
                ("item_index".to_string(), Value::from(i)),
                ("item_count".to_string(), Value::from(count)),
            ]);
            (item_label(item), env.resolve(template, &bindings))
        })
        .collect();

    // Raised on the first failure when failures are not tolerated; items
    // that have not started yet are skipped.
    let (failed_tx, failed_rx) = watch::channel(false);
    let failed_tx = Arc::new(failed_tx);
    let stop_on_failure = !env.stage.continue_on_failure;
    let permits = Arc::new(Semaphore::new(env.concurrency.max(1)));

    let handles = prompts.into_iter().enumerate().map(|(i, (label, prompt))| {
        let env = Arc::clone(env);
        let permits = Arc::clone(&permits);
        let failed_tx = Arc::clone(&failed_tx);
        let failed_rx = failed_rx.clone();
        tokio::spawn(
            async move {
                let _permit = permits.acquire_owned().await.ok()?;
                if *failed_rx.borrow() {
                    return None;
                }
                let run = env.run_one(i as u32, label, prompt).await?;
                if stop_on_failure && !run.success() {
                    let _ = failed_tx.send(true);
                }
                Some(run)
            }
            .instrument(tracing::Span::current()),
        )
    });
    let runs = collect_joined(env.name(), join_all(handles).await);

    for run in &runs {
        result.absorb(env.name(), run);
    }
    if env.is_cancelled() {
        return result;
    }
    if stop_on_failure && result.runs_failed > 0 {
        let skipped = count.saturating_sub(result.runs_completed + result.runs_failed);
        if skipped > 0 {
            warn!(stage = %env.name(), skipped, "items skipped after a failure");
        }
        return result;
    }
    if result.outputs.is_empty() {
        result.fail(env.name(), "synthesis", "every item failed; nothing to synthesize");
        return result;
    }

    let Some(template) = synthesis_template else {
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
