//! Sequential refinement: each iteration sees the previous output and every
//! prior output in order.

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::stage::{contents, StageEnv, StageResult};

pub(crate) async fn execute(
    env: &StageEnv,
    ctx: &ExecutionContext,
    template: &str,
    runs: u32,
) -> StageResult {
    let mut result = StageResult::with_total(runs);

    for i in 0..runs {
        let previous = result
            .outputs
            .last()
            .map(|a| Value::String(a.content.clone()))
            .unwrap_or_else(|| Value::String(String::new()));
        let bindings = ctx.bindings_with([
            ("previous".to_string(), previous),
            ("outputs".to_string(), contents(&result.outputs)),
            ("iteration".to_string(), Value::from(i + 1)),
            ("run_index".to_string(), Value::from(i)),
        ]);
        let prompt = env.resolve(template, &bindings);

        let Some(run) = env.run_one(i, format!("iteration-{}", i + 1), prompt).await else {
            return result;
        };
        result.absorb(env.name(), &run);
        if !run.success() && !env.stage.continue_on_failure {
            return result;
        }
    }

    result.output = result.outputs.last().cloned();
    result.success = result.output.is_some();
    result
}
