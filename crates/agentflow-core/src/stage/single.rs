use crate::context::ExecutionContext;
use crate::stage::{StageEnv, StageResult};

pub(crate) async fn execute(env: &StageEnv, ctx: &ExecutionContext, template: &str) -> StageResult {
    let mut result = StageResult::with_total(1);
    let prompt = env.resolve(template, &ctx.bindings());
    let Some(run) = env.run_one(0, "run-1".to_string(), prompt).await else {
        return result;
    };
    result.absorb(env.name(), &run);
    result.output = run.artifact;
    result.success = result.output.is_some();
    result
}
