//! Advocate, critic, synthesizer. Always three phases; any failure ends the
//! stage.

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::stage::{contents, StageEnv, StageResult};

pub const DEFAULT_ADVOCATE: &str = "Make the strongest honest case in favour of the following. \
Point to concrete strengths and the evidence for them.\n\n# {{title}}\n\n{{input}}";

pub const DEFAULT_CRITIC: &str = "Critically review the argument below. Identify weaknesses, \
risks, missing evidence and unstated assumptions.\n\n# Original input\n\n{{input}}\n\n\
# Argument\n\n{{advocate}}";

pub const DEFAULT_SYNTHESIZER: &str = "Weigh the argument and the critique below and produce a \
balanced assessment with a clear recommendation.\n\n# Original input\n\n{{input}}\n\n\
# Argument\n\n{{advocate}}\n\n# Critique\n\n{{critic}}";

const PHASES: [&str; 3] = ["advocate", "critic", "synthesizer"];

pub(crate) async fn execute(
    env: &StageEnv,
    ctx: &ExecutionContext,
    advocate: Option<&str>,
    critic: Option<&str>,
    synthesizer: Option<&str>,
) -> StageResult {
    let templates = [
        advocate.unwrap_or(DEFAULT_ADVOCATE),
        critic.unwrap_or(DEFAULT_CRITIC),
        synthesizer.unwrap_or(DEFAULT_SYNTHESIZER),
    ];
    let mut result = StageResult::with_total(PHASES.len() as u32);

    for (i, (phase, template)) in PHASES.iter().zip(templates).enumerate() {
        // Each phase sees the outputs of the phases before it, by name.
        let mut extra: Vec<(String, Value)> = PHASES
            .iter()
            .zip(&result.outputs)
            .map(|(name, a)| (name.to_string(), Value::String(a.content.clone())))
            .collect();
        extra.push(("outputs".to_string(), contents(&result.outputs)));
        let prompt = env.resolve(template, &ctx.bindings_with(extra));

        let Some(run) = env.run_one(i as u32, phase.to_string(), prompt).await else {
            return result;
        };
        result.absorb(env.name(), &run);
        if !run.success() {
            return result;
        }
    }

    result.output = result.outputs.last().cloned();
    result.success = result.output.is_some();
    result
}
