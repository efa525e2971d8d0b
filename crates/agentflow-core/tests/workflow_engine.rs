//! End-to-end tests of the orchestrator and the five stage modes, driven by
//! a scripted agent over in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use agentflow_core::fakes::{DirCheckoutProvider, ScriptedAgentRunner, ScriptedReply};
use agentflow_core::{
    EngineConfig, FlowError, Orchestrator, PromptSet, RunFailure, RunOptions, StageConfig,
    StageMode, WorkflowDefinition, WorkflowInput,
};
use agentflow_state::fakes::{MemoryDocumentStore, MemoryRunStore};
use agentflow_state::{
    DocumentStore, NewDocument, RunFilter, RunId, RunStatus, RunStore, TokenUsage,
};
use tempfile::TempDir;

struct Harness {
    runner: Arc<ScriptedAgentRunner>,
    runs: Arc<MemoryRunStore>,
    docs: Arc<MemoryDocumentStore>,
    orchestrator: Orchestrator,
    _logs: TempDir,
}

fn harness_with<F>(make_runner: F) -> Harness
where
    F: FnOnce(Arc<dyn DocumentStore>) -> ScriptedAgentRunner,
{
    let docs = Arc::new(MemoryDocumentStore::new());
    let runs = Arc::new(MemoryRunStore::new());
    let runner = Arc::new(make_runner(docs.clone()));
    let logs = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        log_dir: logs.path().to_path_buf(),
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(config, runner.clone(), docs.clone(), runs.clone());
    Harness {
        runner,
        runs,
        docs,
        orchestrator,
        _logs: logs,
    }
}

fn harness() -> Harness {
    harness_with(ScriptedAgentRunner::echo)
}

fn inline(content: &str) -> WorkflowInput {
    WorkflowInput::Inline {
        title: "input".to_string(),
        content: content.to_string(),
    }
}

fn single(name: &str, prompt: &str) -> StageConfig {
    StageConfig::new(
        name,
        StageMode::Single {
            prompt: prompt.to_string(),
        },
    )
}

fn parallel(name: &str, prompt: &str, runs: u32, synthesis: &str) -> StageConfig {
    StageConfig::new(
        name,
        StageMode::Parallel {
            prompt: PromptSet::One(prompt.to_string()),
            runs: Some(runs),
            synthesis: Some(synthesis.to_string()),
        },
    )
}

fn dynamic(name: &str, discovery: &str, prompt: &str) -> StageConfig {
    StageConfig::new(
        name,
        StageMode::Dynamic {
            prompt: prompt.to_string(),
            discovery: discovery.to_string(),
            item_var: "file".to_string(),
            synthesis: Some("merge {{output_count}} (failed {{failed_count}}):\n{{outputs}}".to_string()),
        },
    )
}

fn labels(h: &Harness) -> Vec<String> {
    h.runner.requests().into_iter().map(|r| r.label).collect()
}

#[tokio::test]
async fn single_parallel_single_produces_five_individual_runs() {
    let h = harness();
    let workflow = WorkflowDefinition::new(
        "review",
        vec![
            single("analyze", "Analyze {{input}}"),
            parallel("fan", "Review #{{run_number}} of {{analyze}}", 3, "Combine:\n{{outputs}}"),
            single("final", "Finalize {{fan}}"),
        ],
    );

    let record = h
        .orchestrator
        .execute(&workflow, inline("X"), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Completed);
    assert!(record.errors.is_empty());
    assert_eq!(h.runs.all_individual_runs().len(), 5);
    let stages = h.runs.list_stage_runs(&record.run_id).await.unwrap();
    assert_eq!(stages.len(), 3);
    assert!(stages.iter().all(|s| s.status == RunStatus::Completed));
    assert!(stages[1].synthesis_ref.is_some());
    assert_eq!(stages[1].output_ref, stages[1].synthesis_ref);

    // 5 runs plus one synthesis call.
    assert_eq!(h.runner.calls(), 6);
    let prompts = h.runner.prompts();
    assert_eq!(prompts[0], "Analyze X");
    assert!(prompts[1..4]
        .iter()
        .all(|p| p.contains("run-1: Analyze X")));
    let last = prompts.last().unwrap();
    assert!(last.starts_with("Finalize synthesis: Combine:"), "{last}");
}

#[tokio::test]
async fn parallel_with_two_failures_synthesizes_the_other_three() {
    let h = harness_with(|docs| {
        ScriptedAgentRunner::new(docs, |req| match req.label.as_str() {
            "run-2" | "run-4" => ScriptedReply::Fail(RunFailure::Exit {
                code: Some(1),
                stderr_tail: "crashed".into(),
            }),
            label => ScriptedReply::text(format!("out {label}")),
        })
    });
    let workflow = WorkflowDefinition::new(
        "fan",
        vec![parallel(
            "fan",
            "Review {{input}}",
            5,
            "{{output_count}} outputs, {{failed_count}} failed\n{{outputs}}",
        )],
    );

    let record = h
        .orchestrator
        .execute(&workflow, inline("X"), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.errors.len(), 2);
    assert!(record.errors.iter().all(|e| e.kind == "exit"));
    let indices: Vec<_> = record.errors.iter().map(|e| e.run_index).collect();
    assert!(indices.contains(&Some(1)) && indices.contains(&Some(3)));

    let synthesis_prompt = h.runner.prompts().pop().unwrap();
    assert!(synthesis_prompt.starts_with("3 outputs, 2 failed\n[2 of 5 runs failed"));
    for label in ["run-1", "run-3", "run-5"] {
        assert!(synthesis_prompt.contains(&format!("out {label}")));
    }

    let stage = &h.runs.list_stage_runs(&record.run_id).await.unwrap()[0];
    assert_eq!(stage.status, RunStatus::Completed);
    assert_eq!((stage.runs_completed, stage.runs_failed), (3, 2));
    assert_eq!(stage.errors.len(), 2);
}

#[tokio::test]
async fn parallel_prompt_templates_rotate() {
    let h = harness();
    let stage = StageConfig::new(
        "fan",
        StageMode::Parallel {
            prompt: PromptSet::Many(vec!["A{{run_index}}".into(), "B{{run_index}}".into()]),
            runs: Some(3),
            synthesis: Some("{{outputs}}".into()),
        },
    );
    h.orchestrator
        .execute(
            &WorkflowDefinition::new("wf", vec![stage]),
            inline("X"),
            RunOptions::default(),
        )
        .await
        .unwrap();
    let mut prompts = h.runner.prompts();
    prompts.pop();
    prompts.sort();
    assert_eq!(prompts, vec!["A0", "A2", "B1"]);
}

#[tokio::test]
async fn parallel_where_every_run_fails_fails_without_synthesis() {
    let h = harness_with(|docs| ScriptedAgentRunner::new(docs, |_| ScriptedReply::NoArtifact));
    let workflow = WorkflowDefinition::new("wf", vec![parallel("fan", "p", 2, "{{outputs}}")]);
    let record = h
        .orchestrator
        .execute(&workflow, inline("X"), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(h.runner.calls(), 2);
    assert!(record.errors.iter().any(|e| e.kind == "no_artifact"));
}

#[tokio::test]
async fn synthesis_failure_fails_the_stage() {
    let h = harness_with(|docs| {
        ScriptedAgentRunner::new(docs, |req| {
            if req.label == "synthesis" {
                ScriptedReply::Fail(RunFailure::Timeout { millis: 1000 })
            } else {
                ScriptedReply::text("ok")
            }
        })
    });
    let workflow = WorkflowDefinition::new(
        "wf",
        vec![
            parallel("fan", "p", 2, "{{outputs}}"),
            single("after", "never {{fan}}"),
        ],
    );
    let record = h
        .orchestrator
        .execute(&workflow, inline("X"), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    let stages = h.runs.list_stage_runs(&record.run_id).await.unwrap();
    assert_eq!(stages.len(), 1);
    assert_eq!(stages[0].status, RunStatus::Failed);
    assert_eq!(stages[0].runs_completed, 2);
    assert!(stages[0]
        .errors
        .iter()
        .any(|e| e.kind == "synthesis" && e.run_index.is_none()));
}

#[tokio::test]
async fn iterative_run_sees_exactly_the_prior_outputs_in_order() {
    let h = harness_with(|docs| {
        ScriptedAgentRunner::new(docs, |req| ScriptedReply::text(format!("out-{}", req.label)))
    });
    let stage = StageConfig::new(
        "refine",
        StageMode::Iterative {
            prompt: "#{{iteration}} prev=[{{previous}}] all=[{{outputs}}]".into(),
            runs: 3,
        },
    );
    let record = h
        .orchestrator
        .execute(
            &WorkflowDefinition::new("wf", vec![stage]),
            inline("X"),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(
        h.runner.prompts(),
        vec![
            "#1 prev=[] all=[]",
            "#2 prev=[out-iteration-1] all=[out-iteration-1]",
            "#3 prev=[out-iteration-2] all=[out-iteration-1\n\nout-iteration-2]",
        ]
    );
    let stage = &h.runs.list_stage_runs(&record.run_id).await.unwrap()[0];
    let final_doc = h
        .docs
        .get(&agentflow_state::DocumentId::new(stage.output_ref.clone().unwrap()))
        .await
        .unwrap();
    assert_eq!(final_doc.content, "out-iteration-3");
}

#[tokio::test]
async fn iterative_failure_stops_unless_tolerated() {
    let script = |req: &agentflow_core::AgentRequest| {
        if req.label == "iteration-2" {
            ScriptedReply::NoArtifact
        } else {
            ScriptedReply::text(format!("out-{}", req.label))
        }
    };

    let h = harness_with(|docs| ScriptedAgentRunner::new(docs, script));
    let stage = StageConfig::new(
        "refine",
        StageMode::Iterative {
            prompt: "[{{previous}}]".into(),
            runs: 3,
        },
    );
    let record = h
        .orchestrator
        .execute(
            &WorkflowDefinition::new("wf", vec![stage.clone()]),
            inline("X"),
            RunOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(h.runner.calls(), 2);

    let h = harness_with(|docs| ScriptedAgentRunner::new(docs, script));
    let record = h
        .orchestrator
        .execute(
            &WorkflowDefinition::new("wf", vec![stage.continue_on_failure()]),
            inline("X"),
            RunOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    // The skipped iteration leaves `previous` at the last success.
    assert_eq!(h.runner.prompts()[2], "[out-iteration-1]");
}

#[tokio::test]
async fn adversarial_runs_three_phases_with_prior_outputs() {
    let h = harness_with(|docs| {
        ScriptedAgentRunner::new(docs, |req| ScriptedReply::text(format!("{} says", req.label)))
    });
    let stage = StageConfig::new(
        "debate",
        StageMode::Adversarial {
            advocate: None,
            critic: None,
            synthesizer: None,
        },
    );
    let record = h
        .orchestrator
        .execute(
            &WorkflowDefinition::new("wf", vec![stage]),
            inline("Adopt Rust"),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(labels(&h), vec!["advocate", "critic", "synthesizer"]);
    let prompts = h.runner.prompts();
    assert!(prompts[0].contains("Adopt Rust"));
    assert!(prompts[1].contains("advocate says"));
    assert!(prompts[2].contains("advocate says") && prompts[2].contains("critic says"));
}

#[tokio::test]
async fn adversarial_phase_failure_fails_the_stage() {
    let h = harness_with(|docs| {
        ScriptedAgentRunner::new(docs, |req| {
            if req.label == "critic" {
                ScriptedReply::NoArtifact
            } else {
                ScriptedReply::text("ok")
            }
        })
    });
    let stage = StageConfig::new(
        "debate",
        StageMode::Adversarial {
            advocate: Some("for {{input}}".into()),
            critic: None,
            synthesizer: None,
        },
    );
    let record = h
        .orchestrator
        .execute(
            &WorkflowDefinition::new("wf", vec![stage]),
            inline("X"),
            RunOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(labels(&h), vec!["advocate", "critic"]);
}

#[tokio::test]
async fn dynamic_with_no_items_succeeds_without_synthesis() {
    let h = harness();
    let workflow = WorkflowDefinition::new(
        "wf",
        vec![dynamic("per-file", "true", "inspect {{file}}")],
    );
    let record = h
        .orchestrator
        .execute(&workflow, inline("X"), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(h.runner.calls(), 0);
    assert!(h.runs.all_individual_runs().is_empty());
    let stage = &h.runs.list_stage_runs(&record.run_id).await.unwrap()[0];
    assert_eq!(stage.status, RunStatus::Completed);
    assert_eq!(stage.runs_total, 0);
    assert!(stage.synthesis_ref.is_none());
}

#[tokio::test]
async fn dynamic_binds_items_and_tolerates_failures_when_asked() {
    let h = harness_with(|docs| {
        ScriptedAgentRunner::new(docs, |req| {
            if req.label == "b.rs" {
                ScriptedReply::NoArtifact
            } else {
                ScriptedReply::text(format!("checked {}", req.label))
            }
        })
    });
    let stage = dynamic(
        "per-file",
        "printf 'a.rs\\nb.rs\\nc.rs\\n'",
        "inspect {{file}} ({{item_index}}/{{item_count}})",
    )
    .continue_on_failure();
    let record = h
        .orchestrator
        .execute(
            &WorkflowDefinition::new("wf", vec![stage]),
            inline("X"),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Completed);
    let mut prompts = h.runner.prompts();
    let synthesis = prompts.pop().unwrap();
    prompts.sort();
    assert_eq!(
        prompts,
        vec!["inspect a.rs (0/3)", "inspect b.rs (1/3)", "inspect c.rs (2/3)"]
    );
    assert!(synthesis.starts_with("merge 2 (failed 1):"));
    let stage = &h.runs.list_stage_runs(&record.run_id).await.unwrap()[0];
    assert_eq!((stage.runs_total, stage.runs_completed, stage.runs_failed), (3, 2, 1));
}

#[tokio::test]
async fn dynamic_failure_stops_unstarted_items() {
    let h = harness_with(|docs| ScriptedAgentRunner::new(docs, |_| ScriptedReply::NoArtifact));
    let stage = dynamic("per-file", "printf 'a\\nb\\nc\\n'", "inspect {{file}}").with_concurrency(1);
    let record = h
        .orchestrator
        .execute(
            &WorkflowDefinition::new("wf", vec![stage]),
            inline("X"),
            RunOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(h.runner.calls(), 1);
}

#[tokio::test]
async fn dynamic_discovery_failure_fails_the_stage() {
    let h = harness();
    let workflow = WorkflowDefinition::new("wf", vec![dynamic("d", "exit 7", "x {{file}}")]);
    let record = h
        .orchestrator
        .execute(&workflow, inline("X"), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.errors[0].kind, "discovery");
    assert_eq!(h.runner.calls(), 0);
}

#[tokio::test]
async fn invalid_workflow_fails_before_any_record() {
    let h = harness();
    let broken = StageConfig::new(
        "fan",
        StageMode::Parallel {
            prompt: PromptSet::One("p".into()),
            runs: Some(2),
            synthesis: None,
        },
    );
    let err = h
        .orchestrator
        .execute(
            &WorkflowDefinition::new("wf", vec![broken]),
            inline("X"),
            RunOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Config(_)));
    assert!(h
        .runs
        .list_workflow_runs(&RunFilter::default())
        .await
        .unwrap()
        .is_empty());
    assert_eq!(h.runner.calls(), 0);
}

#[tokio::test]
async fn failed_stage_stops_the_run() {
    let h = harness_with(|docs| ScriptedAgentRunner::new(docs, |_| ScriptedReply::NoArtifact));
    let workflow = WorkflowDefinition::new(
        "wf",
        vec![single("first", "a"), single("second", "b")],
    );
    let record = h
        .orchestrator
        .execute(&workflow, inline("X"), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.current_stage.as_deref(), Some("first"));
    assert_eq!(record.errors[0].kind, "no_artifact");
    assert_eq!(h.runs.list_stage_runs(&record.run_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn continue_on_failure_moves_on_with_an_empty_reference() {
    let h = harness_with(|docs| {
        ScriptedAgentRunner::new(docs, |req| {
            if req.prompt == "a" {
                ScriptedReply::NoArtifact
            } else {
                ScriptedReply::text("ok")
            }
        })
    });
    let workflow = WorkflowDefinition::new(
        "wf",
        vec![
            single("first", "a").continue_on_failure(),
            single("second", "after [{{first}}]"),
        ],
    );
    let record = h
        .orchestrator
        .execute(&workflow, inline("X"), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.errors.len(), 1);
    assert_eq!(h.runner.prompts()[1], "after []");
}

#[tokio::test]
async fn indexed_reference_into_earlier_stage_outputs() {
    let h = harness_with(|docs| {
        ScriptedAgentRunner::new(docs, |req| ScriptedReply::text(format!("out {}", req.label)))
    });
    let workflow = WorkflowDefinition::new(
        "wf",
        vec![
            parallel("fan", "p", 2, "{{outputs}}").with_concurrency(1),
            single("pick", "first=[{{fan.outputs[0]}}] missing=[{{fan.outputs[9]}}]"),
        ],
    );
    h.orchestrator
        .execute(&workflow, inline("X"), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(
        h.runner.prompts().last().unwrap(),
        "first=[out run-1] missing=[]"
    );
}

#[tokio::test]
async fn artifact_unknown_to_store_is_a_distinct_failure() {
    let h = harness_with(|docs| {
        ScriptedAgentRunner::new(docs, |_| ScriptedReply::UnknownArtifact("999".into()))
    });
    let record = h
        .orchestrator
        .execute(
            &WorkflowDefinition::new("wf", vec![single("s", "p")]),
            inline("X"),
            RunOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    let run = &h.runs.all_individual_runs()[0];
    assert_eq!(run.error_kind.as_deref(), Some("artifact_missing"));
    assert_eq!(run.status, RunStatus::Failed);
    assert!(!run.success);
}

#[tokio::test]
async fn concurrency_cap_and_override_bound_in_flight_runs() {
    let h = harness_with(|docs| {
        ScriptedAgentRunner::echo(docs).with_delay(Duration::from_millis(40))
    });
    let workflow = WorkflowDefinition::new(
        "wf",
        vec![parallel("fan", "p", 6, "{{outputs}}").with_concurrency(2)],
    );
    h.orchestrator
        .execute(&workflow, inline("X"), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(h.runner.max_in_flight(), 2);

    let h = harness_with(|docs| {
        ScriptedAgentRunner::echo(docs).with_delay(Duration::from_millis(40))
    });
    let options = RunOptions {
        concurrency: Some(3),
        ..Default::default()
    };
    h.orchestrator
        .execute(&workflow, inline("X"), options)
        .await
        .unwrap();
    assert_eq!(h.runner.max_in_flight(), 3);
}

#[tokio::test]
async fn document_and_task_inputs_bind() {
    let h = harness();
    let id = h
        .docs
        .put(NewDocument::new("Design", "the design doc"))
        .await
        .unwrap();
    let workflow = WorkflowDefinition::new("wf", vec![single("s", "{{title}}: {{input}}")]);
    let record = h
        .orchestrator
        .execute(&workflow, WorkflowInput::Document(id.clone()), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(record.input_ref.as_deref(), Some(id.as_str()));
    assert_eq!(h.runner.prompts()[0], "Design: the design doc");

    let h = harness();
    let workflow = WorkflowDefinition::new("wf", vec![single("s", "second={{tasks[1]}}")]);
    let record = h
        .orchestrator
        .execute(
            &workflow,
            WorkflowInput::Tasks(vec!["fix login".into(), "add tests".into()]),
            RunOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(record.input_ref.as_deref(), Some("tasks"));
    assert_eq!(h.runner.prompts()[0], "second=add tests");
}

#[tokio::test]
async fn variables_override_workflow_defaults() {
    let h = harness();
    let mut workflow = WorkflowDefinition::new("wf", vec![single("s", "{{focus}}/{{tone}}")]);
    workflow.variables.insert("focus".into(), "style".into());
    workflow.variables.insert("tone".into(), "terse".into());
    let mut options = RunOptions::default();
    options.variables.insert("focus".into(), "security".into());

    let record = h
        .orchestrator
        .execute(&workflow, inline("X"), options)
        .await
        .unwrap();
    assert_eq!(h.runner.prompts()[0], "security/terse");
    assert_eq!(record.variables.get("focus").map(String::as_str), Some("security"));
}

#[tokio::test]
async fn usage_aggregates_across_runs_and_synthesis() {
    let h = harness_with(|docs| {
        ScriptedAgentRunner::new(docs, |_| ScriptedReply::Artifact {
            content: "ok".into(),
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 4,
                cost_usd: 0.25,
            },
        })
    });
    let workflow = WorkflowDefinition::new(
        "wf",
        vec![single("a", "p"), parallel("fan", "p", 2, "{{outputs}}")],
    );
    let record = h
        .orchestrator
        .execute(&workflow, inline("X"), RunOptions::default())
        .await
        .unwrap();
    // 1 + 2 runs + 1 synthesis.
    assert_eq!(record.usage.input_tokens, 40);
    assert_eq!(record.usage.output_tokens, 16);
    assert!((record.usage.cost_usd - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn isolated_runs_get_distinct_checkouts_that_are_cleaned_up() {
    let docs = Arc::new(MemoryDocumentStore::new());
    let runs = Arc::new(MemoryRunStore::new());
    let runner = Arc::new(ScriptedAgentRunner::echo(docs.clone()).with_delay(Duration::from_millis(20)));
    let scratch = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        log_dir: scratch.path().join("logs"),
        worktree_dir: scratch.path().join("trees"),
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(config, runner.clone(), docs, runs)
        .with_checkout_provider(Arc::new(DirCheckoutProvider::new()));
    let workflow = WorkflowDefinition::new(
        "wf",
        vec![parallel("fan", "p", 4, "{{outputs}}").with_concurrency(2)],
    );
    let options = RunOptions {
        isolate: true,
        ..Default::default()
    };

    let record = orchestrator
        .execute(&workflow, inline("X"), options)
        .await
        .unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert!(record.isolated);

    let mut dirs: Vec<_> = runner
        .requests()
        .into_iter()
        .filter(|r| r.label != "synthesis")
        .map(|r| r.working_dir.unwrap())
        .collect();
    assert!(dirs.iter().all(|d| d.starts_with(scratch.path().join("trees"))));
    dirs.sort();
    dirs.dedup();
    assert!(dirs.len() <= 2, "at most two checkouts serve four runs");
    assert!(dirs.iter().all(|d| !d.exists()), "checkouts removed after the stage");
}

fn checkout_dirs(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    let Ok(runs) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    runs.flatten()
        .filter_map(|run| std::fs::read_dir(run.path()).ok())
        .flat_map(|entries| entries.flatten().map(|e| e.path()))
        .collect()
}

#[tokio::test]
async fn cancel_while_a_checkout_is_being_created_leaves_nothing_behind() {
    let docs = Arc::new(MemoryDocumentStore::new());
    let runs = Arc::new(MemoryRunStore::new());
    let runner = Arc::new(ScriptedAgentRunner::echo(docs.clone()));
    let scratch = tempfile::tempdir().unwrap();
    let trees = scratch.path().join("trees");
    let config = EngineConfig {
        log_dir: scratch.path().join("logs"),
        worktree_dir: trees.clone(),
        ..Default::default()
    };
    let provider = DirCheckoutProvider::new().with_create_delay(Duration::from_millis(300));
    let orchestrator = Orchestrator::new(config, runner.clone(), docs, runs)
        .with_checkout_provider(Arc::new(provider));
    let workflow = WorkflowDefinition::new("wf", vec![single("s", "p")]);
    let run_id = RunId::new();
    let options = RunOptions {
        isolate: true,
        run_id: Some(run_id.clone()),
        ..Default::default()
    };

    let (record, cancelled) = tokio::join!(
        orchestrator.execute(&workflow, inline("X"), options),
        async {
            for _ in 0..2000 {
                if !checkout_dirs(&trees).is_empty() {
                    return orchestrator.cancel(&run_id);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            panic!("no checkout was started");
        }
    );

    assert!(cancelled);
    assert_eq!(record.unwrap().status, RunStatus::Cancelled);
    assert_eq!(runner.calls(), 0, "the agent never starts in a cancelled run");
    assert!(checkout_dirs(&trees).is_empty(), "half-made checkout was removed");
}

#[tokio::test]
async fn isolation_without_provider_is_a_config_error() {
    let h = harness();
    let options = RunOptions {
        isolate: true,
        ..Default::default()
    };
    let err = h
        .orchestrator
        .execute(
            &WorkflowDefinition::new("wf", vec![single("s", "p")]),
            inline("X"),
            options,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FlowError::Config(_)));
}

#[tokio::test]
async fn runs_list_newest_first_with_filters() {
    let h = harness();
    let a = WorkflowDefinition::new("alpha", vec![single("s", "p")]);
    let b = WorkflowDefinition::new("beta", vec![single("s", "p")]);
    h.orchestrator
        .execute(&a, inline("1"), RunOptions::default())
        .await
        .unwrap();
    let latest = h
        .orchestrator
        .execute(&b, inline("2"), RunOptions::default())
        .await
        .unwrap();

    let all = h.orchestrator.list_runs(&RunFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].run_id, latest.run_id);

    let filter = RunFilter {
        workflow_name: Some("alpha".into()),
        ..Default::default()
    };
    let alpha = h.orchestrator.list_runs(&filter).await.unwrap();
    assert_eq!(alpha.len(), 1);
    assert_eq!(alpha[0].workflow_name, "alpha");
}
