//! agentflow - multi-stage workflows of external coding agents
//!
//! ## Commands
//!
//! - `run`: execute a workflow against a document, tasks or inline text
//! - `status`: show the progress report of a run
//! - `list`: list recent runs
//! - `validate`: check workflow definitions without running anything

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

use agentflow_core::{
    git, EngineConfig, GitCheckoutProvider, Orchestrator, ProcessAgentRunner, ProgressReport,
    RunOptions, WorkflowDefinition, WorkflowInput, WorkflowRegistry,
};
use agentflow_state::{
    connect, DocumentId, DocumentStore, RunFilter, RunId, RunStatus, RunStore, StoreConfig,
    SurrealDocumentStore, SurrealRunStore, WorkflowRunRecord,
};

const DEFAULT_CONFIG: &str = ".agentflow/config.toml";
const DEFAULT_WORKFLOWS_DIR: &str = ".agentflow/workflows";

#[derive(Parser)]
#[command(name = "agentflow")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-stage workflow orchestration for coding agents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "AGENTFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of workflow definitions
    #[arg(long, global = true, default_value = DEFAULT_WORKFLOWS_DIR)]
    workflows_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow
    Run {
        /// Workflow name (from the workflows directory) or path to a definition file
        workflow: String,

        /// Input document id from the document store
        #[arg(long, conflicts_with_all = ["task", "file", "text"])]
        doc: Option<String>,

        /// Ad-hoc task; repeat for several
        #[arg(long, conflicts_with_all = ["file", "text"])]
        task: Vec<String>,

        /// Read the input from a file
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,

        /// Inline input text
        #[arg(long)]
        text: Option<String>,

        /// Title for inline input
        #[arg(long, default_value = "input")]
        title: String,

        /// Workflow variable override, `key=value`; repeatable
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// Give every agent run its own git worktree
        #[arg(long)]
        isolate: bool,

        /// Keep worktrees on disk after the run
        #[arg(long)]
        retain_worktrees: bool,

        /// Concurrency cap for every stage of this run
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Working directory for agents when not isolated
        #[arg(long)]
        working_dir: Option<PathBuf>,
    },

    /// Show the progress report of a run
    Status {
        /// Run id
        run_id: String,
    },

    /// List recent runs, newest first
    List {
        /// Only runs of this workflow
        #[arg(short, long)]
        workflow: Option<String>,

        /// Only runs in this status
        #[arg(short, long)]
        status: Option<RunStatus>,

        /// Maximum number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Validate workflow definitions
    Validate {
        /// Definition files; the whole workflows directory when omitted
        files: Vec<PathBuf>,
    },
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    agentflow_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            workflow,
            doc,
            task,
            file,
            text,
            title,
            vars,
            isolate,
            retain_worktrees,
            concurrency,
            working_dir,
        } => {
            let registry = WorkflowRegistry::load_dir(&cli.workflows_dir)
                .context("Failed to load workflow definitions")?;
            let definition = registry.resolve(&workflow)?;
            let input = build_input(doc, task, file.as_deref(), text, title)?;
            let options = RunOptions {
                variables: vars.into_iter().collect(),
                isolate,
                concurrency,
                working_dir,
                retain_worktrees: retain_worktrees.then_some(true),
                run_id: None,
            };
            let config = load_config(cli.config.as_deref())?;
            let (documents, runs) = open_stores().await?;
            cmd_run(config, documents, runs, &definition, input, options, cli.json).await
        }
        Commands::Status { run_id } => {
            let config = load_config(cli.config.as_deref())?;
            let (documents, runs) = open_stores().await?;
            let orchestrator = orchestrator(config, documents, runs);
            cmd_status(&orchestrator, &run_id, cli.json).await
        }
        Commands::List {
            workflow,
            status,
            limit,
        } => {
            let (_, runs) = open_stores().await?;
            let filter = RunFilter {
                workflow_name: workflow,
                status,
                limit: Some(limit),
            };
            cmd_list(runs.as_ref(), &filter, cli.json).await
        }
        Commands::Validate { files } => cmd_validate(&cli.workflows_dir, &files, cli.json),
    }
}

/// Connect to the store named by `AGENTFLOW_DB_*`.
async fn open_stores() -> Result<(Arc<dyn DocumentStore>, Arc<dyn RunStore>)> {
    let db = connect(&StoreConfig::from_env())
        .await
        .context("Failed to connect to agentflow store")?;
    let documents: Arc<dyn DocumentStore> = Arc::new(SurrealDocumentStore::new(db.clone()));
    let runs: Arc<dyn RunStore> = Arc::new(SurrealRunStore::new(db));
    Ok((documents, runs))
}

/// Engine configuration: the file if given (or present at the default
/// location), then environment overrides.
fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let mut config = match path {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).is_file() => EngineConfig::load(Path::new(DEFAULT_CONFIG))
            .with_context(|| format!("Failed to load config {DEFAULT_CONFIG}"))?,
        None => EngineConfig::default(),
    };
    config.apply_env().context("Invalid AGENTFLOW_* setting")?;
    Ok(config)
}

fn orchestrator(
    config: EngineConfig,
    documents: Arc<dyn DocumentStore>,
    runs: Arc<dyn RunStore>,
) -> Orchestrator {
    let runner = Arc::new(ProcessAgentRunner::new(config.agent.clone()));
    Orchestrator::new(config, runner, documents, runs)
}

fn build_input(
    doc: Option<String>,
    tasks: Vec<String>,
    file: Option<&Path>,
    text: Option<String>,
    title: String,
) -> Result<WorkflowInput> {
    if let Some(id) = doc {
        return Ok(WorkflowInput::Document(DocumentId::new(id)));
    }
    if !tasks.is_empty() {
        return Ok(WorkflowInput::Tasks(tasks));
    }
    if let Some(path) = file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read input file {}", path.display()))?;
        let title = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(title);
        return Ok(WorkflowInput::Inline { title, content });
    }
    match text {
        Some(content) => Ok(WorkflowInput::Inline { title, content }),
        None => bail!("no input given; use --doc, --task, --file or --text"),
    }
}

/// Execute a workflow; Ctrl-C cancels it.
async fn cmd_run(
    config: EngineConfig,
    documents: Arc<dyn DocumentStore>,
    runs: Arc<dyn RunStore>,
    workflow: &WorkflowDefinition,
    input: WorkflowInput,
    options: RunOptions,
    json: bool,
) -> Result<()> {
    let mut orchestrator = orchestrator(config.clone(), documents, runs);
    if options.isolate {
        if !git::is_git_repo(&config.repo_dir).await {
            bail!(
                "--isolate needs a git repository; {} is not one",
                config.repo_dir.display()
            );
        }
        let base = git::resolve_revision(&config.repo_dir, &config.base_revision)
            .await
            .with_context(|| format!("Failed to resolve {}", config.base_revision))?;
        info!(repo = %config.repo_dir.display(), base = %base, "isolating runs in worktrees");
        orchestrator = orchestrator
            .with_checkout_provider(Arc::new(GitCheckoutProvider::new(&config.repo_dir, base)));
    }

    let execution = orchestrator.execute(workflow, input, options);
    tokio::pin!(execution);
    let record = loop {
        tokio::select! {
            result = &mut execution => break result?,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                    break (&mut execution).await?;
                }
                let cancelled = orchestrator.cancel_all();
                warn!(cancelled, "interrupted; cancelling");
            }
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_run_summary(&record);
    }
    match record.status {
        RunStatus::Completed => Ok(()),
        status => bail!("workflow run {} {}", record.run_id, status),
    }
}

fn print_run_summary(record: &WorkflowRunRecord) {
    println!("Run {} ({})", record.run_id, record.workflow_name);
    println!("Status:  {}", record.status);
    println!(
        "Tokens:  {} in / {} out (${:.4})",
        record.usage.input_tokens, record.usage.output_tokens, record.usage.cost_usd
    );
    for error in &record.errors {
        match error.run_index {
            Some(i) => println!("  ! {}[{}] {}: {}", error.stage, i, error.kind, error.message),
            None => println!("  ! {} {}: {}", error.stage, error.kind, error.message),
        }
    }
}

/// Show the progress report of a run
async fn cmd_status(orchestrator: &Orchestrator, run_id: &str, json: bool) -> Result<()> {
    let report = orchestrator
        .status(&RunId(run_id.to_string()))
        .await
        .with_context(|| format!("Failed to load run {run_id}"))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_report(&report));
    }
    Ok(())
}

fn render_report(report: &ProgressReport) -> String {
    let mut out = format!(
        "Run {} ({}): {}\n",
        report.run_id, report.workflow_name, report.status
    );
    for stage in &report.stages {
        out.push_str(&format!(
            "  {:<20} {:<12} {:<10} {}/{} done, {} failed, {} running\n",
            stage.name,
            stage.mode,
            stage.status.as_str(),
            stage.runs_completed,
            stage.runs_total,
            stage.runs_failed,
            stage.runs_running,
        ));
    }
    out.push_str(&format!(
        "Tokens: {} in / {} out (${:.4})\n",
        report.usage.input_tokens, report.usage.output_tokens, report.usage.cost_usd
    ));
    for error in &report.errors {
        out.push_str(&format!("  ! {} {}: {}\n", error.stage, error.kind, error.message));
    }
    out
}

/// List recent runs
async fn cmd_list(runs: &dyn RunStore, filter: &RunFilter, json: bool) -> Result<()> {
    let records = runs.list_workflow_runs(filter).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No runs found.");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {:<10} {:<24} {}",
            record.run_id.short(),
            record.status.as_str(),
            record.workflow_name,
            record.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

/// Validate definitions; every problem is reported before failing.
fn cmd_validate(workflows_dir: &Path, files: &[PathBuf], json: bool) -> Result<()> {
    let mut results: BTreeMap<String, Option<String>> = BTreeMap::new();
    if files.is_empty() {
        match WorkflowRegistry::load_dir(workflows_dir) {
            Ok(registry) => {
                for name in registry.names() {
                    results.insert(name.to_string(), None);
                }
            }
            Err(e) => {
                results.insert(workflows_dir.display().to_string(), Some(e.to_string()));
            }
        }
    } else {
        for path in files {
            let outcome = WorkflowDefinition::load(path).err().map(|e| e.to_string());
            results.insert(path.display().to_string(), outcome);
        }
    }

    let failures = results.values().filter(|r| r.is_some()).count();
    if json {
        let value: serde_json::Map<String, serde_json::Value> = results
            .iter()
            .map(|(name, err)| {
                let entry = match err {
                    Some(e) => serde_json::json!({ "valid": false, "error": e }),
                    None => serde_json::json!({ "valid": true }),
                };
                (name.clone(), entry)
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        if results.is_empty() {
            println!("No workflow definitions found in {}", workflows_dir.display());
        }
        for (name, err) in &results {
            match err {
                Some(e) => println!("✗ {name}: {e}"),
                None => println!("✓ {name}"),
            }
        }
    }
    if failures > 0 {
        bail!("{failures} invalid workflow definition(s)");
    }
    Ok(())
}
