//! Spawning the external agent process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agentflow_state::TokenUsage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agent::outcome::{RunFailure, RunOutcome};
use crate::agent::parser;

/// Environment variable naming the result side-channel file.
pub const RESULT_FILE_ENV: &str = "AGENTFLOW_RESULT_FILE";

/// Appended to every prompt so the agent reports where its answer went.
pub const ARTIFACT_INSTRUCTION: &str = "When you are finished, save your final answer as a document \
and report its identifier on a line of its own in the form `ARTIFACT_ID: <id>`. \
If the AGENTFLOW_RESULT_FILE environment variable is set, also write the identifier to that file.";

/// How long to wait for output pipes to drain after the process exits.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Lines of stderr kept in failure messages.
const STDERR_TAIL_LINES: usize = 20;

/// One invocation request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Resolved prompt, without the artifact instruction.
    pub prompt: String,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Human label (`run-2`, `critic`, a dynamic item).
    pub label: String,
    /// Where to stream the transcript.
    pub log_path: Option<PathBuf>,
    /// Workflow-level cancellation signal.
    pub cancel: Option<watch::Receiver<bool>>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            working_dir: None,
            timeout: None,
            label: label.into(),
            log_path: None,
            cancel: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }
}

/// Something that can execute an agent invocation.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: AgentRequest) -> RunOutcome;
}

/// Resolve once `cancel` flips to true. Never resolves without a receiver,
/// or once the sender is gone.
pub async fn wait_for_cancel(cancel: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = cancel else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending().await,
    }
}

/// How the prompt reaches the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptDelivery {
    /// Appended as the last command-line argument.
    #[default]
    Argument,
    /// Written to the process's stdin.
    Stdin,
}

/// Agent command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub prompt_delivery: PromptDelivery,
}

/// Runs the agent as a subprocess, one process per invocation.
#[derive(Debug, Clone)]
pub struct ProcessAgentRunner {
    command: AgentCommand,
    instruction: String,
}

enum Exit {
    Status(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ProcessAgentRunner {
    pub fn new(command: AgentCommand) -> Self {
        Self {
            command,
            instruction: ARTIFACT_INSTRUCTION.to_string(),
        }
    }

    /// Replace the standard artifact instruction.
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    fn full_prompt(&self, prompt: &str) -> String {
        if self.instruction.is_empty() {
            prompt.to_string()
        } else {
            format!("{prompt}\n\n{}", self.instruction)
        }
    }

    fn result_file_for(request: &AgentRequest) -> (PathBuf, bool) {
        match &request.log_path {
            Some(log) => (log.with_extension("result"), false),
            None => (
                std::env::temp_dir().join(format!("agentflow-{}.result", uuid::Uuid::new_v4())),
                true,
            ),
        }
    }
}

async fn open_log(path: &Path) -> Option<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(path = %parent.display(), error = %e, "cannot create log directory");
            return None;
        }
    }
    match tokio::fs::File::create(path).await {
        Ok(f) => Some(f),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot create transcript log");
            None
        }
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Copy stdout line by line into `transcript` and the log file.
///
/// The pipe is drained to EOF whatever the bytes are; invalid UTF-8 is replaced
/// in the transcript and written to the log untouched.
fn spawn_stdout_reader<R>(
    stdout: R,
    mut log: Option<tokio::fs::File>,
    transcript: Arc<Mutex<String>>,
) -> JoinHandle<Option<tokio::fs::File>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "failed to read agent stdout");
                    break;
                }
            }
            if let Some(file) = log.as_mut() {
                if file.write_all(&line).await.is_err() {
                    log = None;
                }
            }
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\n', '\r']);
            let mut t = transcript.lock().unwrap_or_else(|e| e.into_inner());
            t.push_str(text);
            t.push('\n');
        }
        log
    })
}

#[async_trait]
impl AgentRunner for ProcessAgentRunner {
    async fn run(&self, request: AgentRequest) -> RunOutcome {
        let start = Instant::now();
        let elapsed = |start: Instant| start.elapsed().as_millis() as u64;

        if request.is_cancelled() {
            return RunOutcome::failed(RunFailure::Cancelled, TokenUsage::default(), 0);
        }

        let prompt = self.full_prompt(&request.prompt);
        let (result_file, temporary_result) = Self::result_file_for(&request);
        let _ = tokio::fs::remove_file(&result_file).await;

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args);
        match self.command.prompt_delivery {
            PromptDelivery::Argument => {
                cmd.arg(&prompt).stdin(Stdio::null());
            }
            PromptDelivery::Stdin => {
                cmd.stdin(Stdio::piped());
            }
        }
        cmd.env(RESULT_FILE_ENV, &result_file)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return RunOutcome::failed(
                    RunFailure::Spawn {
                        message: format!("{}: {e}", self.command.program),
                    },
                    TokenUsage::default(),
                    elapsed(start),
                )
                .with_log_path(request.log_path.clone());
            }
        };
        debug!(label = %request.label, pid = child.id(), "agent process spawned");

        if let Some(mut stdin) = child.stdin.take() {
            let input = prompt.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    warn!(error = %e, "failed to write prompt to agent stdin");
                }
                // Dropping stdin closes it so the agent sees EOF.
            });
        }

        let log = match &request.log_path {
            Some(path) => open_log(path).await,
            None => None,
        };
        let transcript = Arc::new(Mutex::new(String::new()));
        let stdout_task = child
            .stdout
            .take()
            .map(|out| spawn_stdout_reader(out, log, Arc::clone(&transcript)));
        let stderr_task = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = err.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let exit = tokio::select! {
            status = child.wait() => Exit::Status(status),
            _ = sleep_or_forever(request.timeout) => Exit::TimedOut,
            _ = wait_for_cancel(request.cancel.clone()) => Exit::Cancelled,
        };

        let killed = match exit {
            Exit::Status(status) => Ok(status),
            Exit::TimedOut => Err(RunFailure::Timeout {
                millis: request.timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
            }),
            Exit::Cancelled => Err(RunFailure::Cancelled),
        };
        let status = match killed {
            Ok(status) => status,
            Err(failure) => {
                if let Err(e) = child.kill().await {
                    warn!(label = %request.label, error = %e, "failed to kill agent process");
                }
                // Grandchildren may still hold the pipes open; don't wait on them.
                if let Some(t) = stdout_task {
                    t.abort();
                }
                if let Some(t) = stderr_task {
                    t.abort();
                }
                if temporary_result {
                    let _ = tokio::fs::remove_file(&result_file).await;
                }
                warn!(label = %request.label, kind = failure.kind(), "agent process killed");
                return RunOutcome::failed(failure, TokenUsage::default(), elapsed(start))
                    .with_log_path(request.log_path.clone());
            }
        };

        let mut log = None;
        if let Some(task) = stdout_task {
            match tokio::time::timeout(PIPE_DRAIN_GRACE, task).await {
                Ok(Ok(file)) => log = file,
                Ok(Err(e)) => warn!(error = %e, "stdout reader failed"),
                Err(_) => warn!(label = %request.label, "stdout still open after exit; truncating transcript"),
            }
        }
        let stderr = match stderr_task {
            Some(task) => match tokio::time::timeout(PIPE_DRAIN_GRACE, task).await {
                Ok(Ok(buf)) => buf,
                _ => String::new(),
            },
            None => String::new(),
        };
        if let Some(file) = log.as_mut() {
            if !stderr.is_empty() {
                let _ = file.write_all(b"\n--- stderr ---\n").await;
                let _ = file.write_all(stderr.as_bytes()).await;
            }
            let _ = file.flush().await;
        }

        let transcript = transcript
            .lock()
            .map(|t| t.clone())
            .unwrap_or_else(|e| e.into_inner().clone());
        let duration_ms = elapsed(start);

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return RunOutcome::failed(
                    RunFailure::Spawn {
                        message: format!("wait failed: {e}"),
                    },
                    TokenUsage::default(),
                    duration_ms,
                )
                .with_log_path(request.log_path.clone());
            }
        };

        let result = match tokio::fs::read_to_string(&result_file).await {
            Ok(contents) => parser::parse_result_file(&contents),
            Err(_) => parser::ResultFile::default(),
        };
        if temporary_result {
            let _ = tokio::fs::remove_file(&result_file).await;
        }
        let usage = result
            .usage
            .unwrap_or_else(|| parser::parse_usage(&transcript));

        if !status.success() {
            return RunOutcome::failed(
                RunFailure::Exit {
                    code: status.code(),
                    stderr_tail: tail(&stderr, STDERR_TAIL_LINES),
                },
                usage,
                duration_ms,
            )
            .with_exit_code(status.code())
            .with_log_path(request.log_path.clone());
        }

        let artifact_id = result
            .artifact_id
            .or_else(|| parser::parse_artifact_id(&transcript));
        match artifact_id {
            Some(id) => RunOutcome::succeeded(id, usage, duration_ms)
                .with_log_path(request.log_path.clone()),
            None => RunOutcome::failed(RunFailure::NoArtifact, usage, duration_ms)
                .with_exit_code(status.code())
                .with_log_path(request.log_path.clone()),
        }
    }
}
