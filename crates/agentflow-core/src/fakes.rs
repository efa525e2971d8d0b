//! Test doubles for the engine's external seams.
//!
//! - [`ScriptedAgentRunner`]: an agent whose replies come from a closure and
//!   whose artifacts land in a real [`DocumentStore`].
//! - [`DirCheckoutProvider`]: checkouts as plain directories.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agentflow_state::{DocumentId, DocumentStore, NewDocument, TokenUsage};
use async_trait::async_trait;

use crate::agent::{wait_for_cancel, AgentRequest, AgentRunner, RunFailure, RunOutcome};
use crate::domain::CheckoutError;
use crate::worktree::CheckoutProvider;

/// What the scripted agent does for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedReply {
    /// Store `content` as a document and report its id.
    Artifact { content: String, usage: TokenUsage },
    /// Fail with the given failure.
    Fail(RunFailure),
    /// Exit cleanly without reporting an id.
    NoArtifact,
    /// Report an id the document store does not have.
    UnknownArtifact(String),
}

impl ScriptedReply {
    pub fn text(content: impl Into<String>) -> Self {
        ScriptedReply::Artifact {
            content: content.into(),
            usage: TokenUsage::default(),
        }
    }
}

type Script = dyn Fn(&AgentRequest) -> ScriptedReply + Send + Sync;

/// Agent runner driven by a closure.
pub struct ScriptedAgentRunner {
    documents: Arc<dyn DocumentStore>,
    script: Box<Script>,
    delay: Option<Duration>,
    requests: Mutex<Vec<AgentRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedAgentRunner {
    pub fn new<F>(documents: Arc<dyn DocumentStore>, script: F) -> Self
    where
        F: Fn(&AgentRequest) -> ScriptedReply + Send + Sync + 'static,
    {
        Self {
            documents,
            script: Box::new(script),
            delay: None,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every call succeeds; the artifact content is `"<label>: <prompt>"`.
    pub fn echo(documents: Arc<dyn DocumentStore>) -> Self {
        Self::new(documents, |req| {
            ScriptedReply::text(format!("{}: {}", req.label, req.prompt))
        })
    }

    /// Hold every call for `delay` (cancellable) before replying.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.prompt).collect()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Highest number of calls observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn reply(&self, request: &AgentRequest, start: Instant) -> RunOutcome {
        let elapsed = || start.elapsed().as_millis() as u64;
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_cancel(request.cancel.clone()) => {
                    return RunOutcome::failed(RunFailure::Cancelled, TokenUsage::default(), elapsed());
                }
            }
        }
        match (self.script)(request) {
            ScriptedReply::Artifact { content, usage } => {
                let doc = NewDocument::new(request.label.clone(), content);
                match self.documents.put(doc).await {
                    Ok(id) => RunOutcome::succeeded(id, usage, elapsed()),
                    Err(e) => RunOutcome::failed(
                        RunFailure::Spawn {
                            message: e.to_string(),
                        },
                        usage,
                        elapsed(),
                    ),
                }
            }
            ScriptedReply::Fail(failure) => {
                RunOutcome::failed(failure, TokenUsage::default(), elapsed())
            }
            ScriptedReply::NoArtifact => {
                RunOutcome::failed(RunFailure::NoArtifact, TokenUsage::default(), elapsed())
                    .with_exit_code(Some(0))
            }
            ScriptedReply::UnknownArtifact(id) => {
                RunOutcome::succeeded(DocumentId::new(id), TokenUsage::default(), elapsed())
            }
        }
    }
}

#[async_trait]
impl AgentRunner for ScriptedAgentRunner {
    async fn run(&self, request: AgentRequest) -> RunOutcome {
        self.requests.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let outcome = self.reply(&request, Instant::now()).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Checkout provider backed by plain directories.
#[derive(Debug, Default)]
pub struct DirCheckoutProvider {
    failures_left: AtomicU32,
    create_attempts: AtomicU32,
    create_delay: Option<Duration>,
}

impl DirCheckoutProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` creates with a transient error.
    pub fn fail_creates(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Make every create take `delay` after the directory appears, like a
    /// slow `git worktree add` that has already written the checkout.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn create_attempts(&self) -> u32 {
        self.create_attempts.load(Ordering::SeqCst)
    }
}

fn fatal(e: std::io::Error) -> CheckoutError {
    CheckoutError::Fatal(e.to_string())
}

#[async_trait]
impl CheckoutProvider for DirCheckoutProvider {
    async fn create(&self, path: &Path, _branch: &str) -> Result<(), CheckoutError> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(CheckoutError::Transient("index.lock exists".to_string()));
        }
        tokio::fs::create_dir_all(path).await.map_err(fatal)?;
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn reset(&self, path: &Path) -> Result<(), CheckoutError> {
        let mut entries = tokio::fs::read_dir(path).await.map_err(fatal)?;
        while let Some(entry) = entries.next_entry().await.map_err(fatal)? {
            let p = entry.path();
            if entry.file_type().await.map_err(fatal)?.is_dir() {
                tokio::fs::remove_dir_all(&p).await.map_err(fatal)?;
            } else {
                tokio::fs::remove_file(&p).await.map_err(fatal)?;
            }
        }
        Ok(())
    }

    async fn remove(&self, path: &Path, _branch: &str) -> Result<(), CheckoutError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(fatal(e)),
        }
    }
}
