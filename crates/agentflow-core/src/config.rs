//! Engine configuration.
//!
//! Loaded from an optional TOML file, then overridden from `AGENTFLOW_*`
//! environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentCommand, PromptDelivery};
use crate::domain::{ConfigError, StageConfig};
use crate::retry::RetryPolicy;

/// Concurrency cap used when neither the run nor the stage sets one.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Default per-run timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub agent: AgentCommand,
    /// Per-run transcript logs go under `<log_dir>/<run_id>/`.
    pub log_dir: PathBuf,
    pub concurrency: usize,
    /// `None` disables the timeout.
    pub timeout_secs: Option<u64>,
    /// Repository isolated runs check out from.
    pub repo_dir: PathBuf,
    pub base_revision: String,
    pub worktree_dir: PathBuf,
    pub retain_worktrees: bool,
    pub checkout_retry: RetryPolicy,
    pub discovery_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent: AgentCommand {
                program: "claude".to_string(),
                args: vec![
                    "--print".to_string(),
                    "--output-format".to_string(),
                    "stream-json".to_string(),
                    "--verbose".to_string(),
                ],
                prompt_delivery: PromptDelivery::Argument,
            },
            log_dir: PathBuf::from(".agentflow/logs"),
            concurrency: DEFAULT_CONCURRENCY,
            timeout_secs: Some(DEFAULT_TIMEOUT_SECS),
            repo_dir: PathBuf::from("."),
            base_revision: "HEAD".to_string(),
            worktree_dir: PathBuf::from(".agentflow/worktrees"),
            retain_worktrees: false,
            checkout_retry: RetryPolicy::default(),
            discovery_timeout_secs: 60,
        }
    }
}

fn parse_setting<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidSetting {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidSetting {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Parse {
            source_name: "engine config".to_string(),
            message: e.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        toml::from_str(&source).map_err(|e| ConfigError::Parse {
            source_name: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("AGENTFLOW_AGENT_BIN") {
            self.agent.program = v;
        }
        if let Some(v) = lookup("AGENTFLOW_AGENT_ARGS") {
            self.agent.args = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = lookup("AGENTFLOW_PROMPT_STDIN") {
            if parse_bool("AGENTFLOW_PROMPT_STDIN", &v)? {
                self.agent.prompt_delivery = PromptDelivery::Stdin;
            }
        }
        if let Some(v) = lookup("AGENTFLOW_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTFLOW_CONCURRENCY") {
            let n: usize = parse_setting("AGENTFLOW_CONCURRENCY", &v)?;
            if n == 0 {
                return Err(ConfigError::InvalidSetting {
                    key: "AGENTFLOW_CONCURRENCY".to_string(),
                    value: v,
                });
            }
            self.concurrency = n;
        }
        if let Some(v) = lookup("AGENTFLOW_TIMEOUT_SECS") {
            let secs: u64 = parse_setting("AGENTFLOW_TIMEOUT_SECS", &v)?;
            self.timeout_secs = (secs > 0).then_some(secs);
        }
        if let Some(v) = lookup("AGENTFLOW_REPO_DIR") {
            self.repo_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTFLOW_BASE_REVISION") {
            self.base_revision = v;
        }
        if let Some(v) = lookup("AGENTFLOW_WORKTREE_DIR") {
            self.worktree_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("AGENTFLOW_RETAIN_WORKTREES") {
            self.retain_worktrees = parse_bool("AGENTFLOW_RETAIN_WORKTREES", &v)?;
        }
        Ok(())
    }

    /// Concurrency for a stage: run override, else stage cap, else default.
    pub fn effective_concurrency(&self, run_override: Option<usize>, stage_cap: Option<usize>) -> usize {
        run_override
            .or(stage_cap)
            .unwrap_or(self.concurrency)
            .max(1)
    }

    /// Per-run timeout for a stage.
    pub fn stage_timeout(&self, stage: &StageConfig) -> Option<Duration> {
        stage
            .timeout_secs
            .or(self.timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs.max(1))
    }
}
