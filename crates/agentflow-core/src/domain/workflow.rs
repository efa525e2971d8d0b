//! Workflow definitions: an ordered list of stages, each executed in one mode.
//!
//! Definitions are loaded from TOML or JSON and validated up front, so a
//! misconfigured stage never reaches execution.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::error::ConfigError;

/// Variable name a dynamic stage binds each discovered item to, unless configured.
pub const DEFAULT_ITEM_VAR: &str = "item";

fn default_item_var() -> String {
    DEFAULT_ITEM_VAR.to_string()
}

fn default_runs() -> u32 {
    1
}

/// One prompt template or several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptSet {
    One(String),
    Many(Vec<String>),
}

impl PromptSet {
    pub fn templates(&self) -> &[String] {
        match self {
            PromptSet::One(t) => std::slice::from_ref(t),
            PromptSet::Many(ts) => ts,
        }
    }
}

/// Execution mode of a stage. Each variant owns exactly the fields it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StageMode {
    Single {
        prompt: String,
    },
    Parallel {
        prompt: PromptSet,
        /// Defaults to the number of prompt templates.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        runs: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        synthesis: Option<String>,
    },
    Iterative {
        prompt: String,
        #[serde(default = "default_runs")]
        runs: u32,
    },
    Adversarial {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        advocate: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        critic: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        synthesizer: Option<String>,
    },
    Dynamic {
        prompt: String,
        discovery: String,
        #[serde(default = "default_item_var")]
        item_var: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        synthesis: Option<String>,
    },
}

impl StageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageMode::Single { .. } => "single",
            StageMode::Parallel { .. } => "parallel",
            StageMode::Iterative { .. } => "iterative",
            StageMode::Adversarial { .. } => "adversarial",
            StageMode::Dynamic { .. } => "dynamic",
        }
    }

    /// Number of agent invocations known before execution.
    ///
    /// `None` for dynamic stages, whose item count comes from discovery.
    pub fn planned_runs(&self) -> Option<u32> {
        match self {
            StageMode::Single { .. } => Some(1),
            StageMode::Parallel { prompt, runs, .. } => {
                Some(runs.unwrap_or(prompt.templates().len() as u32))
            }
            StageMode::Iterative { runs, .. } => Some(*runs),
            StageMode::Adversarial { .. } => Some(3),
            StageMode::Dynamic { .. } => None,
        }
    }

    pub fn synthesis(&self) -> Option<&str> {
        match self {
            StageMode::Parallel { synthesis, .. } | StageMode::Dynamic { synthesis, .. } => {
                synthesis.as_deref()
            }
            _ => None,
        }
    }
}

/// Configuration of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(flatten)]
    pub mode: StageMode,
    /// Concurrency cap for parallel and dynamic stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Per-run timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl StageConfig {
    pub fn new(name: impl Into<String>, mode: StageMode) -> Self {
        Self {
            name: name.into(),
            mode,
            concurrency: None,
            timeout_secs: None,
            continue_on_failure: false,
        }
    }

    pub fn with_concurrency(mut self, cap: usize) -> Self {
        self.concurrency = Some(cap);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }

    /// Check the per-mode invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = self.name.as_str();
        if name.trim().is_empty() {
            return Err(ConfigError::stage("<unnamed>", "stage name must not be empty"));
        }
        if self.concurrency == Some(0) {
            return Err(ConfigError::stage(name, "concurrency must be >= 1"));
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::stage(name, "timeout_secs must be > 0"));
        }

        let require = |field: &str, value: &str| {
            if value.trim().is_empty() {
                Err(ConfigError::stage(name, format!("{field} must not be empty")))
            } else {
                Ok(())
            }
        };

        match &self.mode {
            StageMode::Single { prompt } => require("prompt", prompt)?,
            StageMode::Parallel {
                prompt,
                runs,
                synthesis,
            } => {
                if prompt.templates().is_empty() {
                    return Err(ConfigError::stage(name, "at least one prompt is required"));
                }
                for template in prompt.templates() {
                    require("prompt", template)?;
                }
                if *runs == Some(0) {
                    return Err(ConfigError::stage(name, "runs must be >= 1"));
                }
                match synthesis {
                    Some(s) => require("synthesis", s)?,
                    None => {
                        return Err(ConfigError::stage(
                            name,
                            "parallel stage requires a synthesis template",
                        ))
                    }
                }
            }
            StageMode::Iterative { prompt, runs } => {
                require("prompt", prompt)?;
                if *runs == 0 {
                    return Err(ConfigError::stage(name, "runs must be >= 1"));
                }
            }
            StageMode::Adversarial {
                advocate,
                critic,
                synthesizer,
            } => {
                for (field, value) in [
                    ("advocate", advocate),
                    ("critic", critic),
                    ("synthesizer", synthesizer),
                ] {
                    if let Some(v) = value {
                        require(field, v)?;
                    }
                }
            }
            StageMode::Dynamic {
                prompt,
                discovery,
                item_var,
                synthesis,
            } => {
                require("prompt", prompt)?;
                require("discovery", discovery)?;
                if !is_identifier(item_var) {
                    return Err(ConfigError::stage(
                        name,
                        format!("item_var {item_var:?} is not a valid identifier"),
                    ));
                }
                match synthesis {
                    Some(s) => require("synthesis", s)?,
                    None => {
                        return Err(ConfigError::stage(
                            name,
                            "dynamic stage requires a synthesis template",
                        ))
                    }
                }
            }
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Immutable workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Default variable values; invocation variables override them.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, stages: Vec<StageConfig>) -> Self {
        Self {
            name: name.into(),
            description: None,
            variables: BTreeMap::new(),
            stages,
        }
    }

    /// Validate the whole definition. Stage names must be unique.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyWorkflowName);
        }
        if self.stages.is_empty() {
            return Err(ConfigError::NoStages {
                workflow: self.name.clone(),
            });
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::DuplicateStage(stage.name.clone()));
            }
            stage.validate()?;
        }
        Ok(())
    }

    /// Parse and validate a TOML definition.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let def: Self = toml::from_str(source).map_err(|e| ConfigError::Parse {
            source_name: "workflow (toml)".to_string(),
            message: e.to_string(),
        })?;
        def.validate()?;
        Ok(def)
    }

    /// Parse and validate a JSON definition.
    pub fn from_json_str(source: &str) -> Result<Self, ConfigError> {
        let def: Self = serde_json::from_str(source).map_err(|e| ConfigError::Parse {
            source_name: "workflow (json)".to_string(),
            message: e.to_string(),
        })?;
        def.validate()?;
        Ok(def)
    }

    /// Load from a file; `.json` files are JSON, everything else TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        let parsed = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            Self::from_json_str(&source)
        } else {
            Self::from_toml_str(&source)
        };
        parsed.map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                source_name: path.display().to_string(),
                message,
            },
            other => other,
        })
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REVIEW: &str = r#"
name = "review"
description = "Analyze, fan out reviewers, summarize"

[variables]
focus = "security"

[[stages]]
name = "analyze"
mode = "single"
prompt = "Analyze {{input}}"

[[stages]]
name = "reviewers"
mode = "parallel"
prompt = ["Review for {{focus}}: {{analyze}}", "Review for style: {{analyze}}"]
runs = 3
synthesis = "Combine:\n{{outputs}}"
concurrency = 2

[[stages]]
name = "per-file"
mode = "dynamic"
prompt = "Inspect {{file}}"
discovery = "git ls-files '*.rs'"
item_var = "file"
synthesis = "Merge {{output_count}} reports:\n{{outputs}}"
continue_on_failure = true
"#;

    #[test]
    fn test_parse_toml_workflow() {
        let def = WorkflowDefinition::from_toml_str(REVIEW).unwrap();
        assert_eq!(def.name, "review");
        assert_eq!(def.stages.len(), 3);
        assert_eq!(def.variables.get("focus").map(String::as_str), Some("security"));

        let reviewers = def.stage("reviewers").unwrap();
        assert_eq!(reviewers.mode.as_str(), "parallel");
        assert_eq!(reviewers.mode.planned_runs(), Some(3));
        assert_eq!(reviewers.concurrency, Some(2));

        let dynamic = def.stage("per-file").unwrap();
        assert!(dynamic.continue_on_failure);
        assert_eq!(dynamic.mode.planned_runs(), None);
        match &dynamic.mode {
            StageMode::Dynamic { item_var, .. } => assert_eq!(item_var, "file"),
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn test_parallel_without_synthesis_rejected() {
        let src = r#"
name = "broken"
[[stages]]
name = "fan"
mode = "parallel"
prompt = "x"
runs = 2
"#;
        let err = WorkflowDefinition::from_toml_str(src).unwrap_err();
        assert!(err.to_string().contains("synthesis"), "got: {err}");
    }

    #[test]
    fn test_dynamic_without_synthesis_rejected() {
        let stage = StageConfig::new(
            "items",
            StageMode::Dynamic {
                prompt: "do {{item}}".into(),
                discovery: "ls".into(),
                item_var: DEFAULT_ITEM_VAR.into(),
                synthesis: None,
            },
        );
        assert!(matches!(
            stage.validate(),
            Err(ConfigError::InvalidStage { .. })
        ));
    }

    #[test]
    fn test_dynamic_requires_discovery_command() {
        let src = r#"
name = "broken"
[[stages]]
name = "items"
mode = "dynamic"
prompt = "x"
synthesis = "y"
"#;
        // Missing field is a parse error, empty field a validation error.
        assert!(WorkflowDefinition::from_toml_str(src).is_err());

        let stage = StageConfig::new(
            "items",
            StageMode::Dynamic {
                prompt: "x".into(),
                discovery: "  ".into(),
                item_var: DEFAULT_ITEM_VAR.into(),
                synthesis: Some("y".into()),
            },
        );
        assert!(stage.validate().is_err());
    }

    #[test]
    fn test_zero_runs_rejected() {
        let stage = StageConfig::new(
            "loop",
            StageMode::Iterative {
                prompt: "again".into(),
                runs: 0,
            },
        );
        assert!(stage.validate().is_err());
    }

    #[test]
    fn test_duplicate_stage_names_rejected() {
        let single = || {
            StageConfig::new(
                "same",
                StageMode::Single {
                    prompt: "p".into(),
                },
            )
        };
        let def = WorkflowDefinition::new("dup", vec![single(), single()]);
        assert!(matches!(
            def.validate(),
            Err(ConfigError::DuplicateStage(name)) if name == "same"
        ));
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let def = WorkflowDefinition::new("empty", vec![]);
        assert!(matches!(def.validate(), Err(ConfigError::NoStages { .. })));
    }

    #[test]
    fn test_json_round_trip_keeps_mode_fields() {
        let def = WorkflowDefinition::from_toml_str(REVIEW).unwrap();
        let json = serde_json::to_string(&def).unwrap();
        let back = WorkflowDefinition::from_json_str(&json).unwrap();
        assert_eq!(def, back);
    }

    #[test]
    fn test_adversarial_defaults_to_three_phases() {
        let src = r#"
name = "debate"
[[stages]]
name = "argue"
mode = "adversarial"
"#;
        let def = WorkflowDefinition::from_toml_str(src).unwrap();
        assert_eq!(def.stages[0].mode.planned_runs(), Some(3));
    }

    #[test]
    fn test_load_from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "name = ").unwrap();
        let err = WorkflowDefinition::load(&path).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }
}
