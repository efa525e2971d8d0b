//! Named workflow definitions loaded from a directory.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::domain::{ConfigError, WorkflowDefinition};

fn is_definition_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("toml") | Some("json")
    )
}

/// Workflow definitions keyed by name.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRegistry {
    workflows: BTreeMap<String, WorkflowDefinition>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.toml` / `*.json` definition in `dir`.
    ///
    /// Each file is validated. Two files defining the same workflow name is
    /// an error. A missing directory yields an empty registry.
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "workflow directory not found");
            return Ok(registry);
        }
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_definition_file(p))
            .collect();
        paths.sort();
        for path in paths {
            let def = WorkflowDefinition::load(&path)?;
            debug!(workflow = %def.name, path = %path.display(), "loaded workflow");
            registry.insert(def)?;
        }
        Ok(registry)
    }

    /// Add a validated definition.
    pub fn insert(&mut self, def: WorkflowDefinition) -> Result<(), ConfigError> {
        def.validate()?;
        if self.workflows.contains_key(&def.name) {
            return Err(ConfigError::InvalidSetting {
                key: "workflow".to_string(),
                value: format!("{} is defined more than once", def.name),
            });
        }
        self.workflows.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.workflows.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.workflows.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Look up by name, falling back to treating `name_or_path` as a file.
    pub fn resolve(&self, name_or_path: &str) -> Result<WorkflowDefinition, ConfigError> {
        if let Some(def) = self.get(name_or_path) {
            return Ok(def.clone());
        }
        let path = Path::new(name_or_path);
        if path.is_file() {
            return WorkflowDefinition::load(path);
        }
        Err(ConfigError::UnknownWorkflow(name_or_path.to_string()))
    }
}
