//! Execution context: the variable environment of one workflow run.
//!
//! The context only grows. Input, user variables, loaded documents and stage
//! outputs each have their own accessors; [`ExecutionContext::bindings`]
//! flattens them into the map the template resolver reads.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use agentflow_state::{Document, DocumentId};
use serde_json::{json, Value};

use crate::domain::Artifact;
use crate::template::Bindings;

/// What a workflow run is started against.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowInput {
    /// A document already in the store.
    Document(DocumentId),
    /// Ad-hoc task strings.
    Tasks(Vec<String>),
    Inline { title: String, content: String },
}

impl WorkflowInput {
    /// Value persisted as the run's input reference.
    pub fn input_ref(&self) -> String {
        match self {
            WorkflowInput::Document(id) => id.to_string(),
            WorkflowInput::Tasks(_) => "tasks".to_string(),
            WorkflowInput::Inline { .. } => "inline".to_string(),
        }
    }
}

/// Outputs a finished stage contributes to later stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    /// The stage's final output: the single run, the last iteration, or the synthesis.
    pub artifact: Option<Artifact>,
    /// Successful individual outputs, in run order.
    pub outputs: Vec<Artifact>,
    pub synthesis: Option<Artifact>,
}

impl StageOutput {
    fn to_value(&self) -> Value {
        let text = |a: &Option<Artifact>| {
            a.as_ref()
                .map(|a| Value::String(a.content.clone()))
                .unwrap_or(Value::Null)
        };
        json!({
            "output": text(&self.artifact),
            "id": self.artifact.as_ref().map(|a| a.id.to_string()),
            "outputs": self.outputs.iter().map(|a| a.content.clone()).collect::<Vec<_>>(),
            "synthesis": text(&self.synthesis),
        })
    }
}

/// Typed, append-only variable environment scoped to one workflow run.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    input_title: String,
    input_content: String,
    input_id: Option<DocumentId>,
    tasks: Vec<String>,
    variables: BTreeMap<String, Value>,
    documents: HashMap<DocumentId, Document>,
    stage_outputs: BTreeMap<String, StageOutput>,
    working_dir: Option<PathBuf>,
    concurrency_override: Option<usize>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    // -- input ---------------------------------------------------------------

    pub fn set_input(&mut self, title: impl Into<String>, content: impl Into<String>) {
        self.input_title = title.into();
        self.input_content = content.into();
    }

    /// Use a loaded document as the input and keep it in the document cache.
    pub fn set_input_document(&mut self, doc: Document) {
        self.set_input(doc.title.clone(), doc.content.clone());
        self.input_id = Some(doc.id.clone());
        self.cache_document(doc);
    }

    /// Ad-hoc tasks become a bulleted input plus a `tasks` list binding.
    pub fn set_tasks(&mut self, tasks: Vec<String>) {
        let content = tasks
            .iter()
            .map(|t| format!("- {t}"))
            .collect::<Vec<_>>()
            .join("\n");
        let title = match tasks.as_slice() {
            [only] => only.clone(),
            _ => format!("{} tasks", tasks.len()),
        };
        self.set_input(title, content);
        self.tasks = tasks;
    }

    pub fn input_title(&self) -> &str {
        &self.input_title
    }

    pub fn input_content(&self) -> &str {
        &self.input_content
    }

    pub fn input_id(&self) -> Option<&DocumentId> {
        self.input_id.as_ref()
    }

    // -- variables -----------------------------------------------------------

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    // -- documents -----------------------------------------------------------

    pub fn cache_document(&mut self, doc: Document) {
        self.documents.insert(doc.id.clone(), doc);
    }

    pub fn document(&self, id: &DocumentId) -> Option<&Document> {
        self.documents.get(id)
    }

    // -- stage outputs -------------------------------------------------------

    pub fn record_stage_output(&mut self, stage: impl Into<String>, output: StageOutput) {
        self.stage_outputs.entry(stage.into()).or_insert(output);
    }

    pub fn stage_output(&self, stage: &str) -> Option<&StageOutput> {
        self.stage_outputs.get(stage)
    }

    // -- internal fields -----------------------------------------------------

    pub fn set_working_dir(&mut self, dir: Option<PathBuf>) {
        self.working_dir = dir;
    }

    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    pub fn set_concurrency_override(&mut self, cap: Option<usize>) {
        self.concurrency_override = cap;
    }

    pub fn concurrency_override(&self) -> Option<usize> {
        self.concurrency_override
    }

    /// Flatten into template bindings.
    ///
    /// Later categories shadow earlier ones: input, then user variables, then
    /// stage outputs. Per-run bindings are layered on top by the caller via
    /// [`ExecutionContext::bindings_with`].
    pub fn bindings(&self) -> Bindings {
        let mut b = Bindings::new();
        b.insert("input".into(), Value::String(self.input_content.clone()));
        b.insert("title".into(), Value::String(self.input_title.clone()));
        if let Some(id) = &self.input_id {
            b.insert("input_id".into(), Value::String(id.to_string()));
        }
        if !self.tasks.is_empty() {
            b.insert("tasks".into(), json!(self.tasks));
        }
        for (name, value) in &self.variables {
            b.insert(name.clone(), value.clone());
        }
        for (name, output) in &self.stage_outputs {
            b.insert(name.clone(), output.to_value());
        }
        b
    }

    /// Bindings with `extra` layered on top.
    pub fn bindings_with<I>(&self, extra: I) -> Bindings
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut b = self.bindings();
        b.extend(extra);
        b
    }
}
