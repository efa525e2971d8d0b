//! Artifacts: agent outputs held in the external document store.

use agentflow_state::{Document, DocumentId};
use serde::{Deserialize, Serialize};

/// An agent's final answer, as loaded back from the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: DocumentId,
    pub title: String,
    pub content: String,
}

impl Artifact {
    pub fn new(id: DocumentId, title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            content: content.into(),
        }
    }
}

impl From<Document> for Artifact {
    fn from(doc: Document) -> Self {
        Self {
            id: doc.id,
            title: doc.title,
            content: doc.content,
        }
    }
}
