//! Row types for agentflow SurrealDB tables
//!
//! Tables:
//! - documents: agent artifacts
//! - workflow_runs / stage_runs / individual_runs: stored as the
//!   `storage_traits` records themselves

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage_traits::{ContentDigest, Document, DocumentId, NewDocument};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Stored artifact row. `doc_id` avoids clashing with SurrealDB's own `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRow {
    pub doc_id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub digest: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl DocumentRow {
    pub fn new(doc: NewDocument) -> Self {
        Self {
            doc_id: uuid::Uuid::new_v4().simple().to_string(),
            digest: ContentDigest::from_bytes(doc.content.as_bytes())
                .as_str()
                .to_string(),
            title: doc.title,
            content: doc.content,
            tags: doc.tags,
            created_at: Utc::now(),
        }
    }

    pub fn into_document(self) -> crate::storage_traits::StorageResult<Document> {
        Ok(Document {
            id: DocumentId(self.doc_id),
            title: self.title,
            content: self.content,
            tags: self.tags,
            digest: ContentDigest::try_from(self.digest)?,
            created_at: self.created_at,
        })
    }
}
