//! SurrealDB connection setup.
//!
//! Resolution order for [`StoreConfig::from_env`]:
//! 1. `AGENTFLOW_DB_URL` (any engine URL: `mem://`, `surrealkv://path`, `ws://host`)
//! 2. local persistence under `.agentflow/db`

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::info;

use crate::error::StateError;
use crate::migrations;
use crate::Result;

const DEFAULT_NAMESPACE: &str = "agentflow";
const DEFAULT_DATABASE: &str = "main";
const DEFAULT_LOCAL_PATH: &str = ".agentflow/db";

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            url: "mem://".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
        }
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - AGENTFLOW_DB_URL (optional, default: `surrealkv://.agentflow/db`)
    /// - AGENTFLOW_DB_NAMESPACE (optional, default: "agentflow")
    /// - AGENTFLOW_DB_DATABASE (optional, default: "main")
    pub fn from_env() -> Self {
        let url = std::env::var("AGENTFLOW_DB_URL")
            .unwrap_or_else(|_| format!("surrealkv://{DEFAULT_LOCAL_PATH}"));
        let namespace = std::env::var("AGENTFLOW_DB_NAMESPACE")
            .unwrap_or_else(|_| DEFAULT_NAMESPACE.to_string());
        let database = std::env::var("AGENTFLOW_DB_DATABASE")
            .unwrap_or_else(|_| DEFAULT_DATABASE.to_string());
        Self {
            url,
            namespace,
            database,
        }
    }

    fn local_path(&self) -> Option<&str> {
        self.url.strip_prefix("surrealkv://")
    }
}

/// Open a connection, select namespace/database and initialise the schema.
pub async fn connect(config: &StoreConfig) -> Result<Surreal<Any>> {
    if let Some(path) = config.local_path() {
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!(
                "cannot create database directory {}: {}",
                path, e
            ))
        })?;
    }

    let db = surrealdb::engine::any::connect(config.url.as_str())
        .await
        .map_err(|e| StateError::Connection(format!("{}: {}", config.url, e)))?;

    db.use_ns(config.namespace.as_str())
        .use_db(config.database.as_str())
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;

    migrations::init_schema(&db).await?;
    info!(url = %config.url, "agentflow store connected");
    Ok(db)
}
