//! SurrealDB schema initialization
//!
//! Tables are schemaless; this module only declares them with
//! append-friendly permissions and the lookup indexes the stores rely on.

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StateError;
use crate::Result;

/// Initialize all agentflow tables. Safe to call multiple times.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing agentflow SurrealDB schema");

    define(db, "workflow_runs", &["workflow_name", "status"]).await?;
    define(db, "stage_runs", &["run_id"]).await?;
    define(db, "individual_runs", &["stage_run_id", "run_id"]).await?;
    define(db, "documents", &["digest"]).await?;

    info!("agentflow schema initialization complete");
    Ok(())
}

/// Records are never deleted in normal operation, so deletes are denied.
async fn define(db: &Surreal<Any>, table: &str, indexed: &[&str]) -> Result<()> {
    debug!(table, "Initializing table");

    let mut sql = format!(
        "DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS \
         PERMISSIONS FOR create FULL FOR read FULL FOR update FULL FOR delete NONE;"
    );
    for column in indexed {
        sql.push_str(&format!(
            " DEFINE INDEX IF NOT EXISTS idx_{table}_{column} ON TABLE {table} COLUMNS {column};"
        ));
    }

    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(format!("{table}: {e}")))?
        .check()
        .map_err(|e| StateError::SchemaSetup(format!("{table}: {e}")))?;
    Ok(())
}
