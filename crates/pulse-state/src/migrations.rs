//! SurrealDB schema for the shared task pool.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Pulse tables. Idempotent.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Pulse SurrealDB schema");
    init_pool_tasks_table(db).await?;
    info!("Pulse schema initialization complete");
    Ok(())
}

/// Initialize `pool_tasks`.
///
/// Schema:
/// ```text
/// TABLE pool_tasks {
///   pool:        STRING (indexed)
///   task_id:     STRING (unique per pool)
///   task_type:   STRING
///   target:      STRING
///   status:      STRING (pending | claimed | complete | failed)
///   claimant:    STRING?
///   seq:         INT (insertion order within pool)
///   updated_at:  DATETIME
/// }
/// ```
///
/// Claims are conditional updates on `status = 'pending'`; tasks are
/// never deleted.
async fn init_pool_tasks_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing pool_tasks table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS pool_tasks SCHEMALESS
            PERMISSIONS
                FOR select, create, update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_pool_task_id ON TABLE pool_tasks COLUMNS pool, task_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_pool_status_seq ON TABLE pool_tasks COLUMNS pool, status, seq;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ pool_tasks table initialized");
    Ok(())
}
