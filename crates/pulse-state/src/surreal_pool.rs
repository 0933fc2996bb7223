//! SurrealDB-backed TaskPool implementation
//!
//! Every mutation is a conditional `UPDATE ... WHERE status = ...` so the
//! database, not the caller, decides who wins a race.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::sql::{Datetime as SurrealDatetime, Thing};
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::storage_traits::{
    check_claimant, NewTask, PoolTask, StorageResult, TaskPool, TaskStatus,
};

const NAMESPACE: &str = "pulse";
const DATABASE: &str = "main";

mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde::Serialize::serialize(&SurrealDatetime::from(*date), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(DateTime::from(SurrealDatetime::deserialize(deserializer)?))
    }
}

/// Row shape of `pool_tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbTask {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    pool: String,
    task_id: String,
    task_type: String,
    target: String,
    status: String,
    claimant: Option<String>,
    seq: i64,
    #[serde(with = "surreal_datetime")]
    updated_at: DateTime<Utc>,
}

impl DbTask {
    fn into_task(self) -> StorageResult<PoolTask> {
        let status = TaskStatus::parse(&self.status)
            .ok_or_else(|| StorageError::Backend(format!("unknown task status: {}", self.status)))?;
        Ok(PoolTask {
            task_id: self.task_id,
            task_type: self.task_type,
            target: self.target,
            status,
            claimant: self.claimant,
            updated_at: self.updated_at,
        })
    }
}

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Rescans of the pending set before a contended claim gives up.
const CLAIM_ATTEMPTS: usize = 8;

/// Concurrent writers to the same row abort with a commit conflict. For a
/// claim that only means another worker got there first.
fn is_conflict(e: &surrealdb::Error) -> bool {
    let msg = e.to_string();
    msg.contains("read or write conflict")
        || msg.contains("Failed to commit transaction")
        || msg.contains("Transaction conflict")
}

enum ClaimAttempt {
    Won(DbTask),
    Lost,
    Conflict,
}

/// SurrealDB-backed implementation of [`TaskPool`].
pub struct SurrealTaskPool {
    db: Surreal<Any>,
}

impl SurrealTaskPool {
    /// In-memory instance (`mem://`) for tests.
    pub async fn in_memory() -> crate::Result<Self> {
        let pool = Self::connect("mem://").await?;
        info!("SurrealTaskPool connected (in-memory)");
        Ok(pool)
    }

    /// Connect to any SurrealDB endpoint and initialize the schema.
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::from_connect(url, e))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        Ok(Self { db })
    }

    /// `SURREALDB_URL` when set, otherwise local persistence under
    /// `<state_dir>/pool`.
    pub async fn from_env(state_dir: &Path) -> crate::Result<Self> {
        if let Ok(url) = std::env::var("SURREALDB_URL") {
            let pool = Self::connect(&url).await?;
            info!("SurrealTaskPool connected ({})", url);
            return Ok(pool);
        }

        let path = state_dir.join("pool");
        std::fs::create_dir_all(&path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path.display(),
                e
            ))
        })?;
        let url = format!("surrealkv://{}", path.display());
        info!("No SURREALDB_URL found, using local persistence: {}", url);
        Self::connect(&url).await
    }

    async fn fetch(&self, pool: &str, task_id: &str) -> StorageResult<DbTask> {
        let mut res = self
            .db
            .query("SELECT * FROM pool_tasks WHERE pool = $pool AND task_id = $tid")
            .bind(("pool", pool.to_string()))
            .bind(("tid", task_id.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbTask> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::TaskNotFound {
                pool: pool.to_string(),
                task_id: task_id.to_string(),
            })
    }

    /// Move a task claimed by `worker` to `to`.
    async fn transition(
        &self,
        pool: &str,
        task_id: &str,
        worker: &str,
        operation: &str,
        to: TaskStatus,
    ) -> StorageResult<PoolTask> {
        let current = self.fetch(pool, task_id).await?.into_task()?;
        check_claimant(&current, worker, operation)?;

        let sql = if to == TaskStatus::Pending {
            "UPDATE pool_tasks SET status = $to, claimant = NONE, updated_at = $at \
             WHERE pool = $pool AND task_id = $tid AND status = 'claimed' AND claimant = $worker \
             RETURN AFTER"
        } else {
            "UPDATE pool_tasks SET status = $to, updated_at = $at \
             WHERE pool = $pool AND task_id = $tid AND status = 'claimed' AND claimant = $worker \
             RETURN AFTER"
        };
        let mut res = self
            .db
            .query(sql)
            .bind(("to", to.as_str().to_string()))
            .bind(("at", SurrealDatetime::from(Utc::now())))
            .bind(("pool", pool.to_string()))
            .bind(("tid", task_id.to_string()))
            .bind(("worker", worker.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbTask> = res.take(0).map_err(backend)?;
        match rows.into_iter().next() {
            Some(row) => row.into_task(),
            None => {
                // Lost a race between the read and the conditional update.
                let now = self.fetch(pool, task_id).await?.into_task()?;
                check_claimant(&now, worker, operation)?;
                Err(StorageError::Backend(format!(
                    "task {task_id} changed during {operation}"
                )))
            }
        }
    }

    async fn try_claim(
        &self,
        pool: &str,
        task_id: &str,
        worker: &str,
    ) -> StorageResult<ClaimAttempt> {
        let sent = self
            .db
            .query(
                "UPDATE pool_tasks SET status = 'claimed', claimant = $worker, updated_at = $at \
                 WHERE pool = $pool AND task_id = $tid AND status = 'pending' \
                 RETURN AFTER",
            )
            .bind(("worker", worker.to_string()))
            .bind(("at", SurrealDatetime::from(Utc::now())))
            .bind(("pool", pool.to_string()))
            .bind(("tid", task_id.to_string()))
            .await;
        let mut res = match sent {
            Ok(res) => res,
            Err(e) if is_conflict(&e) => return Ok(ClaimAttempt::Conflict),
            Err(e) => return Err(backend(e)),
        };
        let won: Vec<DbTask> = match res.take(0) {
            Ok(rows) => rows,
            Err(e) if is_conflict(&e) => return Ok(ClaimAttempt::Conflict),
            Err(e) => return Err(backend(e)),
        };
        Ok(won.into_iter().next().map_or(ClaimAttempt::Lost, ClaimAttempt::Won))
    }
}

#[async_trait]
impl TaskPool for SurrealTaskPool {
    async fn add(&self, pool: &str, task: NewTask) -> StorageResult<PoolTask> {
        if self.fetch(pool, &task.task_id).await.is_ok() {
            return Err(StorageError::TaskExists {
                pool: pool.to_string(),
                task_id: task.task_id,
            });
        }
        let seq = self.list(pool).await?.len() as i64 + 1;
        let row = DbTask {
            id: None,
            pool: pool.to_string(),
            task_id: task.task_id,
            task_type: task.task_type,
            target: task.target,
            status: TaskStatus::Pending.as_str().to_string(),
            claimant: None,
            seq,
            updated_at: Utc::now(),
        };
        debug!(pool, task_id = %row.task_id, "adding pool task");
        let created: Option<DbTask> = self
            .db
            .create("pool_tasks")
            .content(row)
            .await
            .map_err(backend)?;
        created
            .ok_or_else(|| StorageError::Backend("create returned no row".to_string()))?
            .into_task()
    }

    async fn claim(&self, pool: &str, worker: &str) -> StorageResult<Option<PoolTask>> {
        for _ in 0..CLAIM_ATTEMPTS {
            let mut res = self
                .db
                .query("SELECT * FROM pool_tasks WHERE pool = $pool AND status = 'pending' ORDER BY seq ASC")
                .bind(("pool", pool.to_string()))
                .await
                .map_err(backend)?;
            let candidates: Vec<DbTask> = res.take(0).map_err(backend)?;

            let mut contended = false;
            for candidate in candidates {
                match self.try_claim(pool, &candidate.task_id, worker).await? {
                    ClaimAttempt::Won(row) => {
                        debug!(pool, worker, task_id = %row.task_id, "task claimed");
                        return row.into_task().map(Some);
                    }
                    ClaimAttempt::Lost => {}
                    ClaimAttempt::Conflict => contended = true,
                }
            }
            if !contended {
                return Ok(None);
            }
            tokio::task::yield_now().await;
        }
        debug!(pool, worker, "claim gave up under contention");
        Ok(None)
    }

    async fn complete(&self, pool: &str, task_id: &str, worker: &str) -> StorageResult<PoolTask> {
        self.transition(pool, task_id, worker, "complete", TaskStatus::Complete)
            .await
    }

    async fn fail(&self, pool: &str, task_id: &str, worker: &str) -> StorageResult<PoolTask> {
        self.transition(pool, task_id, worker, "fail", TaskStatus::Failed)
            .await
    }

    async fn release(&self, pool: &str, task_id: &str, worker: &str) -> StorageResult<PoolTask> {
        self.transition(pool, task_id, worker, "release", TaskStatus::Pending)
            .await
    }

    async fn release_worker(&self, pool: &str, worker: &str) -> StorageResult<Vec<PoolTask>> {
        let mut res = self
            .db
            .query(
                "UPDATE pool_tasks SET status = 'pending', claimant = NONE, updated_at = $at \
                 WHERE pool = $pool AND status = 'claimed' AND claimant = $worker \
                 RETURN AFTER",
            )
            .bind(("at", SurrealDatetime::from(Utc::now())))
            .bind(("pool", pool.to_string()))
            .bind(("worker", worker.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbTask> = res.take(0).map_err(backend)?;
        let mut tasks: Vec<(i64, PoolTask)> = Vec::new();
        for row in rows {
            let seq = row.seq;
            tasks.push((seq, row.into_task()?));
        }
        tasks.sort_by_key(|(seq, _)| *seq);
        Ok(tasks.into_iter().map(|(_, t)| t).collect())
    }

    async fn list(&self, pool: &str) -> StorageResult<Vec<PoolTask>> {
        let mut res = self
            .db
            .query("SELECT * FROM pool_tasks WHERE pool = $pool ORDER BY seq ASC")
            .bind(("pool", pool.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<DbTask> = res.take(0).map_err(backend)?;
        rows.into_iter().map(DbTask::into_task).collect()
    }
}
