//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryEventLog`, `MemoryDepositStore`, `MemoryRecoveryLog`,
//! `MemoryDocumentStore` and `MemoryTaskPool` that satisfy the trait
//! contracts without any external dependencies.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

fn guard<T>(m: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| StorageError::Backend("in-memory store lock poisoned".to_string()))
}

// ---------------------------------------------------------------------------
// MemoryEventLog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryEventLog {
    builds: Mutex<BTreeMap<BuildId, Vec<EventRecord>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(
        &self,
        build: &BuildId,
        kind: &str,
        payload: serde_json::Value,
    ) -> StorageResult<u64> {
        let mut builds = guard(&self.builds)?;
        let events = builds.entry(build.clone()).or_default();
        let seq = events.len() as u64 + 1;
        events.push(EventRecord {
            seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        });
        Ok(seq)
    }

    async fn events(&self, build: &BuildId) -> StorageResult<Vec<EventRecord>> {
        let builds = guard(&self.builds)?;
        Ok(builds.get(build).cloned().unwrap_or_default())
    }

    async fn list_builds(&self) -> StorageResult<Vec<BuildId>> {
        let builds = guard(&self.builds)?;
        Ok(builds.keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryDepositStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct DropDeposits {
    current: Option<DepositRecord>,
    archived: Vec<DepositRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryDepositStore {
    deposits: Mutex<HashMap<(BuildId, String), DropDeposits>>,
}

impl MemoryDepositStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DepositStore for MemoryDepositStore {
    async fn write(&self, build: &BuildId, deposit: &DepositRecord) -> StorageResult<()> {
        let mut deposits = guard(&self.deposits)?;
        let slot = deposits
            .entry((build.clone(), deposit.drop_id.clone()))
            .or_default();
        if slot.current.is_some() {
            return Err(StorageError::DepositExists {
                build_id: build.0.clone(),
                drop_id: deposit.drop_id.clone(),
            });
        }
        slot.current = Some(deposit.clone());
        Ok(())
    }

    async fn current(
        &self,
        build: &BuildId,
        drop_id: &str,
    ) -> StorageResult<Option<DepositRecord>> {
        let deposits = guard(&self.deposits)?;
        Ok(deposits
            .get(&(build.clone(), drop_id.to_string()))
            .and_then(|d| d.current.clone()))
    }

    async fn archive(&self, build: &BuildId, drop_id: &str) -> StorageResult<DepositRecord> {
        let mut deposits = guard(&self.deposits)?;
        let slot = deposits
            .get_mut(&(build.clone(), drop_id.to_string()))
            .ok_or_else(|| StorageError::DepositNotFound {
                build_id: build.0.clone(),
                drop_id: drop_id.to_string(),
            })?;
        let current = slot.current.take().ok_or_else(|| StorageError::DepositNotFound {
            build_id: build.0.clone(),
            drop_id: drop_id.to_string(),
        })?;
        slot.archived.push(current.clone());
        Ok(current)
    }

    async fn history(&self, build: &BuildId, drop_id: &str) -> StorageResult<Vec<DepositRecord>> {
        let deposits = guard(&self.deposits)?;
        Ok(deposits
            .get(&(build.clone(), drop_id.to_string()))
            .map(|d| {
                let mut all = d.archived.clone();
                all.extend(d.current.clone());
                all
            })
            .unwrap_or_default())
    }

    async fn quarantine(&self, build: &BuildId, drop_id: &str) -> StorageResult<bool> {
        let mut deposits = guard(&self.deposits)?;
        Ok(deposits
            .get_mut(&(build.clone(), drop_id.to_string()))
            .and_then(|slot| slot.current.take())
            .is_some())
    }
}

// ---------------------------------------------------------------------------
// MemoryRecoveryLog
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryRecoveryLog {
    entries: Mutex<HashMap<BuildId, Vec<RecoveryLogEntry>>>,
}

impl MemoryRecoveryLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecoveryLog for MemoryRecoveryLog {
    async fn append(&self, build: &BuildId, entry: &RecoveryLogEntry) -> StorageResult<()> {
        let mut entries = guard(&self.entries)?;
        entries.entry(build.clone()).or_default().push(entry.clone());
        Ok(())
    }

    async fn entries(&self, build: &BuildId) -> StorageResult<Vec<RecoveryLogEntry>> {
        let entries = guard(&self.entries)?;
        Ok(entries.get(build).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// MemoryDocumentStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<HashMap<(BuildId, String), serde_json::Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(
        &self,
        build: &BuildId,
        name: &str,
        doc: &serde_json::Value,
    ) -> StorageResult<()> {
        let mut docs = guard(&self.docs)?;
        docs.insert((build.clone(), name.to_string()), doc.clone());
        Ok(())
    }

    async fn get(&self, build: &BuildId, name: &str) -> StorageResult<Option<serde_json::Value>> {
        let docs = guard(&self.docs)?;
        Ok(docs.get(&(build.clone(), name.to_string())).cloned())
    }
}

// ---------------------------------------------------------------------------
// MemoryTaskPool
// ---------------------------------------------------------------------------

/// In-memory task pool. The whole claim (find pending + flip to claimed)
/// runs under one mutex guard, so it is a single atomic step.
#[derive(Debug, Default)]
pub struct MemoryTaskPool {
    pools: Mutex<HashMap<String, Vec<PoolTask>>>,
}

impl MemoryTaskPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(
        &self,
        pool: &str,
        task_id: &str,
        worker: &str,
        operation: &str,
        to: TaskStatus,
    ) -> StorageResult<PoolTask> {
        let mut pools = guard(&self.pools)?;
        let task = pools
            .get_mut(pool)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.task_id == task_id))
            .ok_or_else(|| StorageError::TaskNotFound {
                pool: pool.to_string(),
                task_id: task_id.to_string(),
            })?;
        check_claimant(task, worker, operation)?;
        task.status = to;
        if to == TaskStatus::Pending {
            task.claimant = None;
        }
        task.updated_at = Utc::now();
        Ok(task.clone())
    }
}

#[async_trait]
impl TaskPool for MemoryTaskPool {
    async fn add(&self, pool: &str, task: NewTask) -> StorageResult<PoolTask> {
        let mut pools = guard(&self.pools)?;
        let tasks = pools.entry(pool.to_string()).or_default();
        if tasks.iter().any(|t| t.task_id == task.task_id) {
            return Err(StorageError::TaskExists {
                pool: pool.to_string(),
                task_id: task.task_id,
            });
        }
        let record = PoolTask {
            task_id: task.task_id,
            task_type: task.task_type,
            target: task.target,
            status: TaskStatus::Pending,
            claimant: None,
            updated_at: Utc::now(),
        };
        tasks.push(record.clone());
        Ok(record)
    }

    async fn claim(&self, pool: &str, worker: &str) -> StorageResult<Option<PoolTask>> {
        let mut pools = guard(&self.pools)?;
        let claimed = pools.get_mut(pool).and_then(|tasks| {
            tasks
                .iter_mut()
                .find(|t| t.status == TaskStatus::Pending)
                .map(|task| {
                    task.status = TaskStatus::Claimed;
                    task.claimant = Some(worker.to_string());
                    task.updated_at = Utc::now();
                    task.clone()
                })
        });
        Ok(claimed)
    }

    async fn complete(&self, pool: &str, task_id: &str, worker: &str) -> StorageResult<PoolTask> {
        self.transition(pool, task_id, worker, "complete", TaskStatus::Complete)
    }

    async fn fail(&self, pool: &str, task_id: &str, worker: &str) -> StorageResult<PoolTask> {
        self.transition(pool, task_id, worker, "fail", TaskStatus::Failed)
    }

    async fn release(&self, pool: &str, task_id: &str, worker: &str) -> StorageResult<PoolTask> {
        self.transition(pool, task_id, worker, "release", TaskStatus::Pending)
    }

    async fn release_worker(&self, pool: &str, worker: &str) -> StorageResult<Vec<PoolTask>> {
        let mut pools = guard(&self.pools)?;
        let mut released = Vec::new();
        if let Some(tasks) = pools.get_mut(pool) {
            for task in tasks.iter_mut().filter(|t| {
                t.status == TaskStatus::Claimed && t.claimant.as_deref() == Some(worker)
            }) {
                task.status = TaskStatus::Pending;
                task.claimant = None;
                task.updated_at = Utc::now();
                released.push(task.clone());
            }
        }
        Ok(released)
    }

    async fn list(&self, pool: &str) -> StorageResult<Vec<PoolTask>> {
        let pools = guard(&self.pools)?;
        Ok(pools.get(pool).cloned().unwrap_or_default())
    }
}
