//! Storage trait definitions for Pulse
//!
//! These traits define the core storage abstractions:
//! - `EventLog`: append-only build event stream (the source of truth for a build)
//! - `DepositStore`: per-drop completion records, archived on retry, never overwritten
//! - `RecoveryLog`: append-only recovery decisions
//! - `DocumentStore`: named JSON documents per build (plan, derived view, summary)
//! - `TaskPool`: atomically claimable work items shared by worker drops
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Content digest (SHA-256 hex string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an orchestrated build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildId(pub String);

impl BuildId {
    pub fn new(id: impl Into<String>) -> Self {
        BuildId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BuildId {
    fn from(s: &str) -> Self {
        BuildId(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// A single persisted build event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonic sequence number within the build, starting at 1
    pub seq: u64,
    /// Event kind (e.g. "drop_spawned", "wave_advanced")
    pub kind: String,
    /// Event payload
    pub payload: serde_json::Value,
    /// Time the event was appended
    pub timestamp: DateTime<Utc>,
}

/// Append-only build event log.
///
/// Guarantees:
/// - `seq` is assigned by the log and increases by one per append.
/// - Events are never mutated or removed.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event and return its sequence number.
    async fn append(
        &self,
        build: &BuildId,
        kind: &str,
        payload: serde_json::Value,
    ) -> StorageResult<u64>;

    /// All events of a build ordered by `seq`. Empty for unknown builds.
    async fn events(&self, build: &BuildId) -> StorageResult<Vec<EventRecord>>;

    /// Every build that has at least one event, sorted.
    async fn list_builds(&self) -> StorageResult<Vec<BuildId>>;
}

// ---------------------------------------------------------------------------
// DepositStore
// ---------------------------------------------------------------------------

/// Worker-reported outcome carried by a deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Complete,
    Blocked,
    Failed,
}

/// Hypothesis-racing verdict attached to a deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisVerdict {
    Confirmed,
    Rejected,
    Inconclusive,
}

/// A worker's structured completion report for one attempt of a drop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositRecord {
    pub drop_id: String,
    pub status: DepositStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<HypothesisVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<String>,
    /// Attempt this deposit answers. Absent means "the current attempt".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl DepositRecord {
    pub fn new(drop_id: impl Into<String>, status: DepositStatus, summary: impl Into<String>) -> Self {
        Self {
            drop_id: drop_id.into(),
            status,
            timestamp: Utc::now(),
            summary: summary.into(),
            artifacts: Vec::new(),
            verdict: None,
            broadcast: None,
            attempt: None,
        }
    }
}

/// Durable per-drop deposits.
///
/// Semantics:
/// - At most one *current* deposit per drop. `write` fails with
///   `StorageError::DepositExists` while one is present.
/// - `archive` moves the current deposit into the drop's history, which is
///   append-only. Deposits are never deleted.
#[async_trait]
pub trait DepositStore: Send + Sync {
    async fn write(&self, build: &BuildId, deposit: &DepositRecord) -> StorageResult<()>;

    async fn current(&self, build: &BuildId, drop_id: &str)
        -> StorageResult<Option<DepositRecord>>;

    /// Archive the current deposit and return it.
    async fn archive(&self, build: &BuildId, drop_id: &str) -> StorageResult<DepositRecord>;

    /// Archived deposits oldest first, followed by the current one if present.
    async fn history(&self, build: &BuildId, drop_id: &str) -> StorageResult<Vec<DepositRecord>>;

    /// Move an unparsable current deposit out of the way without reading
    /// it. Quarantined deposits never appear in `history`. Returns `false`
    /// when there was nothing to move.
    async fn quarantine(&self, build: &BuildId, drop_id: &str) -> StorageResult<bool>;
}

// ---------------------------------------------------------------------------
// RecoveryLog
// ---------------------------------------------------------------------------

/// Recovery rule that produced a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryRule {
    R1,
    R2,
    R3,
    R4,
    R5,
    /// Operator action (`retry`, `acknowledge`).
    #[serde(rename = "manual")]
    Manual,
}

impl std::fmt::Display for RecoveryRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecoveryRule::R1 => "R1",
            RecoveryRule::R2 => "R2",
            RecoveryRule::R3 => "R3",
            RecoveryRule::R4 => "R4",
            RecoveryRule::R5 => "R5",
            RecoveryRule::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Action taken by a recovery decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionKind {
    AutoRetry,
    Escalate,
    BlockBuild,
    EscalateStale,
    ManualRetry,
    Acknowledge,
}

impl std::fmt::Display for RecoveryActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecoveryActionKind::AutoRetry => "auto_retry",
            RecoveryActionKind::Escalate => "escalate",
            RecoveryActionKind::BlockBuild => "block_build",
            RecoveryActionKind::EscalateStale => "escalate_stale",
            RecoveryActionKind::ManualRetry => "manual_retry",
            RecoveryActionKind::Acknowledge => "acknowledge",
        };
        f.write_str(s)
    }
}

/// Failure taxonomy recorded with every recovery decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    DeadTimeout,
    SpawnError,
    Transient,
    ContentFailure,
    WaveDeath,
    StaleBuild,
}

impl std::fmt::Display for FailureType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureType::DeadTimeout => "dead_timeout",
            FailureType::SpawnError => "spawn_error",
            FailureType::Transient => "transient",
            FailureType::ContentFailure => "content_failure",
            FailureType::WaveDeath => "wave_death",
            FailureType::StaleBuild => "stale_build",
        };
        f.write_str(s)
    }
}

/// One append-only recovery decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryLogEntry {
    pub timestamp: DateTime<Utc>,
    /// `None` for build-level rules (R4, R5).
    pub drop_id: Option<String>,
    pub rule: RecoveryRule,
    pub action: RecoveryActionKind,
    pub failure_type: FailureType,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_number: Option<u32>,
}

#[async_trait]
pub trait RecoveryLog: Send + Sync {
    async fn append(&self, build: &BuildId, entry: &RecoveryLogEntry) -> StorageResult<()>;

    /// Entries in append order.
    async fn entries(&self, build: &BuildId) -> StorageResult<Vec<RecoveryLogEntry>>;
}

// ---------------------------------------------------------------------------
// DocumentStore
// ---------------------------------------------------------------------------

/// Named JSON documents scoped to a build.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Write (replace) a document atomically.
    async fn put(&self, build: &BuildId, name: &str, doc: &serde_json::Value)
        -> StorageResult<()>;

    async fn get(&self, build: &BuildId, name: &str) -> StorageResult<Option<serde_json::Value>>;
}

// ---------------------------------------------------------------------------
// TaskPool
// ---------------------------------------------------------------------------

/// Status of a pool task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "claimed" => Some(TaskStatus::Claimed),
            "complete" => Some(TaskStatus::Complete),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// Task definition supplied when filling a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub task_id: String,
    pub task_type: String,
    pub target: String,
}

impl NewTask {
    pub fn new(
        task_id: impl Into<String>,
        task_type: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_type: task_type.into(),
            target: target.into(),
        }
    }
}

/// A claimable work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTask {
    pub task_id: String,
    pub task_type: String,
    pub target: String,
    pub status: TaskStatus,
    pub claimant: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Dynamically claimable work queue.
///
/// Guarantees:
/// - `claim` is a single compare-and-swap (pending → claimed). Two concurrent
///   callers never receive the same task.
/// - Tasks are handed out in insertion order.
/// - A claimed task returns to pending only through `release` (or
///   `release_worker`). Releasing after a worker failure is the caller's
///   responsibility; nothing expires claims automatically.
#[async_trait]
pub trait TaskPool: Send + Sync {
    async fn add(&self, pool: &str, task: NewTask) -> StorageResult<PoolTask>;

    /// Claim the oldest pending task, or `None` when none is pending.
    async fn claim(&self, pool: &str, worker: &str) -> StorageResult<Option<PoolTask>>;

    /// claimed → complete; only the claimant may complete.
    async fn complete(&self, pool: &str, task_id: &str, worker: &str) -> StorageResult<PoolTask>;

    /// claimed → failed (the task itself is bad and must not be retried).
    async fn fail(&self, pool: &str, task_id: &str, worker: &str) -> StorageResult<PoolTask>;

    /// claimed → pending; only the claimant may release.
    async fn release(&self, pool: &str, task_id: &str, worker: &str) -> StorageResult<PoolTask>;

    /// Release every task currently claimed by `worker`.
    async fn release_worker(&self, pool: &str, worker: &str) -> StorageResult<Vec<PoolTask>>;

    /// All tasks in insertion order.
    async fn list(&self, pool: &str) -> StorageResult<Vec<PoolTask>>;
}

/// Check a claimed-task transition, shared by every pool backend.
pub fn check_claimant(task: &PoolTask, worker: &str, operation: &str) -> StorageResult<()> {
    if task.status != TaskStatus::Claimed || task.claimant.as_deref() != Some(worker) {
        return Err(StorageError::InvalidTaskState {
            task_id: task.task_id.clone(),
            status: task.status.as_str().to_string(),
            claimant: task.claimant.clone(),
            operation: format!("{operation} by {worker}"),
        });
    }
    Ok(())
}
