//! Pulse-State: durable storage for Pulse builds
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: append-only history, write-once deposits, atomic claims.
//!
//! ## Key Components
//!
//! - `FsStore`: event log, deposits, recovery log and documents on local disk
//! - `SurrealTaskPool`: task pools with database-side compare-and-swap claims
//! - `fakes`: in-memory implementations of every storage trait

mod error;
pub mod fakes;
pub mod fs;
pub mod migrations;
pub mod storage_traits;
pub mod surreal_pool;

pub use error::{StateError, StorageError};
pub use fs::FsStore;
pub use storage_traits::{
    check_claimant, BuildId, ContentDigest, DepositRecord, DepositStatus, DepositStore,
    DocumentStore, EventLog, EventRecord, FailureType, HypothesisVerdict, NewTask, PoolTask,
    RecoveryActionKind, RecoveryLog, RecoveryLogEntry, RecoveryRule, StorageResult, TaskPool,
    TaskStatus,
};
pub use surreal_pool::SurrealTaskPool;

/// Result type for pulse-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;
