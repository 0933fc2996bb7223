//! Error types for pulse-state

use thiserror::Error;

/// Errors that can occur in the state persistence layer
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),

    /// An embedded store is held open by another process.
    #[error("Database is locked: {0}")]
    Locked(String),
}

impl StateError {
    /// Sort a failed connect into [`StateError::Locked`] or
    /// [`StateError::Connection`].
    pub fn from_connect(url: &str, err: surrealdb::Error) -> Self {
        let msg = err.to_string();
        if msg.to_ascii_lowercase().contains("lock") {
            StateError::Locked(format!("{url}: {msg}"))
        } else {
            StateError::Connection(format!("Failed to connect to {url}: {msg}"))
        }
    }
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the storage traits.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A deposit already exists for the drop's current attempt.
    #[error("deposit already written for drop {drop_id} in build {build_id}")]
    DepositExists { build_id: String, drop_id: String },

    /// No current deposit to archive.
    #[error("no deposit for drop {drop_id} in build {build_id}")]
    DepositNotFound { build_id: String, drop_id: String },

    /// Unknown build.
    #[error("build not found: {build_id}")]
    BuildNotFound { build_id: String },

    /// Unknown task in a pool.
    #[error("task {task_id} not found in pool {pool}")]
    TaskNotFound { pool: String, task_id: String },

    /// Duplicate task id in a pool.
    #[error("task {task_id} already exists in pool {pool}")]
    TaskExists { pool: String, task_id: String },

    /// Task transition rejected (wrong status or wrong claimant).
    #[error("task {task_id} is {status} (claimant {claimant:?}); cannot {operation}")]
    InvalidTaskState {
        task_id: String,
        status: String,
        claimant: Option<String>,
        operation: String,
    },

    /// Identifier unsafe for use as a path component.
    #[error("invalid identifier: {0:?}")]
    InvalidId(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend (database) failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}
