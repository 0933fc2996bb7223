//! Domain-level error taxonomy for Pulse.

use pulse_state::StorageError;

use crate::domain::validation::Violation;

/// Pulse domain errors.
#[derive(Debug, thiserror::Error)]
pub enum PulseError {
    #[error("malformed plan: {} violation(s): {}", violations.len(), join(violations))]
    MalformedPlan { violations: Vec<Violation> },

    #[error("build not found: {0}")]
    BuildNotFound(String),

    #[error("build already exists: {0}")]
    BuildExists(String),

    #[error("drop {drop_id} not found in build {build_id}")]
    DropNotFound { build_id: String, drop_id: String },

    #[error("cannot {operation} {subject}: currently {status}")]
    InvalidTransition {
        subject: String,
        status: String,
        operation: String,
    },

    #[error("build {0} is finalized and read-only")]
    BuildArchived(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for Pulse domain operations.
pub type Result<T> = std::result::Result<T, PulseError>;
