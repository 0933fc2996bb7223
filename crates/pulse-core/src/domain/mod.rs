//! Domain models for Pulse.
//!
//! - `BuildPlan`: authored waves, streams and drops
//! - `validation`: every-violation plan checks
//! - `PulseError`: domain error taxonomy

pub mod error;
pub mod plan;
pub mod validation;

pub use error::{PulseError, Result};
pub use plan::{BuildPlan, DropId, DropSpec, RecoveryConfig, SpawnMode, Wave};
pub use validation::{ensure_valid, validate, ValidationReport, Violation};
