//! Pulse Core Library
//!
//! Build model, tick engine, recovery rules and the collaborator seams
//! (filter oracle, worker spawner, escalation channels).

pub mod config;
pub mod domain;
pub mod escalation;
pub mod metrics;
pub mod obs;
pub mod oracle;
pub mod projection;
pub mod recovery;
pub mod reporting;
pub mod scheduler;
pub mod spawner;
pub mod telemetry;

pub use config::{OracleKind, PulseConfig, DEFAULT_CONFIG_FILE};

pub use domain::{
    ensure_valid, validate, BuildPlan, DropId, DropSpec, PulseError, RecoveryConfig, Result,
    SpawnMode, ValidationReport, Violation, Wave,
};

pub use escalation::{
    CollectingChannel, EscalationChannel, EscalationMessage, LogChannel, MultiChannel, Severity,
    WebhookChannel,
};

pub use oracle::{
    judge_bounded, CriterionResult, DepositStatusOracle, FilterOracle, FilterVerdict, OracleError,
    Verdict, VerdictFileOracle,
};

pub use projection::{
    BuildEvent, BuildStatus, BuildView, CompletionGrade, DropStatus, DropView, FailureRecord,
};

pub use recovery::{
    classify_and_recover, classify_failure, evaluate_stale, evaluate_wave_death, FailureContext,
    RecoveryDecision,
};

pub use reporting::{render_recovery_log, render_status, DropSummary, FinalizeSummary};

pub use scheduler::{
    LauncherInfo, Scheduler, StatusChange, Stores, TickResult, DEFAULT_ORACLE_TIMEOUT,
};

pub use spawner::{CommandSpawner, SpawnError, SpawnReceipt, SpawnRequest, WorkerSpawner};

pub use pulse_state::{
    BuildId, DepositRecord, DepositStatus, FailureType, HypothesisVerdict, RecoveryLogEntry,
    RecoveryRule,
};

pub use metrics::METRICS;
pub use telemetry::init_tracing;

/// Pulse version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
