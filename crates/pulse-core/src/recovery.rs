//! Recovery engine.
//!
//! Rules, first match wins:
//!
//! | Rule | Condition                                          | Action           |
//! |------|----------------------------------------------------|------------------|
//! | R1   | dead, retries remaining                            | `auto_retry`     |
//! | R2   | spawn error or transient failure, retries remaining| `auto_retry`     |
//! | R3   | content failure, or retries exhausted              | `escalate`       |
//! | R4   | active wave can make no progress                   | `block_build`    |
//! | R5   | running too long with no progress                  | `escalate_stale` |
//!
//! R1-R3 are per drop ([`classify_and_recover`]); R4 and R5 are build-level
//! ([`evaluate_wave_death`], [`evaluate_stale`]).

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use pulse_state::{FailureType, RecoveryActionKind, RecoveryLogEntry, RecoveryRule};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{BuildPlan, RecoveryConfig};
use crate::projection::{BuildStatus, BuildView, DropView};

fn transient_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)(rate[ _-]?limit|too many requests|timed? ?out|timeout|deadline exceeded|connection (reset|refused|closed)|econnreset|broken pipe|temporar(y|ily)|unavailable|overloaded|try again|\b5\d\d\b)",
            )
            .ok()
        })
        .as_ref()
}

/// Classify free-text failure reasoning as transient or content-level.
pub fn classify_failure(reason: &str) -> FailureType {
    if transient_pattern().is_some_and(|re| re.is_match(reason)) {
        FailureType::Transient
    } else {
        FailureType::ContentFailure
    }
}

/// What went wrong with a drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    pub failure_type: FailureType,
    pub reason: String,
}

impl FailureContext {
    pub fn new(failure_type: FailureType, reason: impl Into<String>) -> Self {
        Self {
            failure_type,
            reason: reason.into(),
        }
    }
}

/// Outcome of applying a recovery rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryDecision {
    pub rule: RecoveryRule,
    pub action: RecoveryActionKind,
    pub failure_type: FailureType,
    pub reason: String,
    /// Retry number this decision consumes (auto retries only).
    pub retry_number: Option<u32>,
}

impl RecoveryDecision {
    pub fn is_retry(&self) -> bool {
        self.action == RecoveryActionKind::AutoRetry
    }

    /// R3, R4 and R5 always reach an external channel.
    pub fn escalates(&self) -> bool {
        matches!(
            self.action,
            RecoveryActionKind::Escalate
                | RecoveryActionKind::BlockBuild
                | RecoveryActionKind::EscalateStale
        )
    }

    pub fn log_entry(&self, drop_id: Option<&str>, at: DateTime<Utc>) -> RecoveryLogEntry {
        RecoveryLogEntry {
            timestamp: at,
            drop_id: drop_id.map(str::to_string),
            rule: self.rule,
            action: self.action,
            failure_type: self.failure_type,
            reason: self.reason.clone(),
            retry_number: self.retry_number,
        }
    }
}

/// Apply R1-R3 to a failed or dead drop.
pub fn classify_and_recover(
    drop: &DropView,
    ctx: &FailureContext,
    config: &RecoveryConfig,
) -> RecoveryDecision {
    let max = config.max_retries();
    let remaining = drop.retry_count < max;
    let next = Some(drop.retry_count + 1);

    match ctx.failure_type {
        FailureType::DeadTimeout if remaining => RecoveryDecision {
            rule: RecoveryRule::R1,
            action: RecoveryActionKind::AutoRetry,
            failure_type: FailureType::DeadTimeout,
            reason: ctx.reason.clone(),
            retry_number: next,
        },
        FailureType::SpawnError | FailureType::Transient if remaining => RecoveryDecision {
            rule: RecoveryRule::R2,
            action: RecoveryActionKind::AutoRetry,
            failure_type: ctx.failure_type,
            reason: ctx.reason.clone(),
            retry_number: next,
        },
        failure_type => {
            let reason = if failure_type == FailureType::ContentFailure {
                ctx.reason.clone()
            } else {
                format!("{} (auto retries exhausted: {}/{})", ctx.reason, drop.retry_count, max)
            };
            RecoveryDecision {
                rule: RecoveryRule::R3,
                action: RecoveryActionKind::Escalate,
                failure_type,
                reason,
                retry_number: None,
            }
        }
    }
}

/// Whether finishing `drop_id` can move its wave toward advancement:
/// it is blocking, or another drop waits on it.
fn gates_progress(plan: &BuildPlan, drop_id: &str) -> bool {
    plan.drop_spec(drop_id).is_some_and(|s| s.blocking)
        || plan
            .drops
            .values()
            .any(|s| s.depends_on.iter().any(|d| d == drop_id))
        || plan
            .drops
            .keys()
            .any(|other| plan.stream_predecessor(other) == Some(drop_id))
}

/// R4: the active wave is stuck.
///
/// Fires when the wave is not advance-eligible and no drop that gates
/// progress, in it or any earlier wave, is in flight or ready.
pub fn evaluate_wave_death(plan: &BuildPlan, view: &BuildView) -> Option<RecoveryDecision> {
    if view.status != BuildStatus::Running {
        return None;
    }
    let wave = plan.wave(view.active_wave)?;
    if view.wave_settled(plan, wave.position) {
        return None;
    }

    let reachable = plan.waves.iter().take(wave.position + 1);
    for w in reachable {
        for drop_id in w.drops.iter().filter(|d| gates_progress(plan, d)) {
            let Some(drop) = view.drop_view(drop_id) else {
                continue;
            };
            if drop.status.in_flight() || view.is_ready(plan, drop_id) {
                return None;
            }
        }
    }

    let mut stuck: Vec<String> = wave
        .drops
        .iter()
        .filter(|d| plan.drop_spec(d).is_some_and(|s| s.blocking))
        .filter(|d| !view.is_settled(plan, d))
        .filter_map(|d| view.drop_view(d))
        .map(|d| format!("{} ({})", d.drop_id, d.status))
        .collect();
    stuck.dedup();

    Some(RecoveryDecision {
        rule: RecoveryRule::R4,
        action: RecoveryActionKind::BlockBuild,
        failure_type: FailureType::WaveDeath,
        reason: format!("wave {} cannot advance: {}", wave.id, stuck.join(", ")),
        retry_number: None,
    })
}

/// R5: the build has run past `stale_threshold_hours` and nothing has
/// changed for `stale_no_progress_minutes`. Raised once per quiet period.
pub fn evaluate_stale(
    plan: &BuildPlan,
    view: &BuildView,
    now: DateTime<Utc>,
) -> Option<RecoveryDecision> {
    if view.status != BuildStatus::Running {
        return None;
    }
    let started = view.started_at?;
    let last_progress = view.last_progress_at.unwrap_or(started);
    let cfg = &plan.recovery;

    if now - started < cfg.stale_threshold() || now - last_progress < cfg.stale_no_progress() {
        return None;
    }
    if view.stale_escalated_at.is_some_and(|at| at >= last_progress) {
        return None;
    }

    let quiet = (now - last_progress).num_minutes();
    let active = (now - started).num_minutes();
    Some(RecoveryDecision {
        rule: RecoveryRule::R5,
        action: RecoveryActionKind::EscalateStale,
        failure_type: FailureType::StaleBuild,
        reason: format!("active for {active} min with no progress for {quiet} min"),
        retry_number: None,
    })
}
