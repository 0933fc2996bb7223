//! Structured observability hooks for the build lifecycle.
//!
//! Ticks run inside a `pulse.build` span carrying the build id; the
//! `emit_*` functions log the key transitions at `info!`/`warn!`.

use pulse_state::{RecoveryLogEntry, RecoveryRule};
use tracing::{info, warn};

pub fn emit_tick_completed(build_id: &str, spawned: usize, changes: usize, status: &str) {
    info!(
        event = "tick.completed",
        build_id = %build_id,
        spawned = spawned,
        changes = changes,
        status = %status,
    );
}

pub fn emit_drop_spawned(build_id: &str, drop_id: &str, attempt: u32) {
    info!(event = "drop.spawned", build_id = %build_id, drop_id = %drop_id, attempt = attempt);
}

pub fn emit_drop_status_changed(build_id: &str, drop_id: &str, from: &str, to: &str) {
    info!(
        event = "drop.status_changed",
        build_id = %build_id,
        drop_id = %drop_id,
        from = %from,
        to = %to,
    );
}

/// WARN verdict concerns. Non-blocking, but worth a human glance.
pub fn emit_drop_concern(build_id: &str, drop_id: &str, concern: &str) {
    warn!(event = "drop.concern", build_id = %build_id, drop_id = %drop_id, concern = %concern);
}

pub fn emit_recovery_applied(build_id: &str, entry: &RecoveryLogEntry) {
    info!(
        event = "recovery.applied",
        build_id = %build_id,
        drop_id = ?entry.drop_id,
        rule = %entry.rule,
        action = %entry.action,
        failure_type = %entry.failure_type,
        retry_number = ?entry.retry_number,
    );
}

pub fn emit_wave_advanced(build_id: &str, from: &str, to: &str) {
    info!(event = "wave.advanced", build_id = %build_id, from = %from, to = %to);
}

pub fn emit_build_blocked(build_id: &str, reason: &str) {
    warn!(event = "build.blocked", build_id = %build_id, reason = %reason);
}

pub fn emit_escalation_raised(build_id: &str, rule: RecoveryRule, summary: &str) {
    warn!(event = "escalation.raised", build_id = %build_id, rule = %rule, summary = %summary);
}

/// A deposit could not be judged this tick; it is retried next tick.
pub fn emit_judging_deferred(build_id: &str, drop_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "oracle.deferred", build_id = %build_id, drop_id = %drop_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitters_do_not_panic() {
        emit_wave_advanced("test-build", "W1", "W2");
        emit_drop_concern("test-build", "d1", "missing changelog entry");
        emit_judging_deferred("test-build", "d1", &"oracle timed out");
    }
}
