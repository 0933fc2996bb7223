//! Human-readable build reports and the finalize summary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pulse_state::{BuildId, ContentDigest, RecoveryLogEntry, RecoveryRule};
use serde::{Deserialize, Serialize};

use crate::domain::{BuildPlan, DropId, SpawnMode};
use crate::projection::{BuildView, DropStatus};

/// Final per-drop outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropSummary {
    pub drop_id: DropId,
    pub name: String,
    pub wave_id: Option<String>,
    pub status: DropStatus,
    pub attempts: u32,
    pub retry_count: u32,
    pub manual_retries: u32,
    pub concerns: Vec<String>,
}

/// `summary.json`, written once by `finalize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeSummary {
    pub build_id: BuildId,
    pub finalized_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    /// SHA-256 of the serialized event log at finalize time.
    pub events_digest: String,
    pub event_count: u64,
    pub drops: Vec<DropSummary>,
    pub recovery_actions: usize,
    pub escalations: usize,
    pub hypothesis_winners: BTreeMap<String, DropId>,
}

impl FinalizeSummary {
    pub fn new(
        plan: &BuildPlan,
        view: &BuildView,
        entries: &[RecoveryLogEntry],
        digest: &ContentDigest,
        now: DateTime<Utc>,
    ) -> Self {
        let drops = view
            .drops
            .values()
            .map(|d| DropSummary {
                drop_id: d.drop_id.clone(),
                name: plan
                    .drop_spec(&d.drop_id)
                    .map(|s| s.name.clone())
                    .unwrap_or_default(),
                wave_id: plan
                    .wave_of(&d.drop_id)
                    .and_then(|p| plan.wave(p))
                    .map(|w| w.id.clone()),
                status: d.status,
                attempts: d.attempt,
                retry_count: d.retry_count,
                manual_retries: d.manual_retries,
                concerns: d.concerns.clone(),
            })
            .collect();

        Self {
            build_id: view.build_id.clone(),
            finalized_at: now,
            started_at: view.started_at,
            duration_secs: view.started_at.map(|s| (now - s).num_seconds()),
            events_digest: digest.as_str().to_string(),
            event_count: view.event_count,
            drops,
            recovery_actions: entries.len(),
            escalations: entries
                .iter()
                .filter(|e| matches!(e.rule, RecoveryRule::R3 | RecoveryRule::R4 | RecoveryRule::R5))
                .count(),
            hypothesis_winners: view.resolved_groups.clone(),
        }
    }
}

/// Render the status of a build as plain text.
pub fn render_status(plan: &BuildPlan, view: &BuildView) -> String {
    let mut out = String::new();
    out.push_str(&format!("Build {}: {}", view.build_id, view.status));
    if view.finalized {
        out.push_str(" (finalized)");
    }
    out.push('\n');
    if let Some(wave) = view.active_wave_id(plan) {
        out.push_str(&format!("Active wave: {wave}\n"));
    }
    if let Some(reason) = &view.blocked_reason {
        out.push_str(&format!("Blocked: {reason}\n"));
    }

    for wave in &plan.waves {
        let marker = if wave.position == view.active_wave { " *" } else { "" };
        out.push_str(&format!("\n{}{}\n", wave.id, marker));
        for drop_id in &wave.drops {
            let (Some(spec), Some(drop)) = (plan.drop_spec(drop_id), view.drop_view(drop_id)) else {
                continue;
            };
            let stream = match (&spec.stream, spec.order) {
                (Some(s), Some(o)) => format!("{s}#{o}"),
                _ => "-".to_string(),
            };
            let mut flags = Vec::new();
            if !spec.blocking {
                flags.push("non-blocking".to_string());
            }
            if spec.spawn_mode == SpawnMode::Manual {
                flags.push("manual".to_string());
            }
            if let Some(group) = &spec.hypothesis_group {
                flags.push(format!("group={group}"));
            }
            if drop.acknowledged {
                flags.push("acknowledged".to_string());
            }
            out.push_str(&format!(
                "  {:<12} {:<16} {:<8} retries={} manual={} {}\n",
                drop_id,
                drop.status.as_str(),
                stream,
                drop.retry_count,
                drop.manual_retries,
                flags.join(",")
            ));
        }
    }

    let awaiting = view.awaiting_decision();
    if !awaiting.is_empty() {
        out.push_str("\nAwaiting decision (retry or ack):\n");
        for drop in awaiting {
            let reason = drop
                .last_failure
                .as_ref()
                .map(|f| format!("{}: {}", f.failure_type, f.reason))
                .unwrap_or_default();
            out.push_str(&format!("  - {} ({}) {}\n", drop.drop_id, drop.status, reason));
        }
    }
    out
}

/// Render recovery log entries, oldest first.
pub fn render_recovery_log(entries: &[RecoveryLogEntry]) -> String {
    if entries.is_empty() {
        return "No recovery actions.\n".to_string();
    }
    let mut out = String::new();
    for e in entries {
        let retry = e
            .retry_number
            .map(|n| format!(" retry#{n}"))
            .unwrap_or_default();
        out.push_str(&format!(
            "{} {:<6} {:<14} {:<15} {:<16}{} {}\n",
            e.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            e.rule.to_string(),
            e.action.to_string(),
            e.failure_type.to_string(),
            e.drop_id.as_deref().unwrap_or("-"),
            retry,
            e.reason
        ));
    }
    out
}
