//! Event-sourced build view.
//!
//! The event log is the only source of truth for a build. [`BuildView`] is
//! rebuilt by folding [`BuildEvent`]s over the plan; `state.json` is a
//! cache written after each mutation and never read back.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pulse_state::{BuildId, EventRecord, FailureType, HypothesisVerdict};
use serde::{Deserialize, Serialize};

use crate::domain::{BuildPlan, DropId, Result};

/// Runtime status of a drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropStatus {
    Pending,
    Spawned,
    AwaitingManual,
    Complete,
    Failed,
    Dead,
    Superseded,
}

impl DropStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropStatus::Pending => "pending",
            DropStatus::Spawned => "spawned",
            DropStatus::AwaitingManual => "awaiting_manual",
            DropStatus::Complete => "complete",
            DropStatus::Failed => "failed",
            DropStatus::Dead => "dead",
            DropStatus::Superseded => "superseded",
        }
    }

    /// A worker is (or may be) running for this drop.
    pub fn in_flight(&self) -> bool {
        matches!(self, DropStatus::Spawned | DropStatus::AwaitingManual)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, DropStatus::Failed | DropStatus::Dead)
    }
}

impl std::fmt::Display for DropStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall build status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Blocked,
    Complete,
    Stopped,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Blocked => "blocked",
            BuildStatus::Complete => "complete",
            BuildStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filter outcome that completed a drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionGrade {
    Pass,
    Warn,
}

/// Every state transition of a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildEvent {
    BuildStarted {
        at: DateTime<Utc>,
        wave_id: String,
    },
    DropSpawned {
        at: DateTime<Utc>,
        drop_id: DropId,
        attempt: u32,
        receipt: String,
    },
    DropAwaitingManual {
        at: DateTime<Utc>,
        drop_id: DropId,
        attempt: u32,
        launcher: String,
    },
    DropCompleted {
        at: DateTime<Utc>,
        drop_id: DropId,
        grade: CompletionGrade,
        #[serde(default)]
        concerns: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hypothesis: Option<HypothesisVerdict>,
    },
    DropFailed {
        at: DateTime<Utc>,
        drop_id: DropId,
        failure_type: FailureType,
        reason: String,
    },
    DropDead {
        at: DateTime<Utc>,
        drop_id: DropId,
        reason: String,
    },
    DropRetried {
        at: DateTime<Utc>,
        drop_id: DropId,
        manual: bool,
        reason: String,
    },
    DropSuperseded {
        at: DateTime<Utc>,
        drop_id: DropId,
        group: String,
        winner: DropId,
    },
    DropAcknowledged {
        at: DateTime<Utc>,
        drop_id: DropId,
    },
    HypothesisConfirmed {
        at: DateTime<Utc>,
        group: String,
        winner: DropId,
    },
    WaveAdvanced {
        at: DateTime<Utc>,
        from: String,
        to: String,
        position: usize,
    },
    BuildBlocked {
        at: DateTime<Utc>,
        wave_id: String,
        reason: String,
    },
    BuildCompleted {
        at: DateTime<Utc>,
    },
    BuildStopped {
        at: DateTime<Utc>,
    },
    BuildResumed {
        at: DateTime<Utc>,
    },
    StaleEscalated {
        at: DateTime<Utc>,
    },
    BuildFinalized {
        at: DateTime<Utc>,
        events_digest: String,
    },
}

impl BuildEvent {
    /// Event kind as stored in the log.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildEvent::BuildStarted { .. } => "build_started",
            BuildEvent::DropSpawned { .. } => "drop_spawned",
            BuildEvent::DropAwaitingManual { .. } => "drop_awaiting_manual",
            BuildEvent::DropCompleted { .. } => "drop_completed",
            BuildEvent::DropFailed { .. } => "drop_failed",
            BuildEvent::DropDead { .. } => "drop_dead",
            BuildEvent::DropRetried { .. } => "drop_retried",
            BuildEvent::DropSuperseded { .. } => "drop_superseded",
            BuildEvent::DropAcknowledged { .. } => "drop_acknowledged",
            BuildEvent::HypothesisConfirmed { .. } => "hypothesis_confirmed",
            BuildEvent::WaveAdvanced { .. } => "wave_advanced",
            BuildEvent::BuildBlocked { .. } => "build_blocked",
            BuildEvent::BuildCompleted { .. } => "build_completed",
            BuildEvent::BuildStopped { .. } => "build_stopped",
            BuildEvent::BuildResumed { .. } => "build_resumed",
            BuildEvent::StaleEscalated { .. } => "stale_escalated",
            BuildEvent::BuildFinalized { .. } => "build_finalized",
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            BuildEvent::BuildStarted { at, .. }
            | BuildEvent::DropSpawned { at, .. }
            | BuildEvent::DropAwaitingManual { at, .. }
            | BuildEvent::DropCompleted { at, .. }
            | BuildEvent::DropFailed { at, .. }
            | BuildEvent::DropDead { at, .. }
            | BuildEvent::DropRetried { at, .. }
            | BuildEvent::DropSuperseded { at, .. }
            | BuildEvent::DropAcknowledged { at, .. }
            | BuildEvent::HypothesisConfirmed { at, .. }
            | BuildEvent::WaveAdvanced { at, .. }
            | BuildEvent::BuildBlocked { at, .. }
            | BuildEvent::BuildCompleted { at }
            | BuildEvent::BuildStopped { at }
            | BuildEvent::BuildResumed { at }
            | BuildEvent::StaleEscalated { at }
            | BuildEvent::BuildFinalized { at, .. } => *at,
        }
    }

    /// Drop the event concerns, if any.
    pub fn drop_id(&self) -> Option<&str> {
        match self {
            BuildEvent::DropSpawned { drop_id, .. }
            | BuildEvent::DropAwaitingManual { drop_id, .. }
            | BuildEvent::DropCompleted { drop_id, .. }
            | BuildEvent::DropFailed { drop_id, .. }
            | BuildEvent::DropDead { drop_id, .. }
            | BuildEvent::DropRetried { drop_id, .. }
            | BuildEvent::DropSuperseded { drop_id, .. }
            | BuildEvent::DropAcknowledged { drop_id, .. } => Some(drop_id),
            _ => None,
        }
    }

    /// Whether the event counts as progress for the stale watchdog.
    pub fn is_progress(&self) -> bool {
        !matches!(
            self,
            BuildEvent::StaleEscalated { .. } | BuildEvent::BuildFinalized { .. }
        )
    }

    pub fn from_record(record: &EventRecord) -> Result<Self> {
        Ok(serde_json::from_value(record.payload.clone())?)
    }
}

/// Most recent failure of a drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub failure_type: FailureType,
    pub reason: String,
}

/// Runtime view of one drop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropView {
    pub drop_id: DropId,
    pub status: DropStatus,
    /// 1-based attempt number; bumped by every retry.
    pub attempt: u32,
    /// Automatic retries consumed (R1/R2). Bounded by `max_auto_retries`.
    pub retry_count: u32,
    pub manual_retries: u32,
    /// `DropFailed` and `DropDead` events seen across all attempts.
    #[serde(default)]
    pub failures: u32,
    pub spawned_at: Option<DateTime<Utc>>,
    pub receipt: Option<String>,
    pub launcher: Option<String>,
    pub acknowledged: bool,
    pub concerns: Vec<String>,
    pub last_failure: Option<FailureRecord>,
    /// Context injected into the next attempt's brief.
    pub retry_context: Option<String>,
    pub hypothesis: Option<HypothesisVerdict>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DropView {
    fn new(drop_id: &str) -> Self {
        Self {
            drop_id: drop_id.to_string(),
            status: DropStatus::Pending,
            attempt: 1,
            retry_count: 0,
            manual_retries: 0,
            failures: 0,
            spawned_at: None,
            receipt: None,
            launcher: None,
            acknowledged: false,
            concerns: Vec::new(),
            last_failure: None,
            retry_context: None,
            hypothesis: None,
            completed_at: None,
        }
    }
}

/// Current state of a build, derived from its events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildView {
    pub build_id: BuildId,
    pub status: BuildStatus,
    /// Position of the active wave.
    pub active_wave: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub stale_escalated_at: Option<DateTime<Utc>>,
    pub blocked_reason: Option<String>,
    /// Hypothesis group → winning drop.
    pub resolved_groups: BTreeMap<String, DropId>,
    pub finalized: bool,
    pub drops: BTreeMap<DropId, DropView>,
    pub event_count: u64,
}

impl BuildView {
    /// View of a build that has not started.
    pub fn initial(plan: &BuildPlan) -> Self {
        Self {
            build_id: BuildId::new(plan.id.clone()),
            status: BuildStatus::Pending,
            active_wave: 0,
            started_at: None,
            last_progress_at: None,
            stale_escalated_at: None,
            blocked_reason: None,
            resolved_groups: BTreeMap::new(),
            finalized: false,
            drops: plan
                .drops
                .keys()
                .map(|id| (id.clone(), DropView::new(id)))
                .collect(),
            event_count: 0,
        }
    }

    /// Fold persisted events over the plan.
    pub fn replay(plan: &BuildPlan, records: &[EventRecord]) -> Result<Self> {
        let mut view = Self::initial(plan);
        for record in records {
            view.apply(&BuildEvent::from_record(record)?);
        }
        Ok(view)
    }

    /// Apply one event. Events naming unknown drops are ignored.
    pub fn apply(&mut self, event: &BuildEvent) {
        self.event_count += 1;
        if event.is_progress() {
            self.last_progress_at = Some(event.at());
        }

        match event {
            BuildEvent::BuildStarted { at, .. } => {
                self.status = BuildStatus::Running;
                self.started_at = Some(*at);
                self.active_wave = 0;
            }
            BuildEvent::WaveAdvanced { position, .. } => {
                self.active_wave = *position;
            }
            BuildEvent::HypothesisConfirmed { group, winner, .. } => {
                self.resolved_groups.insert(group.clone(), winner.clone());
            }
            BuildEvent::BuildBlocked { reason, .. } => {
                self.status = BuildStatus::Blocked;
                self.blocked_reason = Some(reason.clone());
            }
            BuildEvent::BuildCompleted { .. } => self.status = BuildStatus::Complete,
            BuildEvent::BuildStopped { .. } => self.status = BuildStatus::Stopped,
            BuildEvent::BuildResumed { .. } => {
                self.status = BuildStatus::Running;
                self.blocked_reason = None;
            }
            BuildEvent::StaleEscalated { at } => self.stale_escalated_at = Some(*at),
            BuildEvent::BuildFinalized { .. } => self.finalized = true,
            _ => self.apply_drop_event(event),
        }
    }

    fn apply_drop_event(&mut self, event: &BuildEvent) {
        let Some(drop) = event.drop_id().and_then(|id| self.drops.get_mut(id)) else {
            return;
        };
        match event {
            BuildEvent::DropSpawned {
                at,
                attempt,
                receipt,
                ..
            } => {
                drop.status = DropStatus::Spawned;
                drop.attempt = *attempt;
                drop.spawned_at = Some(*at);
                drop.receipt = Some(receipt.clone());
            }
            BuildEvent::DropAwaitingManual {
                at,
                attempt,
                launcher,
                ..
            } => {
                drop.status = DropStatus::AwaitingManual;
                drop.attempt = *attempt;
                drop.spawned_at = Some(*at);
                drop.launcher = Some(launcher.clone());
            }
            BuildEvent::DropCompleted {
                at,
                concerns,
                hypothesis,
                ..
            } => {
                drop.status = DropStatus::Complete;
                drop.concerns.extend(concerns.iter().cloned());
                drop.hypothesis = *hypothesis;
                drop.completed_at = Some(*at);
            }
            BuildEvent::DropFailed {
                failure_type,
                reason,
                ..
            } => {
                drop.status = DropStatus::Failed;
                drop.failures += 1;
                drop.last_failure = Some(FailureRecord {
                    failure_type: *failure_type,
                    reason: reason.clone(),
                });
            }
            BuildEvent::DropDead { reason, .. } => {
                drop.status = DropStatus::Dead;
                drop.failures += 1;
                drop.last_failure = Some(FailureRecord {
                    failure_type: FailureType::DeadTimeout,
                    reason: reason.clone(),
                });
            }
            BuildEvent::DropRetried { manual, reason, .. } => {
                drop.status = DropStatus::Pending;
                drop.attempt += 1;
                if *manual {
                    drop.manual_retries += 1;
                } else {
                    drop.retry_count += 1;
                }
                drop.retry_context = Some(reason.clone());
                drop.spawned_at = None;
                drop.receipt = None;
                drop.acknowledged = false;
                drop.hypothesis = None;
            }
            BuildEvent::DropSuperseded { .. } => drop.status = DropStatus::Superseded,
            BuildEvent::DropAcknowledged { .. } => drop.acknowledged = true,
            _ => {}
        }
    }

    pub fn drop_view(&self, drop_id: &str) -> Option<&DropView> {
        self.drops.get(drop_id)
    }

    pub fn status_of(&self, drop_id: &str) -> Option<DropStatus> {
        self.drops.get(drop_id).map(|d| d.status)
    }

    fn in_resolved_group(&self, plan: &BuildPlan, drop_id: &str) -> bool {
        plan.drop_spec(drop_id)
            .and_then(|s| s.hypothesis_group.as_deref())
            .is_some_and(|g| self.resolved_groups.contains_key(g))
    }

    /// Terminal-successful for dependency and stream gating.
    pub fn is_satisfied(&self, plan: &BuildPlan, drop_id: &str) -> bool {
        self.status_of(drop_id) == Some(DropStatus::Complete)
            || self.in_resolved_group(plan, drop_id)
    }

    /// Terminal for wave advancement.
    pub fn is_settled(&self, plan: &BuildPlan, drop_id: &str) -> bool {
        let Some(drop) = self.drops.get(drop_id) else {
            return false;
        };
        match drop.status {
            DropStatus::Complete | DropStatus::Superseded => true,
            _ if self.in_resolved_group(plan, drop_id) => true,
            DropStatus::Failed | DropStatus::Dead => drop.acknowledged,
            _ => false,
        }
    }

    /// A pending drop whose gates are all open.
    pub fn is_ready(&self, plan: &BuildPlan, drop_id: &str) -> bool {
        if self.status_of(drop_id) != Some(DropStatus::Pending) {
            return false;
        }
        let Some(spec) = plan.drop_spec(drop_id) else {
            return false;
        };
        if self.in_resolved_group(plan, drop_id) {
            return false;
        }
        if !spec.depends_on.iter().all(|d| self.is_satisfied(plan, d)) {
            return false;
        }
        plan.stream_predecessor(drop_id)
            .map_or(true, |p| self.is_satisfied(plan, p))
    }

    /// Every blocking drop of the wave is settled.
    pub fn wave_settled(&self, plan: &BuildPlan, position: usize) -> bool {
        plan.wave(position).is_some_and(|wave| {
            wave.drops
                .iter()
                .filter(|d| plan.drop_spec(d).is_some_and(|s| s.blocking))
                .all(|d| self.is_settled(plan, d))
        })
    }

    pub fn active_wave_id<'a>(&self, plan: &'a BuildPlan) -> Option<&'a str> {
        plan.wave(self.active_wave).map(|w| w.id.as_str())
    }

    /// Failed or dead drops still waiting for a human decision.
    pub fn awaiting_decision(&self) -> Vec<&DropView> {
        self.drops
            .values()
            .filter(|d| d.status.is_failure() && !d.acknowledged)
            .collect()
    }

    /// `state.json` shape: the plan with runtime status folded in.
    pub fn state_document(&self, plan: &BuildPlan) -> serde_json::Value {
        let waves: serde_json::Map<String, serde_json::Value> = plan
            .waves
            .iter()
            .map(|w| (w.id.clone(), serde_json::json!(w.drops)))
            .collect();
        let drops: serde_json::Map<String, serde_json::Value> = plan
            .drops
            .iter()
            .map(|(id, spec)| {
                let runtime = self.drops.get(id);
                (
                    id.clone(),
                    serde_json::json!({
                        "name": spec.name,
                        "stream": spec.stream,
                        "order": spec.order,
                        "depends_on": spec.depends_on,
                        "spawn_mode": spec.spawn_mode,
                        "blocking": spec.blocking,
                        "hypothesis_group": spec.hypothesis_group,
                        "status": runtime.map(|d| d.status),
                        "retry_count": runtime.map(|d| d.retry_count),
                        "manual_retries": runtime.map(|d| d.manual_retries),
                        "attempt": runtime.map(|d| d.attempt),
                    }),
                )
            })
            .collect();
        serde_json::json!({
            "build_id": self.build_id,
            "status": self.status,
            "active_wave": self.active_wave_id(plan),
            "waves": waves,
            "drops": drops,
            "recovery": plan.recovery,
            "finalized": self.finalized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DropSpec;

    fn plan() -> BuildPlan {
        let mut plan = BuildPlan::new("b");
        plan.add_wave("W1", &["a", "b", "h1", "h2"]);
        plan.add_drop("a", DropSpec::new("A").in_stream("S", 1))
            .add_drop("b", DropSpec::new("B").in_stream("S", 2))
            .add_drop("h1", DropSpec::new("H1").in_group("g"))
            .add_drop("h2", DropSpec::new("H2").in_group("g"));
        plan
    }

    fn t() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn replay_folds_lifecycle() {
        let plan = plan();
        let mut view = BuildView::initial(&plan);
        view.apply(&BuildEvent::BuildStarted {
            at: t(),
            wave_id: "W1".into(),
        });
        view.apply(&BuildEvent::DropSpawned {
            at: t(),
            drop_id: "a".into(),
            attempt: 1,
            receipt: "r1".into(),
        });
        view.apply(&BuildEvent::DropDead {
            at: t(),
            drop_id: "a".into(),
            reason: "no deposit".into(),
        });
        view.apply(&BuildEvent::DropRetried {
            at: t(),
            drop_id: "a".into(),
            manual: false,
            reason: "timed out".into(),
        });

        let a = view.drop_view("a").unwrap();
        assert_eq!(view.status, BuildStatus::Running);
        assert_eq!(a.status, DropStatus::Pending);
        assert_eq!(a.retry_count, 1);
        assert_eq!(a.attempt, 2);
        assert_eq!(a.retry_context.as_deref(), Some("timed out"));
        assert!(a.spawned_at.is_none());
    }

    #[test]
    fn stream_gates_readiness() {
        let plan = plan();
        let mut view = BuildView::initial(&plan);
        assert!(view.is_ready(&plan, "a"));
        assert!(!view.is_ready(&plan, "b"));
        view.apply(&BuildEvent::DropCompleted {
            at: t(),
            drop_id: "a".into(),
            grade: CompletionGrade::Pass,
            concerns: vec![],
            hypothesis: None,
        });
        assert!(view.is_ready(&plan, "b"));
    }

    #[test]
    fn resolved_group_settles_members() {
        let plan = plan();
        let mut view = BuildView::initial(&plan);
        assert!(!view.is_settled(&plan, "h2"));
        view.apply(&BuildEvent::HypothesisConfirmed {
            at: t(),
            group: "g".into(),
            winner: "h1".into(),
        });
        assert!(view.is_settled(&plan, "h2"));
        assert!(!view.is_ready(&plan, "h2"));
    }

    #[test]
    fn acknowledged_failure_is_settled() {
        let plan = plan();
        let mut view = BuildView::initial(&plan);
        view.apply(&BuildEvent::DropFailed {
            at: t(),
            drop_id: "a".into(),
            failure_type: FailureType::ContentFailure,
            reason: "wrong".into(),
        });
        assert!(!view.is_settled(&plan, "a"));
        assert_eq!(view.awaiting_decision().len(), 1);
        view.apply(&BuildEvent::DropAcknowledged {
            at: t(),
            drop_id: "a".into(),
        });
        assert!(view.is_settled(&plan, "a"));
        assert!(view.awaiting_decision().is_empty());
    }

    #[test]
    fn stale_escalation_is_not_progress() {
        let plan = plan();
        let mut view = BuildView::initial(&plan);
        let start = t();
        view.apply(&BuildEvent::BuildStarted {
            at: start,
            wave_id: "W1".into(),
        });
        view.apply(&BuildEvent::StaleEscalated {
            at: start + chrono::Duration::hours(7),
        });
        assert_eq!(view.last_progress_at, Some(start));
        assert!(view.stale_escalated_at.is_some());
    }

    #[test]
    fn event_payload_round_trips_through_record() {
        let event = BuildEvent::WaveAdvanced {
            at: t(),
            from: "W1".into(),
            to: "W2".into(),
            position: 1,
        };
        let record = EventRecord {
            seq: 1,
            kind: event.kind().into(),
            payload: serde_json::to_value(&event).unwrap(),
            timestamp: t(),
        };
        assert_eq!(record.payload["type"], "wave_advanced");
        assert_eq!(BuildEvent::from_record(&record).unwrap(), event);
    }

    #[test]
    fn state_document_has_persisted_shape() {
        let plan = plan();
        let view = BuildView::initial(&plan);
        let doc = view.state_document(&plan);
        assert_eq!(doc["active_wave"], "W1");
        assert_eq!(doc["drops"]["a"]["status"], "pending");
        assert_eq!(doc["drops"]["a"]["retry_count"], 0);
        assert_eq!(doc["recovery"]["max_auto_retries"], 2);
    }
}
