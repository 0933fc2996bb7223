//! Tick engine and build lifecycle.
//!
//! A tick is a pure function of persisted state plus the current time: it
//! replays the build's events, performs at most one pass of each phase, and
//! appends new events for everything it decided. Ticks of one build are
//! serialized by a per-build mutex; different builds run independently.
//! The mutex is per process: one state directory takes one coordinator.
//!
//! Phases, in order:
//! 0. finish recovery an interrupted tick left half done
//! 1. judge deposits of in-flight drops
//! 2. declare silent auto drops dead
//! 3. resolve hypothesis groups
//! 4. spawn ready drops, advancing waves while the active one is settled
//! 5. blocked check (R4)
//! 6. stale watchdog (R5)

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pulse_state::fakes::{
    MemoryDepositStore, MemoryDocumentStore, MemoryEventLog, MemoryRecoveryLog,
};
use pulse_state::{
    BuildId, ContentDigest, DepositRecord, DepositStore, DocumentStore, EventLog, FailureType,
    FsStore, HypothesisVerdict, RecoveryActionKind, RecoveryLog, RecoveryLogEntry, RecoveryRule,
    StorageError, TaskPool,
};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

use crate::domain::{ensure_valid, BuildPlan, DropId, PulseError, Result, SpawnMode};
use crate::escalation::{EscalationChannel, EscalationMessage};
use crate::metrics::METRICS;
use crate::obs;
use crate::oracle::{judge_bounded, FilterOracle, Verdict};
use crate::projection::{
    BuildEvent, BuildStatus, BuildView, CompletionGrade, DropStatus, FailureRecord,
};
use crate::recovery::{
    classify_and_recover, classify_failure, evaluate_stale, evaluate_wave_death, FailureContext,
};
use crate::reporting::FinalizeSummary;
use crate::spawner::{SpawnRequest, WorkerSpawner};

const PLAN_DOC: &str = "plan";
const STATE_DOC: &str = "state";
const SUMMARY_DOC: &str = "summary";

/// Default bound on a single oracle call.
pub const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Storage backends used by the scheduler.
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventLog>,
    pub deposits: Arc<dyn DepositStore>,
    pub recovery: Arc<dyn RecoveryLog>,
    pub documents: Arc<dyn DocumentStore>,
    /// Task pools released on worker failure.
    pub pool: Option<Arc<dyn TaskPool>>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            events: Arc::new(MemoryEventLog::new()),
            deposits: Arc::new(MemoryDepositStore::new()),
            recovery: Arc::new(MemoryRecoveryLog::new()),
            documents: Arc::new(MemoryDocumentStore::new()),
            pool: None,
        }
    }

    pub fn from_fs(store: Arc<FsStore>) -> Self {
        Self {
            events: store.clone(),
            deposits: store.clone(),
            recovery: store.clone(),
            documents: store,
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: Arc<dyn TaskPool>) -> Self {
        self.pool = Some(pool);
        self
    }
}

/// Drop status change observed during a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub drop_id: DropId,
    pub from: DropStatus,
    pub to: DropStatus,
}

/// Launcher written for a manual drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherInfo {
    pub drop_id: DropId,
    pub path: String,
}

/// Everything one tick did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickResult {
    pub build_id: BuildId,
    pub spawned: Vec<DropId>,
    pub launchers: Vec<LauncherInfo>,
    pub status_changes: Vec<StatusChange>,
    pub recovery: Vec<RecoveryLogEntry>,
    pub escalations: Vec<EscalationMessage>,
    /// Ids of waves that became active.
    pub waves_advanced: Vec<String>,
    pub build_status: BuildStatus,
    pub events_appended: usize,
}

impl TickResult {
    fn empty(build_id: BuildId, status: BuildStatus) -> Self {
        Self {
            build_id,
            spawned: Vec::new(),
            launchers: Vec::new(),
            status_changes: Vec::new(),
            recovery: Vec::new(),
            escalations: Vec::new(),
            waves_advanced: Vec::new(),
            build_status: status,
            events_appended: 0,
        }
    }

    /// The tick changed nothing.
    pub fn is_noop(&self) -> bool {
        self.events_appended == 0 && self.recovery.is_empty()
    }
}

/// The orchestration engine.
pub struct Scheduler {
    stores: Stores,
    oracle: Arc<dyn FilterOracle>,
    spawner: Arc<dyn WorkerSpawner>,
    escalation: Arc<dyn EscalationChannel>,
    oracle_timeout: Duration,
    locks: Mutex<HashMap<BuildId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Scheduler {
    pub fn new(
        stores: Stores,
        oracle: Arc<dyn FilterOracle>,
        spawner: Arc<dyn WorkerSpawner>,
        escalation: Arc<dyn EscalationChannel>,
    ) -> Self {
        Self {
            stores,
            oracle,
            spawner,
            escalation,
            oracle_timeout: DEFAULT_ORACLE_TIMEOUT,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_oracle_timeout(mut self, timeout: Duration) -> Self {
        self.oracle_timeout = timeout;
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    async fn lock(&self, build: &BuildId) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.entry(build.clone()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    async fn load_plan(&self, build: &BuildId) -> Result<BuildPlan> {
        let doc = self
            .stores
            .documents
            .get(build, PLAN_DOC)
            .await?
            .ok_or_else(|| PulseError::BuildNotFound(build.to_string()))?;
        Ok(serde_json::from_value(doc)?)
    }

    async fn open(&self, build: &BuildId) -> Result<(BuildPlan, BuildView)> {
        let plan = self.load_plan(build).await?;
        let records = self.stores.events.events(build).await?;
        let view = BuildView::replay(&plan, &records)?;
        Ok((plan, view))
    }

    async fn append(&self, build: &BuildId, event: &BuildEvent) -> Result<()> {
        let payload = serde_json::to_value(event)?;
        self.stores.events.append(build, event.kind(), payload).await?;
        Ok(())
    }

    async fn persist_state(&self, build: &BuildId, plan: &BuildPlan, view: &BuildView) -> Result<()> {
        self.stores
            .documents
            .put(build, STATE_DOC, &view.state_document(plan))
            .await?;
        Ok(())
    }

    async fn apply(
        &self,
        build: &BuildId,
        plan: &BuildPlan,
        view: &mut BuildView,
        events: &[BuildEvent],
    ) -> Result<()> {
        for event in events {
            self.append(build, event).await?;
            view.apply(event);
        }
        self.persist_state(build, plan, view).await
    }

    async fn archive_deposit(&self, build: &BuildId, drop_id: &str) -> Result<()> {
        match self.stores.deposits.archive(build, drop_id).await {
            Ok(old) => {
                debug!(build_id = %build, drop_id = %drop_id, attempt = ?old.attempt, "deposit archived");
                Ok(())
            }
            Err(StorageError::DepositNotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Return every task the drop's worker still holds to its pool.
    async fn release_tasks(&self, build: &BuildId, drop_id: &str) -> Result<()> {
        let Some(pool) = &self.stores.pool else {
            return Ok(());
        };
        let released = pool.release_worker(build.as_str(), drop_id).await?;
        if !released.is_empty() {
            info!(
                build_id = %build,
                drop_id = %drop_id,
                released = released.len(),
                "released pool tasks of failed worker"
            );
        }
        Ok(())
    }

    fn notify(&self, message: EscalationMessage) {
        obs::emit_escalation_raised(message.build_id.as_str(), message.rule, &message.summary);
        METRICS.inc_escalations();
        self.escalation.notify(message);
    }

    fn ensure_mutable(build: &BuildId, view: &BuildView) -> Result<()> {
        if view.finalized {
            return Err(PulseError::BuildArchived(build.to_string()));
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Validate and persist a plan, then start its first wave.
    pub async fn start(&self, plan: BuildPlan) -> Result<BuildView> {
        ensure_valid(&plan)?;
        pulse_state::fs::validate_id(&plan.id)?;
        let build = BuildId::new(plan.id.clone());
        let _guard = self.lock(&build).await;

        if !self.stores.events.events(&build).await?.is_empty() {
            return Err(PulseError::BuildExists(build.to_string()));
        }
        self.stores
            .documents
            .put(&build, PLAN_DOC, &serde_json::to_value(&plan)?)
            .await?;

        let wave_id = plan.waves.first().map(|w| w.id.clone()).unwrap_or_default();
        let mut view = BuildView::initial(&plan);
        self.apply(
            &build,
            &plan,
            &mut view,
            &[BuildEvent::BuildStarted {
                at: Utc::now(),
                wave_id: wave_id.clone(),
            }],
        )
        .await?;
        info!(build_id = %build, wave = %wave_id, drops = plan.drops.len(), "build started");
        Ok(view)
    }

    pub async fn stop(&self, build: &BuildId) -> Result<BuildView> {
        let _guard = self.lock(build).await;
        let (plan, mut view) = self.open(build).await?;
        Self::ensure_mutable(build, &view)?;
        match view.status {
            BuildStatus::Running | BuildStatus::Blocked => {}
            status => return Err(invalid_build(build, status, "stop")),
        }
        self.apply(build, &plan, &mut view, &[BuildEvent::BuildStopped { at: Utc::now() }])
            .await?;
        info!(build_id = %build, "build stopped");
        Ok(view)
    }

    /// Resume a stopped or blocked build. The stored plan is re-validated.
    pub async fn resume(&self, build: &BuildId) -> Result<BuildView> {
        let _guard = self.lock(build).await;
        let (plan, mut view) = self.open(build).await?;
        Self::ensure_mutable(build, &view)?;
        match view.status {
            BuildStatus::Stopped | BuildStatus::Blocked => {}
            status => return Err(invalid_build(build, status, "resume")),
        }
        ensure_valid(&plan)?;
        self.apply(build, &plan, &mut view, &[BuildEvent::BuildResumed { at: Utc::now() }])
            .await?;
        info!(build_id = %build, "build resumed");
        Ok(view)
    }

    /// Human retry of a failed or dead drop.
    ///
    /// Does not consume the automatic retry budget. A blocked build is
    /// resumed.
    pub async fn retry(&self, build: &BuildId, drop_id: &str, reason: &str) -> Result<BuildView> {
        let _guard = self.lock(build).await;
        let (plan, mut view) = self.open(build).await?;
        Self::ensure_mutable(build, &view)?;
        if view.status == BuildStatus::Complete {
            return Err(invalid_build(build, view.status, "retry a drop of"));
        }
        let drop = view
            .drop_view(drop_id)
            .ok_or_else(|| drop_not_found(build, drop_id))?;
        if !drop.status.is_failure() {
            return Err(invalid_drop(drop_id, drop.status, "retry"));
        }

        let now = Utc::now();
        let failure_type = drop
            .last_failure
            .as_ref()
            .map(|f| f.failure_type)
            .unwrap_or(FailureType::ContentFailure);
        let entry = RecoveryLogEntry {
            timestamp: now,
            drop_id: Some(drop_id.to_string()),
            rule: RecoveryRule::Manual,
            action: RecoveryActionKind::ManualRetry,
            failure_type,
            reason: reason.to_string(),
            retry_number: None,
        };
        self.stores.recovery.append(build, &entry).await?;
        obs::emit_recovery_applied(build.as_str(), &entry);

        self.archive_deposit(build, drop_id).await?;
        self.release_tasks(build, drop_id).await?;

        let mut events = vec![BuildEvent::DropRetried {
            at: now,
            drop_id: drop_id.to_string(),
            manual: true,
            reason: reason.to_string(),
        }];
        if view.status == BuildStatus::Blocked {
            events.push(BuildEvent::BuildResumed { at: now });
        }
        self.apply(build, &plan, &mut view, &events).await?;
        Ok(view)
    }

    /// Accept a failed or dead drop as terminal so its wave can advance.
    pub async fn acknowledge(&self, build: &BuildId, drop_id: &str) -> Result<BuildView> {
        let _guard = self.lock(build).await;
        let (plan, mut view) = self.open(build).await?;
        Self::ensure_mutable(build, &view)?;
        let drop = view
            .drop_view(drop_id)
            .ok_or_else(|| drop_not_found(build, drop_id))?;
        if !drop.status.is_failure() {
            return Err(invalid_drop(drop_id, drop.status, "acknowledge"));
        }
        if drop.acknowledged {
            return Ok(view);
        }

        let now = Utc::now();
        let entry = RecoveryLogEntry {
            timestamp: now,
            drop_id: Some(drop_id.to_string()),
            rule: RecoveryRule::Manual,
            action: RecoveryActionKind::Acknowledge,
            failure_type: drop
                .last_failure
                .as_ref()
                .map(|f| f.failure_type)
                .unwrap_or(FailureType::ContentFailure),
            reason: format!("{drop_id} accepted as failed"),
            retry_number: None,
        };
        self.stores.recovery.append(build, &entry).await?;
        obs::emit_recovery_applied(build.as_str(), &entry);

        let mut events = vec![BuildEvent::DropAcknowledged {
            at: now,
            drop_id: drop_id.to_string(),
        }];
        if view.status == BuildStatus::Blocked {
            events.push(BuildEvent::BuildResumed { at: now });
        }
        self.apply(build, &plan, &mut view, &events).await?;
        Ok(view)
    }

    /// Write the build summary and make the build read-only.
    pub async fn finalize(&self, build: &BuildId) -> Result<FinalizeSummary> {
        let _guard = self.lock(build).await;
        let (plan, mut view) = self.open(build).await?;
        Self::ensure_mutable(build, &view)?;
        if view.status != BuildStatus::Complete {
            return Err(invalid_build(build, view.status, "finalize"));
        }

        let records = self.stores.events.events(build).await?;
        let digest = ContentDigest::from_bytes(&serde_json::to_vec(&records)?);
        let entries = self.stores.recovery.entries(build).await?;
        let now = Utc::now();
        let summary = FinalizeSummary::new(&plan, &view, &entries, &digest, now);
        self.stores
            .documents
            .put(build, SUMMARY_DOC, &serde_json::to_value(&summary)?)
            .await?;

        self.apply(
            build,
            &plan,
            &mut view,
            &[BuildEvent::BuildFinalized {
                at: now,
                events_digest: digest.as_str().to_string(),
            }],
        )
        .await?;
        info!(build_id = %build, digest = %digest.short(), "build finalized");
        Ok(summary)
    }

    /// Record a deposit on behalf of a worker (manual drops, tests).
    ///
    /// A deposit without an attempt is stamped with the drop's current one.
    pub async fn deposit(&self, build: &BuildId, mut deposit: DepositRecord) -> Result<()> {
        let (_, view) = self.open(build).await?;
        Self::ensure_mutable(build, &view)?;
        let drop = view
            .drop_view(&deposit.drop_id)
            .ok_or_else(|| drop_not_found(build, &deposit.drop_id))?;
        deposit.attempt.get_or_insert(drop.attempt);
        self.stores.deposits.write(build, &deposit).await?;
        Ok(())
    }

    pub async fn status(&self, build: &BuildId) -> Result<BuildView> {
        Ok(self.open(build).await?.1)
    }

    pub async fn plan(&self, build: &BuildId) -> Result<BuildPlan> {
        self.load_plan(build).await
    }

    pub async fn recovery_log(&self, build: &BuildId) -> Result<Vec<RecoveryLogEntry>> {
        self.load_plan(build).await?;
        Ok(self.stores.recovery.entries(build).await?)
    }

    pub async fn list_builds(&self) -> Result<Vec<BuildId>> {
        Ok(self.stores.events.list_builds().await?)
    }

    /// Builds whose view is `running`.
    pub async fn running_builds(&self) -> Result<Vec<BuildId>> {
        let mut running = Vec::new();
        for build in self.list_builds().await? {
            match self.status(&build).await {
                Ok(view) if view.status == BuildStatus::Running => running.push(build),
                Ok(_) => {}
                Err(PulseError::BuildNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(running)
    }

    // -----------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------

    pub async fn tick(&self, build: &BuildId) -> Result<TickResult> {
        self.tick_at(build, Utc::now()).await
    }

    /// Run one tick as of `now`.
    #[instrument(name = "pulse.build", skip(self, now), fields(build_id = %build))]
    pub async fn tick_at(&self, build: &BuildId, now: DateTime<Utc>) -> Result<TickResult> {
        let _guard = self.lock(build).await;
        METRICS.inc_ticks();

        let (plan, view) = self.open(build).await?;
        let mut tick = Tick {
            sched: self,
            build: build.clone(),
            result: TickResult::empty(build.clone(), view.status),
            plan,
            view,
            now,
        };
        if tick.view.status != BuildStatus::Running {
            debug!(build_id = %build, status = %tick.view.status, "tick skipped");
            return Ok(tick.result);
        }

        tick.resume_recovery().await?;
        tick.collect_deposits().await?;
        tick.detect_dead().await?;
        tick.resolve_hypotheses().await?;
        tick.spawn_and_advance().await?;
        tick.check_blocked().await?;
        tick.check_stale().await?;
        tick.finish().await
    }
}

fn invalid_build(build: &BuildId, status: BuildStatus, operation: &str) -> PulseError {
    PulseError::InvalidTransition {
        subject: format!("build {build}"),
        status: status.to_string(),
        operation: operation.to_string(),
    }
}

fn invalid_drop(drop_id: &str, status: DropStatus, operation: &str) -> PulseError {
    PulseError::InvalidTransition {
        subject: format!("drop {drop_id}"),
        status: status.to_string(),
        operation: operation.to_string(),
    }
}

fn drop_not_found(build: &BuildId, drop_id: &str) -> PulseError {
    PulseError::DropNotFound {
        build_id: build.to_string(),
        drop_id: drop_id.to_string(),
    }
}

/// State of one tick in progress.
struct Tick<'a> {
    sched: &'a Scheduler,
    build: BuildId,
    plan: BuildPlan,
    view: BuildView,
    now: DateTime<Utc>,
    result: TickResult,
}

impl Tick<'_> {
    async fn emit(&mut self, event: BuildEvent) -> Result<()> {
        let before = event.drop_id().and_then(|id| self.view.status_of(id));
        self.sched.append(&self.build, &event).await?;
        self.view.apply(&event);
        self.result.events_appended += 1;

        if let (Some(drop_id), Some(from)) = (event.drop_id(), before) {
            if let Some(to) = self.view.status_of(drop_id).filter(|to| *to != from) {
                obs::emit_drop_status_changed(self.build.as_str(), drop_id, from.as_str(), to.as_str());
                self.result.status_changes.push(StatusChange {
                    drop_id: drop_id.to_string(),
                    from,
                    to,
                });
            }
        }
        Ok(())
    }

    /// Write-ahead: the recovery entry is durable before any side effect.
    async fn record(&mut self, entry: RecoveryLogEntry) -> Result<()> {
        self.sched.stores.recovery.append(&self.build, &entry).await?;
        obs::emit_recovery_applied(self.build.as_str(), &entry);
        self.result.recovery.push(entry);
        Ok(())
    }

    fn escalate(&mut self, drop_id: Option<&str>, rule: RecoveryRule, summary: &str) {
        let message = EscalationMessage::new(
            self.build.clone(),
            drop_id.map(str::to_string),
            rule,
            summary,
            self.now,
        );
        self.sched.notify(message.clone());
        self.result.escalations.push(message);
    }

    /// Apply R1-R3 to a drop that just failed or died.
    async fn recover(&mut self, drop_id: &str, ctx: FailureContext) -> Result<()> {
        let Some(drop) = self.view.drop_view(drop_id).cloned() else {
            return Ok(());
        };
        let decision = classify_and_recover(&drop, &ctx, &self.plan.recovery);
        self.record(decision.log_entry(Some(drop_id), self.now)).await?;

        if decision.is_retry() {
            self.auto_retry(drop_id, &decision.reason).await?;
        } else if decision.escalates() {
            self.escalate(Some(drop_id), decision.rule, &decision.reason);
        }
        Ok(())
    }

    async fn auto_retry(&mut self, drop_id: &str, reason: &str) -> Result<()> {
        self.sched.archive_deposit(&self.build, drop_id).await?;
        METRICS.inc_auto_retries();
        self.emit(BuildEvent::DropRetried {
            at: self.now,
            drop_id: drop_id.to_string(),
            manual: false,
            reason: reason.to_string(),
        })
        .await
    }

    /// Finish recovery that an interrupted tick left half done. Every
    /// failure event owns one R1-R3 entry, and an auto-retry entry is
    /// always followed by the retry itself.
    async fn resume_recovery(&mut self) -> Result<()> {
        let failed: Vec<(DropId, u32, Option<FailureRecord>)> = self
            .view
            .drops
            .values()
            .filter(|d| d.status.is_failure() && !d.acknowledged)
            .map(|d| (d.drop_id.clone(), d.failures, d.last_failure.clone()))
            .collect();
        if failed.is_empty() {
            return Ok(());
        }

        let entries = self.sched.stores.recovery.entries(&self.build).await?;
        for (drop_id, failures, last_failure) in failed {
            let decided: Vec<&RecoveryLogEntry> = entries
                .iter()
                .filter(|e| e.drop_id.as_deref() == Some(drop_id.as_str()))
                .filter(|e| {
                    matches!(e.rule, RecoveryRule::R1 | RecoveryRule::R2 | RecoveryRule::R3)
                })
                .collect();

            if (decided.len() as u32) < failures {
                let Some(failure) = last_failure else {
                    continue;
                };
                warn!(build_id = %self.build, drop_id = %drop_id, "resuming unrecorded recovery");
                self.sched.release_tasks(&self.build, &drop_id).await?;
                self.recover(&drop_id, FailureContext::new(failure.failure_type, failure.reason))
                    .await?;
            } else if let Some(last) = decided
                .last()
                .filter(|e| e.action == RecoveryActionKind::AutoRetry)
            {
                let reason = last.reason.clone();
                warn!(build_id = %self.build, drop_id = %drop_id, "applying recorded auto retry");
                self.auto_retry(&drop_id, &reason).await?;
            }
        }
        Ok(())
    }

    async fn collect_deposits(&mut self) -> Result<()> {
        let candidates: Vec<(DropId, DropStatus, u32)> = self
            .view
            .drops
            .values()
            .filter(|d| d.status.in_flight() || d.status == DropStatus::Pending)
            .map(|d| (d.drop_id.clone(), d.status, d.attempt))
            .collect();

        for (drop_id, status, attempt) in candidates {
            let deposit = match self.sched.stores.deposits.current(&self.build, &drop_id).await {
                Ok(Some(deposit)) => deposit,
                Ok(None) => continue,
                Err(StorageError::Serialization(e)) => {
                    self.reject_unreadable(&drop_id, status, &e.to_string()).await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if deposit.attempt.is_some_and(|a| a != attempt) {
                debug!(
                    build_id = %self.build,
                    drop_id = %drop_id,
                    deposit_attempt = ?deposit.attempt,
                    attempt = attempt,
                    "discarding deposit of a superseded attempt"
                );
                self.sched.archive_deposit(&self.build, &drop_id).await?;
                continue;
            }
            if !status.in_flight() {
                continue;
            }

            let brief = self
                .plan
                .drop_spec(&drop_id)
                .map(|s| s.brief.clone())
                .unwrap_or_default();
            let verdict = match judge_bounded(
                self.sched.oracle.as_ref(),
                &self.build,
                &brief,
                &deposit,
                self.sched.oracle_timeout,
            )
            .await
            {
                Ok(verdict) => verdict,
                Err(e) => {
                    obs::emit_judging_deferred(self.build.as_str(), &drop_id, &e);
                    continue;
                }
            };

            match verdict.verdict {
                Verdict::Pass | Verdict::Warn => {
                    let grade = if verdict.verdict == Verdict::Pass {
                        CompletionGrade::Pass
                    } else {
                        CompletionGrade::Warn
                    };
                    let mut concerns = verdict.concerns;
                    if grade == CompletionGrade::Warn && concerns.is_empty() && !verdict.reasoning.is_empty() {
                        concerns.push(verdict.reasoning);
                    }
                    for concern in &concerns {
                        obs::emit_drop_concern(self.build.as_str(), &drop_id, concern);
                    }
                    self.emit(BuildEvent::DropCompleted {
                        at: self.now,
                        drop_id,
                        grade,
                        concerns,
                        hypothesis: deposit.verdict,
                    })
                    .await?;
                }
                Verdict::Fail => {
                    let reason = if verdict.reasoning.is_empty() {
                        deposit.summary.clone()
                    } else {
                        verdict.reasoning
                    };
                    let failure_type = classify_failure(&reason);
                    self.emit(BuildEvent::DropFailed {
                        at: self.now,
                        drop_id: drop_id.clone(),
                        failure_type,
                        reason: reason.clone(),
                    })
                    .await?;
                    self.sched.release_tasks(&self.build, &drop_id).await?;
                    self.recover(&drop_id, FailureContext::new(failure_type, reason)).await?;
                }
            }
        }
        Ok(())
    }

    /// Quarantine a deposit that does not parse. An in-flight drop fails
    /// as transient so R2 can retry it.
    async fn reject_unreadable(
        &mut self,
        drop_id: &str,
        status: DropStatus,
        error: &str,
    ) -> Result<()> {
        self.sched.stores.deposits.quarantine(&self.build, drop_id).await?;
        if !status.in_flight() {
            return Ok(());
        }
        let reason = format!("deposit unreadable: {error}");
        self.emit(BuildEvent::DropFailed {
            at: self.now,
            drop_id: drop_id.to_string(),
            failure_type: FailureType::Transient,
            reason: reason.clone(),
        })
        .await?;
        self.sched.release_tasks(&self.build, drop_id).await?;
        self.recover(drop_id, FailureContext::new(FailureType::Transient, reason))
            .await
    }

    /// Manual drops are never declared dead.
    async fn detect_dead(&mut self) -> Result<()> {
        let threshold = self.plan.recovery.dead_threshold();
        let candidates: Vec<DropId> = self
            .view
            .drops
            .values()
            .filter(|d| d.status == DropStatus::Spawned)
            .filter(|d| {
                self.plan
                    .drop_spec(&d.drop_id)
                    .is_some_and(|s| s.spawn_mode == SpawnMode::Auto)
            })
            .filter(|d| d.spawned_at.is_some_and(|at| self.now - at >= threshold))
            .map(|d| d.drop_id.clone())
            .collect();

        for drop_id in candidates {
            // A deposit the oracle has not judged yet means the worker is alive.
            // An unparsable one is handled by the next collection pass.
            match self.sched.stores.deposits.current(&self.build, &drop_id).await {
                Ok(Some(_)) | Err(StorageError::Serialization(_)) => continue,
                Ok(None) => {}
                Err(e) => return Err(e.into()),
            }
            let reason = format!(
                "no deposit within {}s of spawn",
                self.plan.recovery.dead_threshold_seconds
            );
            self.emit(BuildEvent::DropDead {
                at: self.now,
                drop_id: drop_id.clone(),
                reason: reason.clone(),
            })
            .await?;
            self.sched.release_tasks(&self.build, &drop_id).await?;
            self.recover(&drop_id, FailureContext::new(FailureType::DeadTimeout, reason))
                .await?;
        }
        Ok(())
    }

    async fn resolve_hypotheses(&mut self) -> Result<()> {
        let groups: BTreeSet<String> = self
            .plan
            .drops
            .values()
            .filter_map(|s| s.hypothesis_group.clone())
            .collect();

        for group in groups {
            if self.view.resolved_groups.contains_key(&group) {
                continue;
            }
            let members: Vec<DropId> = self
                .plan
                .group_members(&group)
                .into_iter()
                .map(str::to_string)
                .collect();
            let winner = members.iter().find(|m| {
                self.view.drop_view(m).is_some_and(|d| {
                    d.status == DropStatus::Complete
                        && d.hypothesis == Some(HypothesisVerdict::Confirmed)
                })
            });
            let Some(winner) = winner.cloned() else {
                continue;
            };

            info!(build_id = %self.build, group = %group, winner = %winner, "hypothesis confirmed");
            self.emit(BuildEvent::HypothesisConfirmed {
                at: self.now,
                group: group.clone(),
                winner: winner.clone(),
            })
            .await?;
            for member in members.iter().filter(|m| **m != winner) {
                let open = self.view.status_of(member).is_some_and(|s| {
                    s == DropStatus::Pending || s.in_flight()
                });
                if open {
                    self.emit(BuildEvent::DropSuperseded {
                        at: self.now,
                        drop_id: member.clone(),
                        group: group.clone(),
                        winner: winner.clone(),
                    })
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn spawn_and_advance(&mut self) -> Result<()> {
        loop {
            self.spawn_ready().await?;
            let active = self.view.active_wave;
            if !self.view.wave_settled(&self.plan, active) {
                return Ok(());
            }
            let from = self.view.active_wave_id(&self.plan).unwrap_or_default().to_string();
            let Some(next) = self.plan.wave(active + 1).map(|w| w.id.clone()) else {
                info!(build_id = %self.build, "build complete");
                return self.emit(BuildEvent::BuildCompleted { at: self.now }).await;
            };
            obs::emit_wave_advanced(self.build.as_str(), &from, &next);
            self.emit(BuildEvent::WaveAdvanced {
                at: self.now,
                from,
                to: next.clone(),
                position: active + 1,
            })
            .await?;
            self.result.waves_advanced.push(next);
        }
    }

    /// Spawn every ready drop of the active and earlier waves.
    async fn spawn_ready(&mut self) -> Result<()> {
        let ready: Vec<DropId> = self
            .plan
            .waves
            .iter()
            .take(self.view.active_wave + 1)
            .flat_map(|w| w.drops.iter())
            .filter(|d| self.view.is_ready(&self.plan, d))
            .cloned()
            .collect();

        for drop_id in ready {
            let (Some(spec), Some(drop)) = (self.plan.drop_spec(&drop_id), self.view.drop_view(&drop_id))
            else {
                continue;
            };
            let mode = spec.spawn_mode;
            let request = SpawnRequest {
                build_id: self.build.clone(),
                drop_id: drop_id.clone(),
                name: spec.name.clone(),
                brief: spec.brief.clone(),
                attempt: drop.attempt,
                retry_context: drop.retry_context.clone(),
            };

            let outcome = match mode {
                SpawnMode::Auto => self.sched.spawner.spawn(&request).await.map(|receipt| {
                    BuildEvent::DropSpawned {
                        at: self.now,
                        drop_id: drop_id.clone(),
                        attempt: request.attempt,
                        receipt: receipt.id,
                    }
                }),
                SpawnMode::Manual => self
                    .sched
                    .spawner
                    .materialize_launcher(&request)
                    .await
                    .map(|path| BuildEvent::DropAwaitingManual {
                        at: self.now,
                        drop_id: drop_id.clone(),
                        attempt: request.attempt,
                        launcher: path.display().to_string(),
                    }),
            };

            match outcome {
                Ok(event) => {
                    match &event {
                        BuildEvent::DropAwaitingManual { launcher, .. } => {
                            self.result.launchers.push(LauncherInfo {
                                drop_id: drop_id.clone(),
                                path: launcher.clone(),
                            });
                        }
                        _ => {
                            METRICS.inc_spawns();
                            obs::emit_drop_spawned(self.build.as_str(), &drop_id, request.attempt);
                            self.result.spawned.push(drop_id.clone());
                        }
                    }
                    self.emit(event).await?;
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.emit(BuildEvent::DropFailed {
                        at: self.now,
                        drop_id: drop_id.clone(),
                        failure_type: FailureType::SpawnError,
                        reason: reason.clone(),
                    })
                    .await?;
                    self.recover(&drop_id, FailureContext::new(FailureType::SpawnError, reason))
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn check_blocked(&mut self) -> Result<()> {
        let Some(decision) = evaluate_wave_death(&self.plan, &self.view) else {
            return Ok(());
        };
        let wave_id = self.view.active_wave_id(&self.plan).unwrap_or_default().to_string();
        self.record(decision.log_entry(None, self.now)).await?;
        obs::emit_build_blocked(self.build.as_str(), &decision.reason);
        self.emit(BuildEvent::BuildBlocked {
            at: self.now,
            wave_id,
            reason: decision.reason.clone(),
        })
        .await?;
        self.escalate(None, decision.rule, &decision.reason);
        Ok(())
    }

    async fn check_stale(&mut self) -> Result<()> {
        let Some(decision) = evaluate_stale(&self.plan, &self.view, self.now) else {
            return Ok(());
        };
        self.record(decision.log_entry(None, self.now)).await?;
        self.emit(BuildEvent::StaleEscalated { at: self.now }).await?;
        self.escalate(None, decision.rule, &decision.reason);
        Ok(())
    }

    async fn finish(mut self) -> Result<TickResult> {
        if self.result.events_appended > 0 {
            self.sched
                .persist_state(&self.build, &self.plan, &self.view)
                .await?;
        }
        self.result.build_status = self.view.status;
        obs::emit_tick_completed(
            self.build.as_str(),
            self.result.spawned.len(),
            self.result.status_changes.len(),
            self.view.status.as_str(),
        );
        Ok(self.result)
    }
}
