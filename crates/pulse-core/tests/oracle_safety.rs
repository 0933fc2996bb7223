mod common;

use std::time::Duration;

use chrono::Utc;
use common::{minutes, RecordingSpawner, Scripted, ScriptedOracle};
use pulse_core::{
    BuildId, BuildPlan, CollectingChannel, DepositRecord, DepositStatus, DropSpec, DropStatus,
    Scheduler, Stores, Verdict,
};
use std::sync::Arc;

fn harness() -> (Scheduler, Arc<ScriptedOracle>) {
    let oracle = Arc::new(ScriptedOracle::new());
    let scheduler = Scheduler::new(
        Stores::in_memory(),
        oracle.clone(),
        Arc::new(RecordingSpawner::new()),
        Arc::new(CollectingChannel::new()),
    )
    .with_oracle_timeout(Duration::from_millis(50));
    (scheduler, oracle)
}

fn plan() -> BuildPlan {
    let mut plan = BuildPlan::new("judge");
    plan.add_wave("W1", &["a"]).add_drop("a", DropSpec::new("A"));
    plan
}

#[tokio::test(start_paused = true)]
async fn timed_out_or_unavailable_oracle_never_passes() {
    let (s, oracle) = harness();
    let build = BuildId::new("judge");
    let t0 = Utc::now();
    s.start(plan()).await.expect("start");
    s.tick_at(&build, t0).await.expect("tick");
    s.deposit(&build, DepositRecord::new("a", DepositStatus::Complete, "done"))
        .await
        .expect("deposit");

    oracle.push("a", Scripted::Hang);
    oracle.push("a", Scripted::Unavailable);
    for i in 1..=2 {
        let r = s.tick_at(&build, minutes(t0, i)).await.expect("tick");
        assert!(r.is_noop(), "unjudged deposit must not change state");
        let view = s.status(&build).await.expect("status");
        assert_eq!(view.status_of("a"), Some(DropStatus::Spawned));
    }

    // A deposit awaiting judgment keeps the drop alive past the dead threshold.
    oracle.push("a", Scripted::Unavailable);
    let r = s.tick_at(&build, minutes(t0, 60)).await.expect("tick");
    assert!(r.recovery.is_empty());

    let r = s.tick_at(&build, minutes(t0, 61)).await.expect("tick");
    assert_eq!(r.status_changes[0].to, DropStatus::Complete);
    assert_eq!(oracle.calls().len(), 4);
}

#[tokio::test]
async fn deposit_from_an_earlier_attempt_is_discarded() {
    let (s, oracle) = harness();
    let build = BuildId::new("judge");
    let t0 = Utc::now();
    s.start(plan()).await.expect("start");
    s.tick_at(&build, t0).await.expect("tick");

    // Attempt 1 dies and is retried as attempt 2.
    s.tick_at(&build, minutes(t0, 15)).await.expect("tick");
    let mut stale = DepositRecord::new("a", DepositStatus::Complete, "late output of attempt 1");
    stale.attempt = Some(1);
    s.deposit(&build, stale).await.expect("late deposit");

    let r = s.tick_at(&build, minutes(t0, 16)).await.expect("tick");
    assert!(r.status_changes.is_empty());
    assert!(oracle.calls().is_empty());
    assert!(s
        .stores()
        .deposits
        .current(&build, "a")
        .await
        .expect("current")
        .is_none());

    // The fresh attempt can now deposit.
    s.deposit(&build, DepositRecord::new("a", DepositStatus::Complete, "attempt 2"))
        .await
        .expect("fresh deposit");
    oracle.push("a", Scripted::Verdict(Verdict::Warn, "no changelog entry".into()));
    let r = s.tick_at(&build, minutes(t0, 17)).await.expect("tick");
    assert_eq!(r.status_changes[0].to, DropStatus::Complete);
    let view = s.status(&build).await.expect("status");
    assert_eq!(view.drop_view("a").expect("a").concerns, vec!["no changelog entry"]);
}
