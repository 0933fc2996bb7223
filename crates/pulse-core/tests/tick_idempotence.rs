mod common;

use std::sync::Arc;

use chrono::Utc;
use common::{minutes, Harness};
use pulse_core::{BuildId, BuildPlan, BuildStatus, DepositRecord, DepositStatus, DropSpec, Stores};
use pulse_state::FsStore;

fn plan(id: &str) -> BuildPlan {
    let mut plan = BuildPlan::new(id);
    plan.add_wave("W1", &["a", "b", "m"]).add_wave("W2", &["c"]);
    plan.add_drop("a", DropSpec::new("A").in_stream("S1", 1))
        .add_drop("b", DropSpec::new("B").in_stream("S1", 2))
        .add_drop("m", DropSpec::new("M").manual())
        .add_drop("c", DropSpec::new("C").depends_on(&["a"]));
    plan
}

#[tokio::test]
async fn repeated_ticks_without_external_change_do_nothing() {
    let h = Harness::in_memory();
    let build = BuildId::new("idem");
    let t0 = Utc::now();
    h.scheduler.start(plan("idem")).await.expect("start");

    let first = h.scheduler.tick_at(&build, t0).await.expect("tick");
    assert!(!first.is_noop());
    let events_after_first = h.scheduler.status(&build).await.expect("status").event_count;

    for i in 0..3 {
        let r = h.scheduler.tick_at(&build, minutes(t0, i)).await.expect("tick");
        assert!(r.is_noop(), "tick {i} changed state: {r:?}");
    }
    let view = h.scheduler.status(&build).await.expect("status");
    assert_eq!(view.event_count, events_after_first);
    assert_eq!(h.spawner.spawned_ids(), vec!["a"]);
    assert_eq!(h.spawner.launchers().len(), 1);
}

#[tokio::test]
async fn judged_deposit_is_not_judged_again() {
    let h = Harness::in_memory();
    let build = BuildId::new("idem");
    let t0 = Utc::now();
    h.scheduler.start(plan("idem")).await.expect("start");
    h.scheduler.tick_at(&build, t0).await.expect("tick");
    h.scheduler
        .deposit(&build, DepositRecord::new("a", DepositStatus::Complete, "done"))
        .await
        .expect("deposit");

    h.scheduler.tick_at(&build, minutes(t0, 1)).await.expect("tick");
    h.scheduler.tick_at(&build, minutes(t0, 2)).await.expect("tick");
    assert_eq!(h.oracle.calls(), vec!["a"]);
    assert_eq!(h.spawner.spawned_ids(), vec!["a", "b"]);
}

#[tokio::test]
async fn concurrent_ticks_of_one_build_are_serialized() {
    let h = Arc::new(Harness::in_memory());
    let build = BuildId::new("idem");
    let t0 = Utc::now();
    h.scheduler.start(plan("idem")).await.expect("start");

    let ticks = (0..8).map(|_| {
        let h = h.clone();
        let build = build.clone();
        tokio::spawn(async move { h.scheduler.tick_at(&build, t0).await })
    });
    let results = futures::future::join_all(ticks).await;
    let changed = results
        .into_iter()
        .map(|r| r.expect("join").expect("tick"))
        .filter(|r| !r.is_noop())
        .count();
    assert_eq!(changed, 1);
    assert_eq!(h.spawner.spawned_ids(), vec!["a"]);
}

#[tokio::test]
async fn state_survives_a_fresh_scheduler_on_the_same_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let build = BuildId::new("durable");
    let t0 = Utc::now();
    {
        let fs = Arc::new(FsStore::new(dir.path()).expect("store"));
        let h = Harness::with_stores(Stores::from_fs(fs));
        h.scheduler.start(plan("durable")).await.expect("start");
        h.scheduler.tick_at(&build, t0).await.expect("tick");
        h.scheduler
            .deposit(&build, DepositRecord::new("a", DepositStatus::Complete, "done"))
            .await
            .expect("deposit");
    }

    let fs = Arc::new(FsStore::new(dir.path()).expect("reopen"));
    let h = Harness::with_stores(Stores::from_fs(fs));
    let before = h.scheduler.status(&build).await.expect("status");
    assert_eq!(before.status, BuildStatus::Running);

    let r = h.scheduler.tick_at(&build, minutes(t0, 1)).await.expect("tick");
    assert_eq!(r.spawned, vec!["b"], "only the stream successor is new");
    assert!(dir.path().join("builds/durable/state.json").is_file());
}
