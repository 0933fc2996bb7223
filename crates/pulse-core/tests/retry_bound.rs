mod common;

use std::sync::Arc;

use chrono::Utc;
use common::{minutes, Harness, Scripted};
use pulse_core::{
    BuildId, BuildPlan, BuildStatus, DepositRecord, DepositStatus, DropSpec, DropStatus,
    FailureType, RecoveryRule, Stores, Verdict,
};
use pulse_state::fakes::MemoryTaskPool;
use pulse_state::{NewTask, RecoveryActionKind, TaskPool, TaskStatus};

fn single_drop_plan(id: &str, max_auto_retries: i64) -> BuildPlan {
    let mut plan = BuildPlan::new(id);
    plan.add_wave("W1", &["a"])
        .add_drop("a", DropSpec::new("A").with_brief("Write the parser"));
    plan.recovery.max_auto_retries = max_auto_retries;
    plan
}

fn rules(entries: &[pulse_core::RecoveryLogEntry]) -> Vec<RecoveryRule> {
    entries.iter().map(|e| e.rule).collect()
}

#[tokio::test]
async fn dead_drop_is_retried_until_budget_then_escalated() {
    let h = Harness::in_memory();
    let build = BuildId::new("dead");
    let t0 = Utc::now();
    h.scheduler.start(single_drop_plan("dead", 1)).await.expect("start");
    h.scheduler.tick_at(&build, t0).await.expect("tick");

    // Not yet dead one second before the threshold.
    let r = h
        .scheduler
        .tick_at(&build, t0 + chrono::Duration::seconds(899))
        .await
        .expect("tick");
    assert!(r.is_noop());

    let r = h.scheduler.tick_at(&build, minutes(t0, 15)).await.expect("tick");
    assert_eq!(rules(&r.recovery), vec![RecoveryRule::R1]);
    assert_eq!(r.recovery[0].retry_number, Some(1));
    assert_eq!(r.spawned, vec!["a"], "retried drop respawns in the same tick");

    let r = h.scheduler.tick_at(&build, minutes(t0, 30)).await.expect("tick");
    assert_eq!(rules(&r.recovery), vec![RecoveryRule::R3, RecoveryRule::R4]);
    assert!(r.recovery[0].reason.contains("exhausted"));
    assert_eq!(r.build_status, BuildStatus::Blocked);

    let view = h.scheduler.status(&build).await.expect("status");
    let a = view.drop_view("a").expect("drop a");
    assert_eq!(a.status, DropStatus::Dead);
    assert_eq!(a.retry_count, 1);

    let requests = h.spawner.spawned();
    assert_eq!(requests.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![1, 2]);
    let retry_brief = requests[1].full_brief();
    assert!(retry_brief.contains("no deposit within 900s"));
    assert!(retry_brief.contains("disregarded"));

    let log = h.scheduler.recovery_log(&build).await.expect("log");
    assert_eq!(
        rules(&log),
        vec![RecoveryRule::R1, RecoveryRule::R3, RecoveryRule::R4]
    );
}

#[tokio::test]
async fn transient_failure_retries_but_content_failure_escalates() {
    let h = Harness::in_memory();
    let build = BuildId::new("fail");
    let t0 = Utc::now();
    h.scheduler.start(single_drop_plan("fail", 2)).await.expect("start");
    h.scheduler.tick_at(&build, t0).await.expect("tick");

    h.oracle.push(
        "a",
        Scripted::Verdict(Verdict::Fail, "upstream returned 503".into()),
    );
    h.scheduler
        .deposit(&build, DepositRecord::new("a", DepositStatus::Complete, "v1"))
        .await
        .expect("deposit");
    let r = h.scheduler.tick_at(&build, minutes(t0, 1)).await.expect("tick");
    assert_eq!(rules(&r.recovery), vec![RecoveryRule::R2]);
    assert_eq!(r.recovery[0].failure_type, FailureType::Transient);

    h.oracle.push(
        "a",
        Scripted::Verdict(Verdict::Fail, "tests are missing entirely".into()),
    );
    h.scheduler
        .deposit(&build, DepositRecord::new("a", DepositStatus::Complete, "v2"))
        .await
        .expect("second deposit");
    let r = h.scheduler.tick_at(&build, minutes(t0, 2)).await.expect("tick");
    assert_eq!(r.recovery[0].rule, RecoveryRule::R3);
    assert_eq!(r.recovery[0].failure_type, FailureType::ContentFailure);

    let view = h.scheduler.status(&build).await.expect("status");
    assert_eq!(view.drop_view("a").expect("a").retry_count, 1);

    let history = h
        .scheduler
        .stores()
        .deposits
        .history(&build, "a")
        .await
        .expect("history");
    assert_eq!(history.len(), 2, "first deposit archived, second still current");
    assert_eq!(history[0].summary, "v1");
}

#[tokio::test]
async fn manual_retry_does_not_refill_the_auto_budget() {
    let h = Harness::in_memory();
    let build = BuildId::new("manual");
    let t0 = Utc::now();
    h.scheduler.start(single_drop_plan("manual", 1)).await.expect("start");
    h.scheduler.tick_at(&build, t0).await.expect("tick");
    h.scheduler.tick_at(&build, minutes(t0, 15)).await.expect("tick");
    h.scheduler.tick_at(&build, minutes(t0, 30)).await.expect("tick");

    let view = h
        .scheduler
        .retry(&build, "a", "re-run with the fixed fixture")
        .await
        .expect("retry");
    assert_eq!(view.status, BuildStatus::Running);
    let a = view.drop_view("a").expect("a");
    assert_eq!(a.manual_retries, 1);
    assert_eq!(a.retry_count, 1);
    assert_eq!(a.attempt, 3);

    let r = h.scheduler.tick_at(&build, minutes(t0, 31)).await.expect("tick");
    assert_eq!(r.spawned, vec!["a"]);
    let r = h.scheduler.tick_at(&build, minutes(t0, 46)).await.expect("tick");
    assert_eq!(r.recovery[0].rule, RecoveryRule::R3);

    let log = h.scheduler.recovery_log(&build).await.expect("log");
    let manual: Vec<_> = log
        .iter()
        .filter(|e| e.rule == RecoveryRule::Manual)
        .collect();
    assert_eq!(manual.len(), 1);
    assert_eq!(manual[0].action, RecoveryActionKind::ManualRetry);
}

#[tokio::test]
async fn manual_drops_are_never_declared_dead() {
    let h = Harness::in_memory();
    let build = BuildId::new("hitl");
    let mut plan = BuildPlan::new("hitl");
    plan.add_wave("W1", &["review"])
        .add_drop("review", DropSpec::new("Review").manual());
    let t0 = Utc::now();
    h.scheduler.start(plan).await.expect("start");

    let r = h.scheduler.tick_at(&build, t0).await.expect("tick");
    assert_eq!(r.launchers.len(), 1);
    h.scheduler
        .tick_at(&build, minutes(t0, 120))
        .await
        .expect("tick");

    let view = h.scheduler.status(&build).await.expect("status");
    assert_eq!(view.status_of("review"), Some(DropStatus::AwaitingManual));
    let log = h.scheduler.recovery_log(&build).await.expect("log");
    assert!(log.is_empty());
}

#[tokio::test]
async fn dead_worker_releases_its_pool_tasks() {
    let pool = Arc::new(MemoryTaskPool::new());
    let h = Harness::with_stores(Stores::in_memory().with_pool(pool.clone()));
    let build = BuildId::new("pooled");
    let t0 = Utc::now();
    h.scheduler.start(single_drop_plan("pooled", 1)).await.expect("start");
    h.scheduler.tick_at(&build, t0).await.expect("tick");

    pool.add("pooled", NewTask::new("t1", "lint", "src/lib.rs"))
        .await
        .expect("add");
    pool.claim("pooled", "a").await.expect("claim").expect("task");

    h.scheduler.tick_at(&build, minutes(t0, 15)).await.expect("tick");
    let tasks = pool.list("pooled").await.expect("list");
    assert_eq!(tasks[0].status, TaskStatus::Pending);
    assert!(tasks[0].claimant.is_none());
}
