//! Concurrent claim exclusivity: every task goes to exactly one worker.

use std::collections::HashSet;
use std::sync::Arc;

use pulse_state::fakes::MemoryTaskPool;
use pulse_state::storage_traits::*;
use pulse_state::SurrealTaskPool;

async fn race(pool: Arc<dyn TaskPool>, tasks: usize, workers: usize) -> Vec<String> {
    for i in 0..tasks {
        pool.add("race", NewTask::new(format!("t{i}"), "work", format!("target-{i}")))
            .await
            .unwrap();
    }

    let handles: Vec<_> = (0..workers)
        .map(|w| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let mut won = Vec::new();
                while let Some(task) = pool.claim("race", &format!("w{w}")).await.unwrap() {
                    won.push(task.task_id);
                }
                won
            })
        })
        .collect();

    let mut all = Vec::new();
    for result in futures::future::join_all(handles).await {
        all.extend(result.unwrap());
    }
    all
}

fn assert_exclusive(claimed: &[String], tasks: usize) {
    let unique: HashSet<&String> = claimed.iter().collect();
    assert_eq!(claimed.len(), tasks, "every task claimed exactly once");
    assert_eq!(unique.len(), tasks, "no task handed to two workers");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_pool_claims_are_exclusive() {
    let claimed = race(Arc::new(MemoryTaskPool::new()), 50, 8).await;
    assert_exclusive(&claimed, 50);
}

async fn single_winner(pool: Arc<dyn TaskPool>) {
    pool.add("one", NewTask::new("only", "work", "x")).await.unwrap();

    let futures = (0..16).map(|w| {
        let pool = Arc::clone(&pool);
        async move { pool.claim("one", &format!("w{w}")).await.unwrap() }
    });
    let winners: Vec<PoolTask> = futures::future::join_all(futures)
        .await
        .into_iter()
        .flatten()
        .collect();
    assert_eq!(winners.len(), 1);

    let stored = pool.list("one").await.unwrap();
    assert_eq!(stored[0].status, TaskStatus::Claimed);
    assert_eq!(stored[0].claimant, winners[0].claimant);
}

#[tokio::test]
async fn single_task_has_single_winner() {
    single_winner(Arc::new(MemoryTaskPool::new())).await;
}

// ---------------------------------------------------------------------------
// SurrealDB

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn surreal_single_task_has_single_winner() {
    let pool = SurrealTaskPool::in_memory().await.unwrap();
    single_winner(Arc::new(pool)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn surreal_pool_claims_are_exclusive() {
    let pool = SurrealTaskPool::in_memory().await.unwrap();
    let claimed = race(Arc::new(pool), 20, 6).await;
    assert_exclusive(&claimed, 20);
}
