#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulse_core::{
    BuildId, CollectingChannel, DepositRecord, FilterOracle, FilterVerdict, OracleError,
    Scheduler, SpawnError, SpawnReceipt, SpawnRequest, Stores, Verdict, WorkerSpawner,
};

// ---------------------------------------------------------------------------
// Scripted oracle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Scripted {
    Verdict(Verdict, String),
    Hang,
    Unavailable,
}

/// Answers from a per-drop script; unscripted deposits pass.
#[derive(Default)]
pub struct ScriptedOracle {
    script: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, drop_id: &str, answer: Scripted) {
        self.script
            .lock()
            .unwrap()
            .entry(drop_id.to_string())
            .or_default()
            .push_back(answer);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FilterOracle for ScriptedOracle {
    async fn judge(
        &self,
        _build: &BuildId,
        _brief: &str,
        deposit: &DepositRecord,
    ) -> Result<FilterVerdict, OracleError> {
        self.calls.lock().unwrap().push(deposit.drop_id.clone());
        let next = self
            .script
            .lock()
            .unwrap()
            .get_mut(&deposit.drop_id)
            .and_then(|q| q.pop_front());
        let (verdict, reasoning) = match next {
            None => (Verdict::Pass, String::new()),
            Some(Scripted::Verdict(v, r)) => (v, r),
            Some(Scripted::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                (Verdict::Pass, "too late".to_string())
            }
            Some(Scripted::Unavailable) => {
                return Err(OracleError::Unavailable("judge offline".into()))
            }
        };
        Ok(FilterVerdict {
            drop_id: deposit.drop_id.clone(),
            verdict,
            confidence: 0.9,
            reasoning,
            criteria_results: Vec::new(),
            concerns: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Recording spawner
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSpawner {
    spawned: Mutex<Vec<SpawnRequest>>,
    launchers: Mutex<Vec<SpawnRequest>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_drop(&self, drop_id: &str) {
        self.failing.lock().unwrap().insert(drop_id.to_string());
    }

    pub fn spawned(&self) -> Vec<SpawnRequest> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn spawned_ids(&self) -> Vec<String> {
        self.spawned().into_iter().map(|r| r.drop_id).collect()
    }

    pub fn launchers(&self) -> Vec<SpawnRequest> {
        self.launchers.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerSpawner for RecordingSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnReceipt, SpawnError> {
        if self.failing.lock().unwrap().contains(&request.drop_id) {
            return Err(SpawnError::Launch("worker binary missing".into()));
        }
        self.spawned.lock().unwrap().push(request.clone());
        Ok(SpawnReceipt {
            id: format!("{}:{}:{}", request.build_id, request.drop_id, request.attempt),
            pid: None,
        })
    }

    async fn materialize_launcher(&self, request: &SpawnRequest) -> Result<PathBuf, SpawnError> {
        self.launchers.lock().unwrap().push(request.clone());
        Ok(PathBuf::from(format!("launchers/{}.sh", request.drop_id)))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub scheduler: Scheduler,
    pub oracle: Arc<ScriptedOracle>,
    pub spawner: Arc<RecordingSpawner>,
    pub escalations: Arc<CollectingChannel>,
}

impl Harness {
    pub fn in_memory() -> Self {
        Self::with_stores(Stores::in_memory())
    }

    pub fn with_stores(stores: Stores) -> Self {
        let oracle = Arc::new(ScriptedOracle::new());
        let spawner = Arc::new(RecordingSpawner::new());
        let escalations = Arc::new(CollectingChannel::new());
        let scheduler = Scheduler::new(stores, oracle.clone(), spawner.clone(), escalations.clone());
        Self {
            scheduler,
            oracle,
            spawner,
            escalations,
        }
    }
}

pub fn minutes(base: DateTime<Utc>, m: i64) -> DateTime<Utc> {
    base + chrono::Duration::minutes(m)
}
