//! Runtime configuration.
//!
//! Resolution order: built-in defaults, then `pulse.toml` (or the file given
//! with `--config`), then environment variables.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pulse_state::{FsStore, StateError, StorageError, SurrealTaskPool, TaskPool};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{PulseError, Result};
use crate::escalation::{EscalationChannel, LogChannel, MultiChannel, WebhookChannel};
use crate::oracle::{DepositStatusOracle, FilterOracle, VerdictFileOracle};
use crate::scheduler::{Scheduler, Stores};
use crate::spawner::CommandSpawner;

pub const DEFAULT_CONFIG_FILE: &str = "pulse.toml";

/// Which filter oracle judges deposits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleKind {
    /// Judge by the deposit's own status.
    #[default]
    DepositStatus,
    /// Wait for an external judge to write `filters/<drop>.json`.
    VerdictFile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub state_dir: PathBuf,
    pub oracle_timeout_secs: u64,
    pub tick_interval_secs: u64,
    pub oracle: OracleKind,
    /// Worker argv. Empty means auto drops cannot be spawned.
    pub worker_command: Vec<String>,
    pub webhook_url: Option<String>,
    /// Release pool tasks held by failed or dead drops.
    pub release_pool_tasks: bool,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".pulse"),
            oracle_timeout_secs: 120,
            tick_interval_secs: 30,
            oracle: OracleKind::default(),
            worker_command: Vec::new(),
            webhook_url: None,
            release_pool_tasks: true,
        }
    }
}

impl PulseConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PulseError::Config(e.to_string()))
    }

    /// Load `path`, or `pulse.toml` in the working directory when it exists,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    PulseError::Config(format!("read {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&text)?
            }
            None => match std::fs::read_to_string(DEFAULT_CONFIG_FILE) {
                Ok(text) => Self::from_toml_str(&text)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
                Err(e) => return Err(PulseError::Config(format!("read {DEFAULT_CONFIG_FILE}: {e}"))),
            },
        };
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("PULSE_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("PULSE_WEBHOOK_URL") {
            self.webhook_url = (!url.is_empty()).then_some(url);
        }
        if let Some(secs) = lookup("PULSE_ORACLE_TIMEOUT_SECS") {
            self.oracle_timeout_secs = parse_secs("PULSE_ORACLE_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("PULSE_TICK_INTERVAL_SECS") {
            self.tick_interval_secs = parse_secs("PULSE_TICK_INTERVAL_SECS", &secs)?;
        }
        Ok(())
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn build_oracle(&self) -> Arc<dyn FilterOracle> {
        match self.oracle {
            OracleKind::DepositStatus => Arc::new(DepositStatusOracle),
            OracleKind::VerdictFile => Arc::new(VerdictFileOracle::new(&self.state_dir)),
        }
    }

    pub fn build_escalation(&self) -> Arc<dyn EscalationChannel> {
        let mut channels: Vec<Arc<dyn EscalationChannel>> = vec![Arc::new(LogChannel)];
        if let Some(url) = &self.webhook_url {
            channels.push(Arc::new(WebhookChannel::new(url.clone())));
        }
        Arc::new(MultiChannel::new(channels))
    }

    /// Open the task pool store (`SURREALDB_URL`, else under `state_dir`).
    pub async fn open_pool(&self) -> Result<Arc<dyn TaskPool>> {
        let pool = SurrealTaskPool::from_env(&self.state_dir)
            .await
            .map_err(StorageError::from)?;
        Ok(Arc::new(pool))
    }

    /// Assemble a scheduler over the on-disk state directory.
    ///
    /// When another process holds the embedded pool store the scheduler
    /// runs without pool release. Any other pool failure is an error.
    pub async fn open_scheduler(&self) -> Result<Scheduler> {
        let fs = Arc::new(FsStore::new(&self.state_dir)?);
        let mut stores = Stores::from_fs(fs);
        if self.release_pool_tasks {
            match SurrealTaskPool::from_env(&self.state_dir).await {
                Ok(pool) => stores = stores.with_pool(Arc::new(pool)),
                Err(e @ StateError::Locked(_)) => {
                    warn!(error = %e, "task pool locked; pool tasks will not be released")
                }
                Err(e) => return Err(StorageError::from(e).into()),
            }
        }
        debug!(state_dir = %self.state_dir.display(), oracle = ?self.oracle, "scheduler configured");

        let spawner = Arc::new(CommandSpawner::new(
            self.state_dir.clone(),
            self.worker_command.clone(),
        ));
        Ok(Scheduler::new(stores, self.build_oracle(), spawner, self.build_escalation())
            .with_oracle_timeout(self.oracle_timeout()))
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| PulseError::Config(format!("{key} must be a whole number of seconds, got {value:?}")))
}
