//! Worker spawning.
//!
//! Workers are opaque: once spawned, the scheduler never polls them and
//! only looks for their deposit. [`CommandSpawner`] starts a configured
//! command per drop without waiting for it.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use pulse_state::BuildId;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Everything a worker needs to start one attempt of a drop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub build_id: BuildId,
    pub drop_id: String,
    pub name: String,
    pub brief: String,
    pub attempt: u32,
    /// Why the previous attempt was retried.
    pub retry_context: Option<String>,
}

impl SpawnRequest {
    /// Brief text handed to the worker, including retry context.
    pub fn full_brief(&self) -> String {
        let mut out = format!("# {}\n\n{}\n", self.name, self.brief);
        if let Some(context) = &self.retry_context {
            out.push_str(&format!(
                "\n## Retry (attempt {})\n\n\
                 A previous attempt did not finish: {context}\n\
                 That attempt may still complete; its output must be disregarded. \
                 Write a fresh deposit for this attempt.\n",
                self.attempt
            ));
        }
        out
    }
}

/// Proof that a worker was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnReceipt {
    pub id: String,
    pub pid: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("no worker command configured")]
    NotConfigured,

    #[error("failed to launch worker: {0}")]
    Launch(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Start an automatic worker. Must not wait for it to finish.
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnReceipt, SpawnError>;

    /// Write a launcher a human can run for a manual drop.
    async fn materialize_launcher(&self, request: &SpawnRequest) -> Result<PathBuf, SpawnError>;
}

/// Spawns `command` with the drop's context in the environment.
///
/// Files under `<root>/builds/<build>/`:
/// `briefs/<drop>-<attempt>.md`, `logs/<drop>-<attempt>.log`,
/// `launchers/<drop>.sh`.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    root: PathBuf,
    command: Vec<String>,
}

impl CommandSpawner {
    pub fn new(state_dir: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            root: state_dir.into(),
            command,
        }
    }

    fn build_dir(&self, build: &BuildId) -> PathBuf {
        self.root.join("builds").join(build.as_str())
    }

    fn brief_path(&self, req: &SpawnRequest) -> PathBuf {
        self.build_dir(&req.build_id)
            .join("briefs")
            .join(format!("{}-{}.md", req.drop_id, req.attempt))
    }

    fn deposit_path(&self, req: &SpawnRequest) -> PathBuf {
        self.build_dir(&req.build_id)
            .join("deposits")
            .join(format!("{}.json", req.drop_id))
    }

    fn env(&self, req: &SpawnRequest, brief: &Path) -> Vec<(&'static str, String)> {
        vec![
            ("PULSE_BUILD", req.build_id.to_string()),
            ("PULSE_DROP", req.drop_id.clone()),
            ("PULSE_ATTEMPT", req.attempt.to_string()),
            ("PULSE_BRIEF", brief.display().to_string()),
            ("PULSE_DEPOSIT", self.deposit_path(req).display().to_string()),
        ]
    }

    fn write_brief(&self, req: &SpawnRequest) -> Result<PathBuf, SpawnError> {
        let path = self.brief_path(req);
        write_atomic(&path, req.full_brief().as_bytes())?;
        Ok(path)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SpawnError> {
    let dir = path
        .parent()
        .ok_or_else(|| SpawnError::Launch(format!("no parent for {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| SpawnError::Io(e.error))?;
    Ok(())
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[async_trait]
impl WorkerSpawner for CommandSpawner {
    async fn spawn(&self, req: &SpawnRequest) -> Result<SpawnReceipt, SpawnError> {
        let (program, args) = self.command.split_first().ok_or(SpawnError::NotConfigured)?;
        let brief = self.write_brief(req)?;

        let log_path = self
            .build_dir(&req.build_id)
            .join("logs")
            .join(format!("{}-{}.log", req.drop_id, req.attempt));
        if let Some(dir) = log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let log = std::fs::File::create(&log_path)?;
        let log_err = log.try_clone()?;

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .envs(self.env(req, &brief))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| SpawnError::Launch(format!("{program}: {e}")))?;

        let pid = child.id();
        let receipt = SpawnReceipt {
            id: format!("{}:{}:{}", req.build_id, req.drop_id, req.attempt),
            pid,
        };

        // Reap in the background; the tick never waits on a worker.
        let drop_id = req.drop_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(drop_id = %drop_id, %status, "worker exited"),
                Err(e) => warn!(drop_id = %drop_id, error = %e, "worker wait failed"),
            }
        });

        Ok(receipt)
    }

    async fn materialize_launcher(&self, req: &SpawnRequest) -> Result<PathBuf, SpawnError> {
        let brief = self.write_brief(req)?;
        let path = self
            .build_dir(&req.build_id)
            .join("launchers")
            .join(format!("{}.sh", req.drop_id));

        let mut script = String::from("#!/bin/sh\n");
        script.push_str(&format!("# {} (attempt {})\n", req.name, req.attempt));
        for (key, value) in self.env(req, &brief) {
            script.push_str(&format!("export {key}={}\n", shell_quote(&value)));
        }
        if self.command.is_empty() {
            script.push_str("cat \"$PULSE_BRIEF\"\n");
            script.push_str("echo \"write your deposit to $PULSE_DEPOSIT\"\n");
        } else {
            let argv: Vec<String> = self.command.iter().map(|a| shell_quote(a)).collect();
            script.push_str(&format!("exec {}\n", argv.join(" ")));
        }
        write_atomic(&path, script.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }

        Ok(path)
    }
}
