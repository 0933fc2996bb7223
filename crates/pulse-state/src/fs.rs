//! Filesystem-backed durable store.
//!
//! Layout under `<root>/builds/<build_id>/`:
//!
//! ```text
//! events.jsonl                      append-only build events
//! recovery.jsonl                    append-only recovery decisions
//! deposits/<drop>.json              current deposit (written once per attempt)
//! deposits/archive/<drop>/<n>.json  archived deposits, n = 1, 2, ...
//! deposits/archive/<drop>/<n>.unreadable  quarantined unparsable deposits
//! <name>.json                       documents (plan, state, summary)
//! ```
//!
//! Workers may write `deposits/<drop>.json` directly; the file is the
//! deposit protocol.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage_traits::*;

const EVENTS_FILE: &str = "events.jsonl";
const RECOVERY_FILE: &str = "recovery.jsonl";
const DEPOSITS_DIR: &str = "deposits";
const ARCHIVE_DIR: &str = "archive";

/// Reject identifiers that could escape the build directory.
pub fn validate_id(id: &str) -> StorageResult<()> {
    if id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0'])
    {
        return Err(StorageError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Durable local store for every per-build concern except the task pool.
pub struct FsStore {
    builds_dir: PathBuf,
    /// Serializes appends and archive moves within this process.
    write_lock: Mutex<()>,
}

impl FsStore {
    /// Open (and create) a store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let builds_dir = root.as_ref().join("builds");
        fs::create_dir_all(&builds_dir)?;
        Ok(Self {
            builds_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding one build's files.
    pub fn build_dir(&self, build: &BuildId) -> StorageResult<PathBuf> {
        validate_id(build.as_str())?;
        Ok(self.builds_dir.join(build.as_str()))
    }

    /// Path a worker writes its deposit to.
    pub fn deposit_path(&self, build: &BuildId, drop_id: &str) -> StorageResult<PathBuf> {
        validate_id(drop_id)?;
        Ok(self
            .build_dir(build)?
            .join(DEPOSITS_DIR)
            .join(format!("{drop_id}.json")))
    }

    fn archive_dir(&self, build: &BuildId, drop_id: &str) -> StorageResult<PathBuf> {
        validate_id(drop_id)?;
        Ok(self
            .build_dir(build)?
            .join(DEPOSITS_DIR)
            .join(ARCHIVE_DIR)
            .join(drop_id))
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| StorageError::Backend("fs store lock poisoned".to_string()))
    }

    fn append_line(path: &Path, value: &impl serde::Serialize) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    fn read_lines<T: serde::de::DeserializeOwned>(path: &Path) -> StorageResult<Vec<T>> {
        let file = match fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomic write: temp file in the same directory, then rename.
    fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::InvalidId(path.display().to_string()))?;
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn archived(&self, build: &BuildId, drop_id: &str) -> StorageResult<Vec<(u32, PathBuf)>> {
        let dir = self.archive_dir(build, drop_id)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut numbered = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let n = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok());
            if let Some(n) = n {
                numbered.push((n, path));
            }
        }
        numbered.sort_by_key(|(n, _)| *n);
        Ok(numbered)
    }
}

#[async_trait]
impl EventLog for FsStore {
    async fn append(
        &self,
        build: &BuildId,
        kind: &str,
        payload: serde_json::Value,
    ) -> StorageResult<u64> {
        let path = self.build_dir(build)?.join(EVENTS_FILE);
        let _guard = self.lock()?;
        let existing: Vec<EventRecord> = Self::read_lines(&path)?;
        let seq = existing.last().map(|e| e.seq + 1).unwrap_or(1);
        let record = EventRecord {
            seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        Self::append_line(&path, &record)?;
        debug!(build_id = %build, seq, kind, "event appended");
        Ok(seq)
    }

    async fn events(&self, build: &BuildId) -> StorageResult<Vec<EventRecord>> {
        let path = self.build_dir(build)?.join(EVENTS_FILE);
        Self::read_lines(&path)
    }

    async fn list_builds(&self) -> StorageResult<Vec<BuildId>> {
        let mut builds = Vec::new();
        for entry in fs::read_dir(&self.builds_dir)? {
            let entry = entry?;
            if !entry.path().join(EVENTS_FILE).exists() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                builds.push(BuildId::new(name));
            }
        }
        builds.sort();
        Ok(builds)
    }
}

#[async_trait]
impl DepositStore for FsStore {
    async fn write(&self, build: &BuildId, deposit: &DepositRecord) -> StorageResult<()> {
        let path = self.deposit_path(build, &deposit.drop_id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(deposit)?;
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::InvalidId(path.display().to_string()))?;
        // Fully written before it becomes visible; never replaces a deposit.
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_data()?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StorageError::DepositExists {
                    build_id: build.0.clone(),
                    drop_id: deposit.drop_id.clone(),
                })
            }
            Err(e) => Err(e.error.into()),
        }
    }

    async fn current(
        &self,
        build: &BuildId,
        drop_id: &str,
    ) -> StorageResult<Option<DepositRecord>> {
        Self::read_json(&self.deposit_path(build, drop_id)?)
    }

    async fn archive(&self, build: &BuildId, drop_id: &str) -> StorageResult<DepositRecord> {
        let current_path = self.deposit_path(build, drop_id)?;
        let _guard = self.lock()?;
        let deposit: DepositRecord =
            Self::read_json(&current_path)?.ok_or_else(|| StorageError::DepositNotFound {
                build_id: build.0.clone(),
                drop_id: drop_id.to_string(),
            })?;
        let next = self
            .archived(build, drop_id)?
            .last()
            .map(|(n, _)| n + 1)
            .unwrap_or(1);
        let dir = self.archive_dir(build, drop_id)?;
        fs::create_dir_all(&dir)?;
        fs::rename(&current_path, dir.join(format!("{next:04}.json")))?;
        debug!(build_id = %build, drop_id, archive_index = next, "deposit archived");
        Ok(deposit)
    }

    async fn history(&self, build: &BuildId, drop_id: &str) -> StorageResult<Vec<DepositRecord>> {
        let mut all = Vec::new();
        for (_, path) in self.archived(build, drop_id)? {
            if let Some(d) = Self::read_json(&path)? {
                all.push(d);
            }
        }
        if let Some(current) = self.current(build, drop_id).await? {
            all.push(current);
        }
        Ok(all)
    }

    async fn quarantine(&self, build: &BuildId, drop_id: &str) -> StorageResult<bool> {
        let current_path = self.deposit_path(build, drop_id)?;
        let _guard = self.lock()?;
        let dir = self.archive_dir(build, drop_id)?;
        fs::create_dir_all(&dir)?;
        let taken = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("unreadable"))
            .count();
        let target = dir.join(format!("{:04}.unreadable", taken + 1));
        match fs::rename(&current_path, &target) {
            Ok(()) => {
                warn!(
                    build_id = %build,
                    drop_id,
                    path = %target.display(),
                    "unreadable deposit quarantined"
                );
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RecoveryLog for FsStore {
    async fn append(&self, build: &BuildId, entry: &RecoveryLogEntry) -> StorageResult<()> {
        let path = self.build_dir(build)?.join(RECOVERY_FILE);
        let _guard = self.lock()?;
        Self::append_line(&path, entry)
    }

    async fn entries(&self, build: &BuildId) -> StorageResult<Vec<RecoveryLogEntry>> {
        Self::read_lines(&self.build_dir(build)?.join(RECOVERY_FILE))
    }
}

#[async_trait]
impl DocumentStore for FsStore {
    async fn put(
        &self,
        build: &BuildId,
        name: &str,
        doc: &serde_json::Value,
    ) -> StorageResult<()> {
        validate_id(name)?;
        let path = self.build_dir(build)?.join(format!("{name}.json"));
        let bytes = serde_json::to_vec_pretty(doc)?;
        Self::write_atomic(&path, &bytes)
    }

    async fn get(&self, build: &BuildId, name: &str) -> StorageResult<Option<serde_json::Value>> {
        validate_id(name)?;
        Self::read_json(&self.build_dir(build)?.join(format!("{name}.json")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn validate_id_rejects_traversal() {
        assert!(validate_id("wave-1.drop-2").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("..").is_err());
        assert!(validate_id("a/b").is_err());
    }

    #[tokio::test]
    async fn events_get_monotonic_seq_and_survive_reopen() {
        let (dir, store) = make_store();
        let build = BuildId::new("b1");
        let s1 = EventLog::append(&store, &build, "build_started", serde_json::json!({}))
            .await
            .unwrap();
        let s2 = EventLog::append(&store, &build, "drop_spawned", serde_json::json!({"d": 1}))
            .await
            .unwrap();
        assert_eq!((s1, s2), (1, 2));

        let reopened = FsStore::new(dir.path()).unwrap();
        let events = reopened.events(&build).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].kind, "drop_spawned");
        assert_eq!(reopened.list_builds().await.unwrap(), vec![build]);
    }

    #[tokio::test]
    async fn deposit_archive_keeps_numbered_history() {
        let (dir, store) = make_store();
        let build = BuildId::new("b1");
        let first = DepositRecord::new("d1", DepositStatus::Failed, "first");
        store.write(&build, &first).await.unwrap();

        let dup = store.write(&build, &first).await.unwrap_err();
        assert!(matches!(dup, StorageError::DepositExists { .. }));

        store.archive(&build, "d1").await.unwrap();
        assert!(store.current(&build, "d1").await.unwrap().is_none());

        let second = DepositRecord::new("d1", DepositStatus::Complete, "second");
        store.write(&build, &second).await.unwrap();

        let history = store.history(&build, "d1").await.unwrap();
        let summaries: Vec<_> = history.iter().map(|d| d.summary.as_str()).collect();
        assert_eq!(summaries, vec!["first", "second"]);
        assert!(dir
            .path()
            .join("builds/b1/deposits/archive/d1/0001.json")
            .exists());
    }

    #[tokio::test]
    async fn torn_deposit_is_quarantined_out_of_history() {
        let (dir, store) = make_store();
        let build = BuildId::new("b1");
        store
            .write(&build, &DepositRecord::new("d1", DepositStatus::Failed, "first"))
            .await
            .unwrap();
        store.archive(&build, "d1").await.unwrap();

        let path = store.deposit_path(&build, "d1").unwrap();
        std::fs::write(&path, br#"{"drop_id": "d1", "stat"#).unwrap();
        assert!(matches!(
            store.current(&build, "d1").await,
            Err(StorageError::Serialization(_))
        ));

        assert!(store.quarantine(&build, "d1").await.unwrap());
        assert!(!store.quarantine(&build, "d1").await.unwrap());
        assert!(store.current(&build, "d1").await.unwrap().is_none());
        assert!(dir
            .path()
            .join("builds/b1/deposits/archive/d1/0001.unreadable")
            .exists());

        let history = store.history(&build, "d1").await.unwrap();
        assert_eq!(history.len(), 1);
        store
            .write(&build, &DepositRecord::new("d1", DepositStatus::Complete, "retry"))
            .await
            .unwrap();
        store.archive(&build, "d1").await.unwrap();
        assert!(dir
            .path()
            .join("builds/b1/deposits/archive/d1/0002.json")
            .exists());
    }

    #[tokio::test]
    async fn documents_replace_atomically() {
        let (_dir, store) = make_store();
        let build = BuildId::new("b1");
        store
            .put(&build, "state", &serde_json::json!({"v": 1}))
            .await
            .unwrap();
        store
            .put(&build, "state", &serde_json::json!({"v": 2}))
            .await
            .unwrap();
        let doc = store.get(&build, "state").await.unwrap().unwrap();
        assert_eq!(doc["v"], 2);
        assert!(store.get(&build, "missing").await.unwrap().is_none());
    }
}
