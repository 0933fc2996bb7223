//! Build model: waves, streams, drops and recovery configuration.
//!
//! A plan is authored as JSON:
//!
//! ```text
//! {
//!   "waves":    { "W1": ["D1.1", "D1.2", "D2.1"], "W2": [...] },
//!   "drops":    { "D1.1": { "name": ..., "stream": "S1", "order": 1, ... } },
//!   "recovery": { "max_auto_retries": 2, "dead_threshold_seconds": 900, ... }
//! }
//! ```
//!
//! Wave position is the order in which waves appear in the document.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::domain::error::Result;

pub type DropId = String;

/// How a ready drop is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    #[default]
    Auto,
    Manual,
}

/// One schedulable unit of work.
///
/// Runtime fields an authored plan may carry (`status`, `retry_count`) are
/// ignored on load; runtime state lives in the build view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropSpec {
    pub name: String,
    /// Instructions handed to the worker and to the filter.
    #[serde(default)]
    pub brief: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    /// 1-based position within the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    #[serde(default)]
    pub depends_on: Vec<DropId>,
    #[serde(default)]
    pub spawn_mode: SpawnMode,
    #[serde(default = "default_blocking")]
    pub blocking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis_group: Option<String>,
}

fn default_blocking() -> bool {
    true
}

impl DropSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            brief: String::new(),
            stream: None,
            order: None,
            depends_on: Vec::new(),
            spawn_mode: SpawnMode::Auto,
            blocking: true,
            hypothesis_group: None,
        }
    }

    pub fn with_brief(mut self, brief: impl Into<String>) -> Self {
        self.brief = brief.into();
        self
    }

    pub fn in_stream(mut self, stream: impl Into<String>, order: i64) -> Self {
        self.stream = Some(stream.into());
        self.order = Some(order);
        self
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn manual(mut self) -> Self {
        self.spawn_mode = SpawnMode::Manual;
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.hypothesis_group = Some(group.into());
        self
    }
}

/// Retry and watchdog thresholds.
///
/// Signed so that negative authored values surface as validation
/// violations instead of parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_auto_retries: i64,
    pub dead_threshold_seconds: i64,
    pub stale_threshold_hours: i64,
    pub stale_no_progress_minutes: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_auto_retries: 2,
            dead_threshold_seconds: 900,
            stale_threshold_hours: 6,
            stale_no_progress_minutes: 60,
        }
    }
}

impl RecoveryConfig {
    /// Values past `u32::MAX` saturate. Negative values mean no retries.
    pub fn max_retries(&self) -> u32 {
        if self.max_auto_retries < 0 {
            return 0;
        }
        u32::try_from(self.max_auto_retries).unwrap_or(u32::MAX)
    }

    pub fn dead_threshold(&self) -> chrono::Duration {
        saturate(chrono::Duration::try_seconds(self.dead_threshold_seconds.max(0)))
    }

    pub fn stale_threshold(&self) -> chrono::Duration {
        saturate(chrono::Duration::try_hours(self.stale_threshold_hours.max(0)))
    }

    pub fn stale_no_progress(&self) -> chrono::Duration {
        saturate(chrono::Duration::try_minutes(self.stale_no_progress_minutes.max(0)))
    }
}

fn saturate(d: Option<chrono::Duration>) -> chrono::Duration {
    d.unwrap_or(chrono::TimeDelta::MAX)
}

/// A hard-barrier execution group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wave {
    pub id: String,
    /// 0-based position in the plan.
    pub position: usize,
    pub drops: Vec<DropId>,
}

/// A complete, authored build plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildPlan {
    #[serde(default)]
    pub id: String,
    #[serde(with = "ordered_waves", default)]
    pub waves: Vec<Wave>,
    #[serde(default)]
    pub drops: BTreeMap<DropId, DropSpec>,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl BuildPlan {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            waves: Vec::new(),
            drops: BTreeMap::new(),
            recovery: RecoveryConfig::default(),
        }
    }

    /// Append a wave. Position follows insertion order.
    pub fn add_wave(&mut self, id: impl Into<String>, drops: &[&str]) -> &mut Self {
        let position = self.waves.len();
        self.waves.push(Wave {
            id: id.into(),
            position,
            drops: drops.iter().map(|d| d.to_string()).collect(),
        });
        self
    }

    pub fn add_drop(&mut self, id: impl Into<String>, spec: DropSpec) -> &mut Self {
        self.drops.insert(id.into(), spec);
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a plan file. A missing `id` defaults to the file stem.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut plan = Self::from_json_str(&text)?;
        if plan.id.is_empty() {
            plan.id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("build")
                .to_string();
        }
        Ok(plan)
    }

    pub fn drop_spec(&self, drop_id: &str) -> Option<&DropSpec> {
        self.drops.get(drop_id)
    }

    pub fn wave(&self, position: usize) -> Option<&Wave> {
        self.waves.get(position)
    }

    /// Position of the first wave listing `drop_id`.
    pub fn wave_of(&self, drop_id: &str) -> Option<usize> {
        self.waves
            .iter()
            .position(|w| w.drops.iter().any(|d| d == drop_id))
    }

    /// Drop that precedes `drop_id` in its stream, if any.
    pub fn stream_predecessor(&self, drop_id: &str) -> Option<&str> {
        let spec = self.drops.get(drop_id)?;
        let stream = spec.stream.as_deref()?;
        let order = spec.order?;
        let wave = self.wave_of(drop_id)?;
        self.waves[wave].drops.iter().find_map(|other| {
            let o = self.drops.get(other)?;
            (o.stream.as_deref() == Some(stream) && o.order == Some(order - 1))
                .then_some(other.as_str())
        })
    }

    /// Members of a hypothesis group in drop-id order.
    pub fn group_members(&self, group: &str) -> Vec<&str> {
        self.drops
            .iter()
            .filter(|(_, spec)| spec.hypothesis_group.as_deref() == Some(group))
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Serde for `waves` as a JSON object whose key order is the wave order.
///
/// Visits entries in document order and keeps duplicate keys so that
/// validation can report them.
mod ordered_waves {
    use super::*;

    pub fn serialize<S: Serializer>(waves: &[Wave], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(waves.len()))?;
        for wave in waves {
            map.serialize_entry(&wave.id, &wave.drops)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<Wave>, D::Error> {
        deserializer.deserialize_map(WavesVisitor)
    }

    struct WavesVisitor;

    impl<'de> Visitor<'de> for WavesVisitor {
        type Value = Vec<Wave>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an object mapping wave ids to drop id lists")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Self::Value, A::Error> {
            let mut waves = Vec::new();
            while let Some((id, drops)) = access.next_entry::<String, Vec<DropId>>()? {
                let position = waves.len();
                waves.push(Wave { id, position, drops });
            }
            Ok(waves)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"{
        "waves": { "W2": ["c"], "W1": ["a", "b"] },
        "active_wave": "W2",
        "drops": {
            "a": { "name": "A", "stream": "S1", "order": 1, "status": "complete", "retry_count": 3 },
            "b": { "name": "B", "stream": "S1", "order": 2, "spawn_mode": "manual" },
            "c": { "name": "C", "depends_on": ["a"], "blocking": false }
        },
        "recovery": { "max_auto_retries": 1 }
    }"#;

    #[test]
    fn waves_keep_document_order() {
        let plan = BuildPlan::from_json_str(PLAN).unwrap();
        let ids: Vec<&str> = plan.waves.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["W2", "W1"]);
        assert_eq!(plan.waves[1].position, 1);
        assert_eq!(plan.wave_of("a"), Some(1));
    }

    #[test]
    fn drop_defaults_and_ignored_runtime_fields() {
        let plan = BuildPlan::from_json_str(PLAN).unwrap();
        let a = plan.drop_spec("a").unwrap();
        assert!(a.blocking);
        assert_eq!(a.spawn_mode, SpawnMode::Auto);
        assert_eq!(plan.drop_spec("b").unwrap().spawn_mode, SpawnMode::Manual);
        assert!(!plan.drop_spec("c").unwrap().blocking);
        assert_eq!(plan.recovery.max_auto_retries, 1);
        assert_eq!(plan.recovery.dead_threshold_seconds, 900);
    }

    #[test]
    fn duplicate_wave_keys_are_preserved() {
        let plan =
            BuildPlan::from_json_str(r#"{"waves": {"W1": ["a"], "W1": ["b"]}, "drops": {}}"#)
                .unwrap();
        assert_eq!(plan.waves.len(), 2);
    }

    #[test]
    fn stream_predecessor_lookup() {
        let plan = BuildPlan::from_json_str(PLAN).unwrap();
        assert_eq!(plan.stream_predecessor("b"), Some("a"));
        assert_eq!(plan.stream_predecessor("a"), None);
        assert_eq!(plan.stream_predecessor("c"), None);
    }

    #[test]
    fn serialize_keeps_wave_order() {
        let mut plan = BuildPlan::new("p");
        plan.add_wave("second", &["x"]).add_wave("first", &["y"]);
        let text = serde_json::to_string(&plan).unwrap();
        let reparsed = BuildPlan::from_json_str(&text).unwrap();
        assert_eq!(reparsed.waves[0].id, "second");
    }

    #[test]
    fn from_file_defaults_id_to_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nightly.json");
        std::fs::write(&path, PLAN).unwrap();
        let plan = BuildPlan::from_file(&path).unwrap();
        assert_eq!(plan.id, "nightly");
    }

    #[test]
    fn oversized_thresholds_saturate_instead_of_panicking() {
        let cfg = RecoveryConfig {
            max_auto_retries: i64::MAX,
            dead_threshold_seconds: i64::MAX,
            stale_threshold_hours: i64::MAX / 2,
            stale_no_progress_minutes: i64::MAX,
        };
        assert_eq!(cfg.max_retries(), u32::MAX);
        assert_eq!(cfg.dead_threshold(), chrono::TimeDelta::MAX);
        assert_eq!(cfg.stale_threshold(), chrono::TimeDelta::MAX);
        assert_eq!(cfg.stale_no_progress(), chrono::TimeDelta::MAX);

        let defaults = RecoveryConfig::default();
        assert_eq!(defaults.max_retries(), 2);
        assert_eq!(defaults.stale_threshold(), chrono::Duration::hours(6));
    }
}
