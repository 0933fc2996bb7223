//! Plan validation.
//!
//! [`validate`] collects every violation in one pass so an author can fix
//! a plan without repeated round trips. [`ensure_valid`] turns a non-empty
//! report into [`PulseError::MalformedPlan`].

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::domain::error::{PulseError, Result};
use crate::domain::plan::BuildPlan;

/// One problem found in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    #[error("plan has no waves")]
    NoWaves,

    #[error("wave {wave_id} is defined more than once")]
    DuplicateWave { wave_id: String },

    #[error("wave {wave_id} lists unknown drop {drop_id}")]
    UnknownDropInWave { wave_id: String, drop_id: String },

    #[error("wave {wave_id} lists drop {drop_id} more than once")]
    DuplicateDropInWave { wave_id: String, drop_id: String },

    #[error("drop {drop_id} belongs to no wave")]
    UnassignedDrop { drop_id: String },

    #[error("drop {drop_id} belongs to several waves: {}", wave_ids.join(", "))]
    DropInMultipleWaves {
        drop_id: String,
        wave_ids: Vec<String>,
    },

    #[error("drop {drop_id} depends on missing drop {dependency}")]
    MissingDependency { drop_id: String, dependency: String },

    #[error("drop {drop_id} depends on itself")]
    SelfDependency { drop_id: String },

    #[error("dependency cycle among drops: {}", drop_ids.join(", "))]
    DependencyCycle { drop_ids: Vec<String> },

    #[error("drop {drop_id} depends on {dependency} in later wave {dependency_wave}")]
    ForwardDependency {
        drop_id: String,
        dependency: String,
        dependency_wave: String,
    },

    #[error("drop {drop_id} has a stream but no order")]
    StreamWithoutOrder { drop_id: String },

    #[error("drop {drop_id} has an order but no stream")]
    OrderWithoutStream { drop_id: String },

    #[error("stream {stream} in wave {wave_id} uses order {order} more than once")]
    DuplicateStreamOrder {
        wave_id: String,
        stream: String,
        order: i64,
    },

    #[error("stream {stream} in wave {wave_id} is not numbered 1..{expected_len}: found {found:?}")]
    NonContiguousStream {
        wave_id: String,
        stream: String,
        expected_len: usize,
        found: Vec<i64>,
    },

    #[error("hypothesis group {group} spans waves: {}", wave_ids.join(", "))]
    GroupSpansWaves { group: String, wave_ids: Vec<String> },

    #[error("recovery.{field} must be non-negative, got {value}")]
    NegativeConfig { field: String, value: i64 },

    #[error("recovery.{field} must be at most {max}, got {value}")]
    ConfigOutOfRange { field: String, value: i64, max: i64 },
}

/// Result of validating a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Check a plan for every structural problem.
pub fn validate(plan: &BuildPlan) -> ValidationReport {
    let mut violations = Vec::new();
    check_waves(plan, &mut violations);
    check_dependencies(plan, &mut violations);
    check_cycles(plan, &mut violations);
    check_streams(plan, &mut violations);
    check_groups(plan, &mut violations);
    check_config(plan, &mut violations);
    ValidationReport { violations }
}

/// Validate and fail with every violation listed.
pub fn ensure_valid(plan: &BuildPlan) -> Result<()> {
    let report = validate(plan);
    if report.is_valid() {
        Ok(())
    } else {
        Err(PulseError::MalformedPlan {
            violations: report.violations,
        })
    }
}

fn check_waves(plan: &BuildPlan, out: &mut Vec<Violation>) {
    if plan.waves.is_empty() {
        out.push(Violation::NoWaves);
    }

    let mut seen_waves = BTreeSet::new();
    for wave in &plan.waves {
        if !seen_waves.insert(wave.id.as_str()) {
            out.push(Violation::DuplicateWave {
                wave_id: wave.id.clone(),
            });
        }
    }

    let mut membership: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for wave in &plan.waves {
        let mut in_this_wave = BTreeSet::new();
        for drop_id in &wave.drops {
            if !plan.drops.contains_key(drop_id) {
                out.push(Violation::UnknownDropInWave {
                    wave_id: wave.id.clone(),
                    drop_id: drop_id.clone(),
                });
                continue;
            }
            if !in_this_wave.insert(drop_id.as_str()) {
                out.push(Violation::DuplicateDropInWave {
                    wave_id: wave.id.clone(),
                    drop_id: drop_id.clone(),
                });
                continue;
            }
            membership
                .entry(drop_id.as_str())
                .or_default()
                .push(wave.id.clone());
        }
    }

    for drop_id in plan.drops.keys() {
        match membership.get(drop_id.as_str()) {
            None => out.push(Violation::UnassignedDrop {
                drop_id: drop_id.clone(),
            }),
            Some(waves) if waves.len() > 1 => out.push(Violation::DropInMultipleWaves {
                drop_id: drop_id.clone(),
                wave_ids: waves.clone(),
            }),
            Some(_) => {}
        }
    }
}

fn check_dependencies(plan: &BuildPlan, out: &mut Vec<Violation>) {
    for (drop_id, spec) in &plan.drops {
        for dep in &spec.depends_on {
            if dep == drop_id {
                out.push(Violation::SelfDependency {
                    drop_id: drop_id.clone(),
                });
            } else if !plan.drops.contains_key(dep) {
                out.push(Violation::MissingDependency {
                    drop_id: drop_id.clone(),
                    dependency: dep.clone(),
                });
            } else if let (Some(own), Some(theirs)) = (plan.wave_of(drop_id), plan.wave_of(dep)) {
                if theirs > own {
                    out.push(Violation::ForwardDependency {
                        drop_id: drop_id.clone(),
                        dependency: dep.clone(),
                        dependency_wave: plan.waves[theirs].id.clone(),
                    });
                }
            }
        }
    }
}

/// Kahn's algorithm over existing, non-self edges. Both `depends_on` and
/// the implicit edge to a drop's stream predecessor count. Drops never
/// reaching in-degree zero sit on or behind a cycle.
fn check_cycles(plan: &BuildPlan, out: &mut Vec<Violation>) {
    let mut in_degree: HashMap<&str, usize> =
        plan.drops.keys().map(|id| (id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (drop_id, spec) in &plan.drops {
        let mut upstream: BTreeSet<&str> = spec
            .depends_on
            .iter()
            .map(String::as_str)
            .filter(|dep| *dep != drop_id && plan.drops.contains_key(*dep))
            .collect();
        if let Some(prev) = plan.stream_predecessor(drop_id) {
            upstream.insert(prev);
        }
        for dep in upstream {
            *in_degree.entry(drop_id.as_str()).or_default() += 1;
            dependents.entry(dep).or_default().push(drop_id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = plan
        .drops
        .keys()
        .map(String::as_str)
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();

    while let Some(id) = queue.pop_front() {
        if let Some(next) = dependents.get(id) {
            for &d in next {
                if let Some(deg) = in_degree.get_mut(d) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(d);
                    }
                }
            }
        }
    }

    let mut stuck: BTreeSet<&str> = in_degree
        .into_iter()
        .filter(|(_, deg)| *deg > 0)
        .map(|(id, _)| id)
        .collect();

    // Peel off drops that merely wait on a cycle: anything with no stuck
    // dependent cannot lie on one.
    loop {
        let leaves: Vec<&str> = stuck
            .iter()
            .copied()
            .filter(|id| {
                !dependents
                    .get(id)
                    .is_some_and(|ds| ds.iter().any(|d| stuck.contains(d)))
            })
            .collect();
        if leaves.is_empty() {
            break;
        }
        for leaf in leaves {
            stuck.remove(leaf);
        }
    }

    if !stuck.is_empty() {
        out.push(Violation::DependencyCycle {
            drop_ids: stuck.into_iter().map(str::to_string).collect(),
        });
    }
}

fn check_streams(plan: &BuildPlan, out: &mut Vec<Violation>) {
    for (drop_id, spec) in &plan.drops {
        match (&spec.stream, spec.order) {
            (Some(_), None) => out.push(Violation::StreamWithoutOrder {
                drop_id: drop_id.clone(),
            }),
            (None, Some(_)) => out.push(Violation::OrderWithoutStream {
                drop_id: drop_id.clone(),
            }),
            _ => {}
        }
    }

    for wave in &plan.waves {
        let mut streams: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
        let mut listed = BTreeSet::new();
        for drop_id in &wave.drops {
            if !listed.insert(drop_id.as_str()) {
                continue;
            }
            let Some(spec) = plan.drops.get(drop_id) else {
                continue;
            };
            if let (Some(stream), Some(order)) = (spec.stream.as_deref(), spec.order) {
                streams.entry(stream).or_default().push(order);
            }
        }

        for (stream, mut orders) in streams {
            orders.sort_unstable();
            let mut duplicated = BTreeSet::new();
            for pair in orders.windows(2) {
                if pair[0] == pair[1] {
                    duplicated.insert(pair[0]);
                }
            }
            for order in &duplicated {
                out.push(Violation::DuplicateStreamOrder {
                    wave_id: wave.id.clone(),
                    stream: stream.to_string(),
                    order: *order,
                });
            }
            let distinct: Vec<i64> = orders
                .iter()
                .copied()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let contiguous = distinct
                .iter()
                .enumerate()
                .all(|(i, o)| *o == i as i64 + 1);
            if !contiguous {
                out.push(Violation::NonContiguousStream {
                    wave_id: wave.id.clone(),
                    stream: stream.to_string(),
                    expected_len: distinct.len(),
                    found: distinct,
                });
            }
        }
    }
}

fn check_groups(plan: &BuildPlan, out: &mut Vec<Violation>) {
    let mut groups: BTreeMap<&str, BTreeSet<usize>> = BTreeMap::new();
    for (drop_id, spec) in &plan.drops {
        if let (Some(group), Some(wave)) = (spec.hypothesis_group.as_deref(), plan.wave_of(drop_id))
        {
            groups.entry(group).or_default().insert(wave);
        }
    }
    for (group, waves) in groups {
        if waves.len() > 1 {
            out.push(Violation::GroupSpansWaves {
                group: group.to_string(),
                wave_ids: waves.iter().map(|w| plan.waves[*w].id.clone()).collect(),
            });
        }
    }
}

fn check_config(plan: &BuildPlan, out: &mut Vec<Violation>) {
    let r = &plan.recovery;
    let longest = chrono::TimeDelta::MAX;
    for (field, value, max) in [
        ("max_auto_retries", r.max_auto_retries, i64::from(u32::MAX)),
        ("dead_threshold_seconds", r.dead_threshold_seconds, longest.num_seconds()),
        ("stale_threshold_hours", r.stale_threshold_hours, longest.num_hours()),
        ("stale_no_progress_minutes", r.stale_no_progress_minutes, longest.num_minutes()),
    ] {
        if value < 0 {
            out.push(Violation::NegativeConfig {
                field: field.to_string(),
                value,
            });
        } else if value > max {
            out.push(Violation::ConfigOutOfRange {
                field: field.to_string(),
                value,
                max,
            });
        }
    }
}
