//! Three-way merge of game states against their nearest common ancestor.
//!
//! - Resources merge arithmetically: `source + target - base`, so progress
//!   made on both lines adds up. A sum below zero is a conflict.
//! - Sets keep everything either side added and drop what either side
//!   removed without the other re-adding it.
//! - Buildings and settings take one-sided changes; two different changes to
//!   the same key are surfaced as a [`MergeConflict`] with no resolution.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use woolsync_common::Amount;
use woolsync_kernel::{StateField, VersionedGameState};

/// A key both sides changed in incompatible ways.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeConflict {
    pub path: String,
    pub field: StateField,
    pub base: Option<Value>,
    pub source: Option<Value>,
    pub target: Option<Value>,
}

/// Merged state (built on top of `target`) plus any unresolved conflicts.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub state: VersionedGameState,
    pub conflicts: Vec<MergeConflict>,
}

/// Merge `source` into `target` using `base` as the comparison baseline.
///
/// The result keeps `target`'s identity fields and is sealed. When conflicts
/// are reported the conflicting keys hold `target`'s value.
pub fn three_way_merge(
    base: &VersionedGameState,
    source: &VersionedGameState,
    target: &VersionedGameState,
) -> MergeOutcome {
    let mut conflicts = Vec::new();
    let mut state = target.clone();

    state.resources = merge_resources(base, source, target, &mut conflicts);
    state.buildings = merge_keyed(
        StateField::Buildings,
        &base.buildings,
        &source.buildings,
        &target.buildings,
        &mut conflicts,
    );
    state.achievements = merge_sets(&base.achievements, &source.achievements, &target.achievements);
    state.upgrades = merge_sets(&base.upgrades, &source.upgrades, &target.upgrades);
    state.settings = merge_keyed(
        StateField::Settings,
        &base.settings,
        &source.settings,
        &target.settings,
        &mut conflicts,
    );
    state.seal();

    MergeOutcome { state, conflicts }
}

fn merge_resources(
    base: &VersionedGameState,
    source: &VersionedGameState,
    target: &VersionedGameState,
    conflicts: &mut Vec<MergeConflict>,
) -> BTreeMap<String, String> {
    let keys: BTreeSet<&String> = base
        .resources
        .keys()
        .chain(source.resources.keys())
        .chain(target.resources.keys())
        .collect();

    let mut out = BTreeMap::new();
    for key in keys {
        let b = base.resources.get(key);
        let s = source.resources.get(key);
        let t = target.resources.get(key);

        let merged = if s == t || s == b {
            t.cloned()
        } else if t == b {
            s.cloned()
        } else {
            let combined = match (s, t) {
                (Some(s), Some(t)) => combine_amounts(b, s, t),
                _ => None,
            };
            if combined.is_none() {
                conflicts.push(MergeConflict {
                    path: StateField::Resources.entry_path(key),
                    field: StateField::Resources,
                    base: b.map(|v| Value::String(v.clone())),
                    source: s.map(|v| Value::String(v.clone())),
                    target: t.map(|v| Value::String(v.clone())),
                });
            }
            combined.or_else(|| t.cloned())
        };
        if let Some(value) = merged {
            out.insert(key.clone(), value);
        }
    }
    out
}

/// `source + target - base`, or `None` when any side is not a decimal or
/// both sides spent more than the base held.
fn combine_amounts(base: Option<&String>, source: &str, target: &str) -> Option<String> {
    let b = match base {
        Some(raw) => Amount::parse(raw).ok()?,
        None => Amount::zero(),
    };
    let s = Amount::parse(source).ok()?;
    let t = Amount::parse(target).ok()?;
    let combined = s.plus(&t).minus(&b);
    if combined.is_negative() {
        return None;
    }
    Some(combined.to_string())
}

fn merge_sets(
    base: &BTreeSet<String>,
    source: &BTreeSet<String>,
    target: &BTreeSet<String>,
) -> BTreeSet<String> {
    let kept: BTreeSet<String> = source.intersection(target).cloned().collect();
    let added_source = source.difference(base).cloned();
    let added_target = target.difference(base).cloned();
    kept.into_iter().chain(added_source).chain(added_target).collect()
}

fn merge_keyed<V: Clone + PartialEq + Serialize>(
    field: StateField,
    base: &BTreeMap<String, V>,
    source: &BTreeMap<String, V>,
    target: &BTreeMap<String, V>,
    conflicts: &mut Vec<MergeConflict>,
) -> BTreeMap<String, V> {
    let keys: BTreeSet<&String> = base.keys().chain(source.keys()).chain(target.keys()).collect();
    let mut out = BTreeMap::new();
    for key in keys {
        let b = base.get(key);
        let s = source.get(key);
        let t = target.get(key);
        let merged = if s == t || s == b {
            t
        } else if t == b {
            s
        } else {
            conflicts.push(MergeConflict {
                path: field.entry_path(key),
                field,
                base: b.and_then(to_json),
                source: s.and_then(to_json),
                target: t.and_then(to_json),
            });
            t
        };
        if let Some(value) = merged {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}

fn to_json<V: Serialize>(value: &V) -> Option<Value> {
    serde_json::to_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use woolsync_common::DeviceId;

    fn base() -> VersionedGameState {
        VersionedGameState::new(DeviceId::new("pc"), 10)
            .with_resource("wool", "0")
            .with_building("barn", 1, true)
            .with_achievement("a")
            .with_achievement("b")
    }

    #[test]
    fn resources_add_progress_from_both_sides() {
        let source = base().with_resource("wool", "100");
        let target = base().with_resource("wool", "50");
        let out = three_way_merge(&base(), &source, &target);
        assert!(out.conflicts.is_empty());
        assert_eq!(out.state.resources["wool"], "150");
    }

    #[test]
    fn overspent_resource_is_a_conflict() {
        let b = base().with_resource("wool", "100");
        let source = b.clone().with_resource("wool", "30");
        let target = b.clone().with_resource("wool", "20");
        let out = three_way_merge(&b, &source, &target);
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.conflicts[0].path, "resources.wool");
        assert_eq!(out.state.resources["wool"], "20");
    }

    #[test]
    fn resources_subtract_shared_base() {
        let b = base().with_resource("wool", "10");
        let source = b.clone().with_resource("wool", "15");
        let target = b.clone().with_resource("wool", "12.5");
        let out = three_way_merge(&b, &source, &target);
        assert_eq!(out.state.resources["wool"], "17.5");
    }

    #[test]
    fn one_sided_change_wins() {
        let source = base().with_building("barn", 4, true);
        let out = three_way_merge(&base(), &source, &base());
        assert!(out.conflicts.is_empty());
        assert_eq!(out.state.buildings["barn"].level, 4);
    }

    #[test]
    fn both_sides_changing_a_building_conflicts() {
        let source = base().with_building("barn", 4, true);
        let target = base().with_building("barn", 2, true);
        let out = three_way_merge(&base(), &source, &target);
        assert_eq!(out.conflicts.len(), 1);
        let conflict = &out.conflicts[0];
        assert_eq!(conflict.path, "buildings.barn");
        assert_eq!(conflict.field, StateField::Buildings);
        assert_eq!(conflict.source.as_ref().unwrap()["level"], 4);
        assert_eq!(conflict.target.as_ref().unwrap()["level"], 2);
    }

    #[test]
    fn sets_keep_additions_and_removals() {
        let mut source = base().with_achievement("c");
        source.achievements.remove("a");
        let source = source.sealed();
        let target = base().with_achievement("d");
        let out = three_way_merge(&base(), &source, &target);
        let merged: Vec<&str> = out.state.achievements.iter().map(String::as_str).collect();
        assert_eq!(merged, vec!["b", "c", "d"]);
    }

    #[test]
    fn deleted_versus_changed_resource_conflicts() {
        let mut source = base();
        source.resources.remove("wool");
        let source = source.sealed();
        let target = base().with_resource("wool", "5");
        let out = three_way_merge(&base(), &source, &target);
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.conflicts[0].path, "resources.wool");
        assert_eq!(out.state.resources["wool"], "5");
    }

    #[test]
    fn merged_state_is_sealed_with_target_identity() {
        let target = base().at(99);
        let out = three_way_merge(&base(), &base(), &target);
        assert!(out.state.verify());
        assert_eq!(out.state.timestamp, 99);
    }
}
