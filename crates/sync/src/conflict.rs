//! Conflict and resolution types, and field-by-field conflict detection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use woolsync_common::{Amount, ConflictId, DeviceId, Timestamp};
use woolsync_kernel::{StateField, VersionedGameState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    ValueMismatch,
    ConcurrentModification,
    StructuralChange,
    TimestampSkew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// One detected divergence between the local and remote save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    pub id: ConflictId,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub path: String,
    pub local_value: Option<Value>,
    pub remote_value: Option<Value>,
    pub local_timestamp: Timestamp,
    pub remote_timestamp: Timestamp,
    pub local_device: DeviceId,
    pub remote_device: DeviceId,
    pub severity: Severity,
    pub auto_resolvable: bool,
}

/// One side's view of a path.
#[derive(Debug, Clone)]
pub struct Observed {
    pub value: Option<Value>,
    pub timestamp: Timestamp,
    pub device: DeviceId,
}

impl SyncConflict {
    /// Classify a difference at `path`. Returns `None` when the sides agree
    /// (numerically, for resources) or the path is not a game field.
    pub fn classify(path: &str, local: Observed, remote: Observed) -> Option<Self> {
        if local.value == remote.value {
            return None;
        }
        let (conflict_type, severity, auto_resolvable) = match StateField::of_path(path)? {
            StateField::Resources => match (parse_amount(&local.value), parse_amount(&remote.value)) {
                (Some(l), Some(r)) if l == r => return None,
                (Some(_), Some(_)) => (ConflictType::ValueMismatch, Severity::Low, true),
                _ => (ConflictType::ValueMismatch, Severity::Critical, false),
            },
            StateField::Buildings => (ConflictType::StructuralChange, Severity::Medium, false),
            StateField::Achievements | StateField::Upgrades => {
                (ConflictType::ConcurrentModification, Severity::Low, true)
            }
            StateField::Settings => (ConflictType::ValueMismatch, Severity::Low, true),
        };
        Some(Self::build(path, conflict_type, severity, auto_resolvable, local, remote))
    }

    /// A clock-skew conflict on `timestamp`. Never auto-resolvable, since
    /// last-write-wins cannot be trusted against a skewed clock.
    pub fn timestamp_skew(local: Observed, remote: Observed) -> Self {
        Self::build("timestamp", ConflictType::TimestampSkew, Severity::High, false, local, remote)
    }

    fn build(
        path: &str,
        conflict_type: ConflictType,
        severity: Severity,
        auto_resolvable: bool,
        local: Observed,
        remote: Observed,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            conflict_type,
            path: path.to_string(),
            local_value: local.value,
            remote_value: remote.value,
            local_timestamp: local.timestamp,
            remote_timestamp: remote.timestamp,
            local_device: local.device,
            remote_device: remote.device,
            severity,
            auto_resolvable,
        }
    }
}

/// Absent reads as zero; anything other than a decimal string is `None`.
fn parse_amount(value: &Option<Value>) -> Option<Amount> {
    match value {
        None => Some(Amount::zero()),
        Some(Value::String(raw)) => Amount::parse(raw).ok(),
        Some(_) => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    LastWriteWins,
    AdditiveMerge,
    ArrayMerge,
    /// A value supplied by the caller. As a table entry, forces the
    /// conflict to be escalated.
    Manual,
}

/// The outcome chosen for one conflict. `value: None` removes the entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub conflict_id: ConflictId,
    pub path: String,
    pub strategy: ResolutionStrategy,
    pub value: Option<Value>,
    pub reason: String,
    pub automatic: bool,
}

impl Resolution {
    /// A caller decision for `path`. The conflict id is filled in when the
    /// engine matches it against a freshly detected conflict.
    pub fn manual(path: impl Into<String>, value: Option<Value>, reason: impl Into<String>) -> Self {
        Self {
            conflict_id: ConflictId::nil(),
            path: path.into(),
            strategy: ResolutionStrategy::Manual,
            value,
            reason: reason.into(),
            automatic: false,
        }
    }
}

/// Field-by-field differences between `local` and `remote`, in canonical
/// order: resources, buildings, achievements, upgrades, settings, then
/// clock skew. Keys are sorted within each field.
///
/// A side whose timestamp is more than `max_clock_skew_ms` ahead of `now`
/// produces a timestamp-skew conflict.
pub fn detect_conflicts(
    local: &VersionedGameState,
    remote: &VersionedGameState,
    now: Timestamp,
    max_clock_skew_ms: u64,
) -> Vec<SyncConflict> {
    let mut conflicts = Vec::new();
    let observe = |state: &VersionedGameState, value: Option<Value>| Observed {
        value,
        timestamp: state.timestamp,
        device: state.device_id.clone(),
    };
    let mut push = |path: String, l: Option<Value>, r: Option<Value>| {
        if let Some(c) = SyncConflict::classify(&path, observe(local, l), observe(remote, r)) {
            conflicts.push(c);
        }
    };

    let keys: BTreeSet<&String> = local.resources.keys().chain(remote.resources.keys()).collect();
    for key in keys {
        push(
            StateField::Resources.entry_path(key),
            local.resources.get(key).map(|v| Value::String(v.clone())),
            remote.resources.get(key).map(|v| Value::String(v.clone())),
        );
    }

    let keys: BTreeSet<&String> = local.buildings.keys().chain(remote.buildings.keys()).collect();
    for key in keys {
        push(
            StateField::Buildings.entry_path(key),
            local.buildings.get(key).and_then(|b| serde_json::to_value(b).ok()),
            remote.buildings.get(key).and_then(|b| serde_json::to_value(b).ok()),
        );
    }

    push(
        StateField::Achievements.key().to_string(),
        Some(set_value(&local.achievements)),
        Some(set_value(&remote.achievements)),
    );
    push(
        StateField::Upgrades.key().to_string(),
        Some(set_value(&local.upgrades)),
        Some(set_value(&remote.upgrades)),
    );

    let keys: BTreeSet<&String> = local.settings.keys().chain(remote.settings.keys()).collect();
    for key in keys {
        push(
            StateField::Settings.entry_path(key),
            local.settings.get(key).cloned(),
            remote.settings.get(key).cloned(),
        );
    }

    if let Some(skew) = skew_conflict(
        observe(local, Some(Value::from(local.timestamp))),
        observe(remote, Some(Value::from(remote.timestamp))),
        now,
        max_clock_skew_ms,
    ) {
        conflicts.push(skew);
    }
    conflicts
}

/// A timestamp-skew conflict when either side claims a time too far past
/// `now`.
pub fn skew_conflict(
    local: Observed,
    remote: Observed,
    now: Timestamp,
    max_clock_skew_ms: u64,
) -> Option<SyncConflict> {
    let limit = now.saturating_add(max_clock_skew_ms);
    if local.timestamp > limit || remote.timestamp > limit {
        Some(SyncConflict::timestamp_skew(local, remote))
    } else {
        None
    }
}

fn set_value(set: &BTreeSet<String>) -> Value {
    Value::Array(set.iter().cloned().map(Value::String).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local() -> VersionedGameState {
        VersionedGameState::new(DeviceId::new("laptop"), 100)
            .with_resource("wool", "100")
            .with_building("barn", 3, true)
            .with_achievement("A")
            .with_achievement("B")
    }

    fn remote() -> VersionedGameState {
        VersionedGameState::new(DeviceId::new("phone"), 50)
            .with_resource("wool", "50")
            .with_building("barn", 2, true)
            .with_achievement("B")
            .with_achievement("C")
    }

    #[test]
    fn detection_follows_field_order() {
        let conflicts = detect_conflicts(&local(), &remote(), 1_000, 300_000);
        let paths: Vec<&str> = conflicts.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["resources.wool", "buildings.barn", "achievements"]);
    }

    #[test]
    fn building_difference_is_medium_and_manual() {
        let conflicts = detect_conflicts(&local(), &remote(), 1_000, 300_000);
        let barn = &conflicts[1];
        assert_eq!(barn.conflict_type, ConflictType::StructuralChange);
        assert_eq!(barn.severity, Severity::Medium);
        assert!(!barn.auto_resolvable);
        assert_eq!(barn.local_timestamp, 100);
        assert_eq!(barn.remote_timestamp, 50);
        assert_eq!(barn.local_value, Some(json!({"level": 3, "unlocked": true})));
    }

    #[test]
    fn resources_are_compared_numerically() {
        let l = local().with_resource("wool", "1.50");
        let r = local().with_resource("wool", "1.5");
        assert!(detect_conflicts(&l, &r, 1_000, 300_000).is_empty());

        let r = local().with_resource("wool", "not-a-number");
        let conflicts = detect_conflicts(&l, &r, 1_000, 300_000);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].severity, Severity::Critical);
        assert!(!conflicts[0].auto_resolvable);
    }

    #[test]
    fn settings_and_upgrades_are_auto_resolvable() {
        let l = local().with_setting("volume", json!(0.5)).with_upgrade("shears");
        let r = local().with_setting("volume", json!(0.8));
        let conflicts = detect_conflicts(&l, &r, 1_000, 300_000);
        let kinds: Vec<(&str, ConflictType)> = conflicts
            .iter()
            .map(|c| (c.path.as_str(), c.conflict_type))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("upgrades", ConflictType::ConcurrentModification),
                ("settings.volume", ConflictType::ValueMismatch),
            ]
        );
        assert!(conflicts.iter().all(|c| c.auto_resolvable));
    }

    #[test]
    fn future_timestamp_raises_skew() {
        let r = remote().at(2_000_000);
        let conflicts = detect_conflicts(&local(), &r, 1_000, 300_000);
        let skew = conflicts.last().unwrap();
        assert_eq!(skew.conflict_type, ConflictType::TimestampSkew);
        assert_eq!(skew.severity, Severity::High);
        assert!(!skew.auto_resolvable);
    }

    #[test]
    fn identical_states_have_no_conflicts() {
        assert!(detect_conflicts(&local(), &local().at(7), 1_000, 300_000).is_empty());
    }

    #[test]
    fn conflict_wire_shape_is_camel_case() {
        let conflicts = detect_conflicts(&local(), &remote(), 1_000, 300_000);
        let wire = serde_json::to_value(&conflicts[0]).unwrap();
        assert_eq!(wire["type"], "value-mismatch");
        assert_eq!(wire["severity"], "low");
        assert_eq!(wire["autoResolvable"], true);
        assert_eq!(wire["localDevice"], "laptop");
    }
}
