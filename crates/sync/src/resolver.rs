//! Strategy-table conflict resolution.
//!
//! Rules are checked in order and the first whose pattern (and optional
//! conflict type) matches decides the strategy; anything unmatched falls
//! back to last-write-wins. Patterns are an exact path (`achievements`), a
//! field wildcard (`resources.*`) or `*`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use woolsync_common::Amount;

use crate::conflict::{ConflictType, Resolution, ResolutionStrategy, SyncConflict};

/// One row of the strategy table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyRule {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_type: Option<ConflictType>,
    pub strategy: ResolutionStrategy,
}

impl StrategyRule {
    pub fn new(pattern: &str, strategy: ResolutionStrategy) -> Self {
        Self {
            pattern: pattern.to_string(),
            conflict_type: None,
            strategy,
        }
    }

    pub fn for_type(mut self, conflict_type: ConflictType) -> Self {
        self.conflict_type = Some(conflict_type);
        self
    }

    pub fn matches(&self, conflict: &SyncConflict) -> bool {
        if self
            .conflict_type
            .is_some_and(|t| t != conflict.conflict_type)
        {
            return false;
        }
        pattern_matches(&self.pattern, &conflict.path)
    }
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(field) => path
            .strip_prefix(field)
            .is_some_and(|rest| rest.starts_with('.') && rest.len() > 1),
        None => pattern == path,
    }
}

/// The built-in table: resources add up, achievement and upgrade sets
/// union, everything else is last-write-wins.
pub fn default_rules() -> Vec<StrategyRule> {
    vec![
        StrategyRule::new("resources.*", ResolutionStrategy::AdditiveMerge)
            .for_type(ConflictType::ValueMismatch),
        StrategyRule::new("achievements", ResolutionStrategy::ArrayMerge),
        StrategyRule::new("upgrades", ResolutionStrategy::ArrayMerge),
    ]
}

/// Maps a conflict to a resolution. Pure and deterministic.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    rules: Vec<StrategyRule>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(default_rules())
    }
}

impl ConflictResolver {
    pub fn new(rules: Vec<StrategyRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[StrategyRule] {
        &self.rules
    }

    /// Strategy the table assigns to `conflict`.
    pub fn strategy_for(&self, conflict: &SyncConflict) -> ResolutionStrategy {
        self.rules
            .iter()
            .find(|rule| rule.matches(conflict))
            .map_or(ResolutionStrategy::LastWriteWins, |rule| rule.strategy)
    }

    /// Resolve `conflict` with its table strategy. Strategies that cannot
    /// handle the values (unparseable amounts, non-array sets, `manual`)
    /// fall back to last-write-wins and say so in `reason`.
    pub fn resolve(&self, conflict: &SyncConflict) -> Resolution {
        let strategy = self.strategy_for(conflict);
        let merged = match strategy {
            ResolutionStrategy::AdditiveMerge => additive_merge(conflict),
            ResolutionStrategy::ArrayMerge => array_merge(conflict),
            ResolutionStrategy::LastWriteWins | ResolutionStrategy::Manual => None,
        };
        let (strategy, value, reason) = match merged {
            Some((value, reason)) => (strategy, value, reason),
            None => {
                let (value, mut reason) = last_write_wins(conflict);
                if strategy != ResolutionStrategy::LastWriteWins {
                    reason = format!("{strategy:?} not applicable; {reason}");
                }
                (ResolutionStrategy::LastWriteWins, value, reason)
            }
        };
        tracing::debug!(path = %conflict.path, ?strategy, "conflict resolved");
        Resolution {
            conflict_id: conflict.id,
            path: conflict.path.clone(),
            strategy,
            value,
            reason,
            automatic: true,
        }
    }
}

/// Remote wins only with a strictly later timestamp.
fn last_write_wins(conflict: &SyncConflict) -> (Option<Value>, String) {
    if conflict.remote_timestamp > conflict.local_timestamp {
        (
            conflict.remote_value.clone(),
            format!(
                "remote write at {} is newer than local at {}",
                conflict.remote_timestamp, conflict.local_timestamp
            ),
        )
    } else {
        (
            conflict.local_value.clone(),
            format!(
                "local write at {} is not older than remote at {}",
                conflict.local_timestamp, conflict.remote_timestamp
            ),
        )
    }
}

fn amount_of(value: &Option<Value>) -> Option<Amount> {
    match value {
        None => Some(Amount::zero()),
        Some(Value::String(raw)) => Amount::parse(raw).ok(),
        Some(_) => None,
    }
}

fn additive_merge(conflict: &SyncConflict) -> Option<(Option<Value>, String)> {
    let local = amount_of(&conflict.local_value)?;
    let remote = amount_of(&conflict.remote_value)?;
    let sum = local.plus(&remote);
    let reason = format!("summed local {local} and remote {remote}");
    Some((Some(Value::String(sum.to_string())), reason))
}

fn array_merge(conflict: &SyncConflict) -> Option<(Option<Value>, String)> {
    let mut union = BTreeSet::new();
    for side in [&conflict.local_value, &conflict.remote_value] {
        match side {
            None => {}
            Some(Value::Array(items)) => {
                for item in items {
                    union.insert(item.as_str()?.to_string());
                }
            }
            Some(_) => return None,
        }
    }
    let reason = format!("union of {} distinct entries", union.len());
    Some((
        Some(Value::Array(union.into_iter().map(Value::String).collect())),
        reason,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{Observed, Severity};
    use serde_json::json;
    use woolsync_common::{DeviceId, Timestamp};

    fn conflict(path: &str, l: Value, lt: Timestamp, r: Value, rt: Timestamp) -> SyncConflict {
        SyncConflict::classify(
            path,
            Observed {
                value: Some(l),
                timestamp: lt,
                device: DeviceId::new("a"),
            },
            Observed {
                value: Some(r),
                timestamp: rt,
                device: DeviceId::new("b"),
            },
        )
        .unwrap()
    }

    #[test]
    fn additive_merge_sums_exactly() {
        let c = conflict("resources.wool", json!("100"), 1, json!("50"), 2);
        let r = ConflictResolver::default().resolve(&c);
        assert_eq!(r.strategy, ResolutionStrategy::AdditiveMerge);
        assert_eq!(r.value, Some(json!("150")));
        assert!(r.automatic);
        assert_eq!(r.conflict_id, c.id);

        let c = conflict("resources.gold", json!("0.1"), 1, json!("0.2"), 2);
        let r = ConflictResolver::default().resolve(&c);
        assert_eq!(r.value, Some(json!("0.3")));
    }

    #[test]
    fn unparseable_amount_falls_back_to_last_write_wins() {
        let c = conflict("resources.wool", json!("12"), 1, json!("lots"), 2);
        assert_eq!(c.severity, Severity::Critical);
        let r = ConflictResolver::default().resolve(&c);
        assert_eq!(r.strategy, ResolutionStrategy::LastWriteWins);
        assert_eq!(r.value, Some(json!("lots")));
        assert!(r.reason.contains("not applicable"));
    }

    #[test]
    fn last_write_wins_ties_go_local() {
        let building = |level: u32| json!({"level": level, "unlocked": true});
        let resolver = ConflictResolver::default();

        let newer_remote = conflict("buildings.barn", building(3), 100, building(2), 200);
        assert_eq!(resolver.resolve(&newer_remote).value, Some(building(2)));

        let tie = conflict("buildings.barn", building(3), 100, building(2), 100);
        let r = resolver.resolve(&tie);
        assert_eq!(r.strategy, ResolutionStrategy::LastWriteWins);
        assert_eq!(r.value, Some(building(3)));
    }

    #[test]
    fn array_merge_unions_without_duplicates() {
        let c = conflict("achievements", json!(["A", "B"]), 1, json!(["B", "C"]), 2);
        let r = ConflictResolver::default().resolve(&c);
        assert_eq!(r.strategy, ResolutionStrategy::ArrayMerge);
        assert_eq!(r.value, Some(json!(["A", "B", "C"])));
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            StrategyRule::new("settings.volume", ResolutionStrategy::Manual),
            StrategyRule::new("settings.*", ResolutionStrategy::LastWriteWins),
            StrategyRule::new("*", ResolutionStrategy::ArrayMerge),
        ];
        let resolver = ConflictResolver::new(rules);
        let volume = conflict("settings.volume", json!(1), 1, json!(2), 2);
        let theme = conflict("settings.theme", json!("dark"), 1, json!("light"), 2);
        let upgrades = conflict("upgrades", json!([]), 1, json!(["shears"]), 2);
        assert_eq!(resolver.strategy_for(&volume), ResolutionStrategy::Manual);
        assert_eq!(resolver.strategy_for(&theme), ResolutionStrategy::LastWriteWins);
        assert_eq!(resolver.strategy_for(&upgrades), ResolutionStrategy::ArrayMerge);
    }

    #[test]
    fn wildcard_requires_a_key() {
        assert!(pattern_matches("resources.*", "resources.wool"));
        assert!(!pattern_matches("resources.*", "resources"));
        assert!(!pattern_matches("resources.*", "resourcesx.wool"));
        assert!(pattern_matches("*", "timestamp"));
    }

    #[test]
    fn rules_load_from_yaml() {
        let yaml = "- pattern: resources.*\n  conflict_type: value-mismatch\n  strategy: additive-merge\n- pattern: '*'\n  strategy: last-write-wins\n";
        let rules: Vec<StrategyRule> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0], default_rules()[0]);
    }
}
