use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use woolsync_common::{Amount, DeviceId, Timestamp, VersionId};

use crate::checksum;

/// Errors converting a state to and from its JSON representation.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("state JSON must be an object")]
    NotAnObject,
}

/// Where a save stands with respect to the cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Conflict,
    Error,
}

/// Bookkeeping carried inside every save.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetadata {
    pub last_sync_time: Option<Timestamp>,
    pub pending_operations: u32,
    pub sync_state: SyncState,
}

/// Per-building data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildingState {
    pub level: u32,
    pub unlocked: bool,
}

/// The game fields that participate in conflict detection and merging.
///
/// Declaration order is the canonical processing order: conflicts are
/// detected and resolutions applied resources first, settings last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StateField {
    Resources,
    Buildings,
    Achievements,
    Upgrades,
    Settings,
}

impl StateField {
    pub const ALL: [StateField; 5] = [
        StateField::Resources,
        StateField::Buildings,
        StateField::Achievements,
        StateField::Upgrades,
        StateField::Settings,
    ];

    /// JSON key of this field.
    pub fn key(self) -> &'static str {
        match self {
            StateField::Resources => "resources",
            StateField::Buildings => "buildings",
            StateField::Achievements => "achievements",
            StateField::Upgrades => "upgrades",
            StateField::Settings => "settings",
        }
    }

    /// Whether the field is a keyed map (diffed per key) rather than a set.
    pub fn is_keyed(self) -> bool {
        matches!(
            self,
            StateField::Resources | StateField::Buildings | StateField::Settings
        )
    }

    /// The game field a dotted path points into, if any.
    pub fn of_path(path: &str) -> Option<Self> {
        let head = path.split_once('.').map_or(path, |(head, _)| head);
        Self::ALL.into_iter().find(|f| f.key() == head)
    }

    /// Path of one entry of a keyed field.
    pub fn entry_path(self, key: &str) -> String {
        format!("{}.{}", self.key(), key)
    }
}

/// The canonical save: everything a device needs to resume a game.
///
/// Maps and sets are ordered so iteration, serialization and hashing are
/// deterministic across devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedGameState {
    /// Resource counters as exact decimal strings.
    pub resources: BTreeMap<String, String>,
    pub buildings: BTreeMap<String, BuildingState>,
    pub upgrades: BTreeSet<String>,
    pub achievements: BTreeSet<String>,
    pub settings: BTreeMap<String, Value>,
    pub device_id: DeviceId,
    pub timestamp: Timestamp,
    pub version: VersionId,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub sync_metadata: SyncMetadata,
}

impl VersionedGameState {
    /// A fresh, empty, sealed save for a device.
    pub fn new(device_id: DeviceId, timestamp: Timestamp) -> Self {
        Self {
            resources: BTreeMap::new(),
            buildings: BTreeMap::new(),
            upgrades: BTreeSet::new(),
            achievements: BTreeSet::new(),
            settings: BTreeMap::new(),
            device_id,
            timestamp,
            version: VersionId::nil(),
            checksum: String::new(),
            sync_metadata: SyncMetadata::default(),
        }
        .sealed()
    }

    /// Recompute and store the checksum. Call after every mutation.
    pub fn seal(&mut self) {
        self.checksum = checksum::generate_checksum(self);
    }

    pub fn sealed(mut self) -> Self {
        self.seal();
        self
    }

    /// Whether the stored checksum matches the content.
    pub fn verify(&self) -> bool {
        checksum::verify_state(self)
    }

    /// Parsed amount of a resource. Absent resources read as zero.
    pub fn amount(&self, resource: &str) -> Result<Amount, woolsync_common::AmountError> {
        match self.resources.get(resource) {
            Some(raw) => Amount::parse(raw),
            None => Ok(Amount::zero()),
        }
    }

    /// Whether the game content (everything but identity and bookkeeping)
    /// of two saves is equal.
    pub fn same_content(&self, other: &Self) -> bool {
        self.resources == other.resources
            && self.buildings == other.buildings
            && self.upgrades == other.upgrades
            && self.achievements == other.achievements
            && self.settings == other.settings
    }

    pub fn with_resource(mut self, resource: &str, amount: &str) -> Self {
        self.resources.insert(resource.to_string(), amount.to_string());
        self.sealed()
    }

    pub fn with_building(mut self, building: &str, level: u32, unlocked: bool) -> Self {
        self.buildings
            .insert(building.to_string(), BuildingState { level, unlocked });
        self.sealed()
    }

    pub fn with_achievement(mut self, achievement: &str) -> Self {
        self.achievements.insert(achievement.to_string());
        self.sealed()
    }

    pub fn with_upgrade(mut self, upgrade: &str) -> Self {
        self.upgrades.insert(upgrade.to_string());
        self.sealed()
    }

    pub fn with_setting(mut self, key: &str, value: Value) -> Self {
        self.settings.insert(key.to_string(), value);
        self.sealed()
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self.sealed()
    }

    /// JSON object form, the representation deltas and paths operate on.
    pub fn to_value(&self) -> Result<Value, StateError> {
        let value = serde_json::to_value(self)?;
        if !value.is_object() {
            return Err(StateError::NotAnObject);
        }
        Ok(value)
    }

    pub fn from_value(value: Value) -> Result<Self, StateError> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VersionedGameState {
        VersionedGameState::new(DeviceId::new("laptop"), 1_000)
            .with_resource("wool", "12.5")
            .with_building("barn", 3, true)
            .with_achievement("first_click")
            .with_upgrade("golden_shears")
            .with_setting("volume", serde_json::json!(0.8))
    }

    #[test]
    fn new_state_is_sealed_and_unversioned() {
        let state = VersionedGameState::new(DeviceId::new("phone"), 5);
        assert!(state.verify());
        assert!(state.version.is_nil());
        assert_eq!(state.sync_metadata.sync_state, SyncState::Idle);
    }

    #[test]
    fn mutation_without_seal_breaks_verification() {
        let mut state = sample();
        state.resources.insert("wool".into(), "13".into());
        assert!(!state.verify());
        state.seal();
        assert!(state.verify());
    }

    #[test]
    fn json_shape_is_camel_case() {
        let value = sample().to_value().unwrap();
        assert!(value.get("deviceId").is_some());
        assert!(value.get("syncMetadata").is_some());
        assert_eq!(value["syncMetadata"]["syncState"], "idle");
        assert_eq!(value["buildings"]["barn"]["level"], 3);
    }

    #[test]
    fn value_roundtrip_preserves_state() {
        let state = sample();
        let back = VersionedGameState::from_value(state.to_value().unwrap()).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn same_content_ignores_identity() {
        let a = sample();
        let mut b = sample();
        b.device_id = DeviceId::new("other");
        b.timestamp = 99;
        b.version = VersionId::new();
        b.seal();
        assert!(a.same_content(&b));
        assert!(!a.same_content(&b.with_resource("wool", "1")));
    }

    #[test]
    fn missing_resource_reads_as_zero() {
        let state = sample();
        assert!(state.amount("milk").unwrap().is_zero());
        assert_eq!(state.amount("wool").unwrap().to_string(), "12.5");
    }

    #[test]
    fn field_of_path() {
        assert_eq!(StateField::of_path("resources.wool"), Some(StateField::Resources));
        assert_eq!(StateField::of_path("achievements"), Some(StateField::Achievements));
        assert_eq!(StateField::of_path("timestamp"), None);
        assert_eq!(StateField::Buildings.entry_path("barn"), "buildings.barn");
    }
}
