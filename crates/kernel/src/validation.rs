use serde::{Deserialize, Serialize};
use woolsync_common::Amount;

use crate::checksum;
use crate::state::VersionedGameState;

/// Bounds a persisted state must respect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateLimits {
    pub max_building_level: u32,
}

impl Default for StateLimits {
    fn default() -> Self {
        Self {
            max_building_level: 1000,
        }
    }
}

/// Reasons a state is refused before it is persisted anywhere.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("resource {resource:?} has invalid amount {raw:?}")]
    InvalidAmount { resource: String, raw: String },
    #[error("resource {resource:?} is negative ({amount})")]
    NegativeResource { resource: String, amount: String },
    #[error("building {building:?} level {level} exceeds maximum {max}")]
    BuildingLevelOutOfRange { building: String, level: u32, max: u32 },
    #[error("delta checksum mismatch: expected {expected}, got {actual}")]
    DeltaChecksumMismatch { expected: String, actual: String },
    #[error("delta starts at {actual}, local state is at {expected}")]
    DeltaBaseMismatch { expected: String, actual: String },
}

/// Check integrity and value bounds. The first violation found is returned.
pub fn validate_state(state: &VersionedGameState, limits: &StateLimits) -> Result<(), ValidationError> {
    let actual = checksum::generate_checksum(state);
    if actual != state.checksum {
        return Err(ValidationError::ChecksumMismatch {
            expected: state.checksum.clone(),
            actual,
        });
    }
    validate_values(state, limits)
}

/// Value bounds only, without the checksum comparison.
pub fn validate_values(state: &VersionedGameState, limits: &StateLimits) -> Result<(), ValidationError> {
    for (resource, raw) in &state.resources {
        let amount = Amount::parse(raw).map_err(|_| ValidationError::InvalidAmount {
            resource: resource.clone(),
            raw: raw.clone(),
        })?;
        if amount.is_negative() {
            return Err(ValidationError::NegativeResource {
                resource: resource.clone(),
                amount: amount.to_string(),
            });
        }
    }
    for (building, data) in &state.buildings {
        if data.level > limits.max_building_level {
            return Err(ValidationError::BuildingLevelOutOfRange {
                building: building.clone(),
                level: data.level,
                max: limits.max_building_level,
            });
        }
    }
    Ok(())
}
