//! Save-state kernel: the versioned game state, its integrity checksum,
//! field-level deltas and validation.
//!
//! # Invariants
//! - Every resource amount is a non-negative exact decimal.
//! - Every building level stays within `StateLimits::max_building_level`.
//! - `checksum` equals the recomputed hash of every other field; mutate,
//!   then `seal()`.

pub mod checksum;
pub mod delta;
pub mod path;
pub mod state;
pub mod validation;

pub use checksum::{generate_checksum, operations_checksum, validate_delta, verify_state};
pub use delta::{
    Applied, DeltaError, DeltaOperation, Divergence, OpKind, StateDelta, apply_operations,
    diff_states,
};
pub use path::PathError;
pub use state::{BuildingState, StateError, StateField, SyncMetadata, SyncState, VersionedGameState};
pub use validation::{StateLimits, ValidationError, validate_state, validate_values};
