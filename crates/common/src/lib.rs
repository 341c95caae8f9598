//! Shared types for the woolsync engine: identifiers, timestamps and exact
//! decimal amounts.

pub mod amount;
pub mod types;

pub use amount::{Amount, AmountError};
pub use types::{BranchId, ConflictId, DeviceId, SnapshotId, Timestamp, VersionId, now_millis};
