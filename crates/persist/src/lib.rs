//! Save history: an append-only version graph with branches, snapshots and
//! three-way merge, plus file-backed storage for the local save.
//!
//! # Invariants
//! - Versions are immutable; rollback and restore append new versions.
//! - Parent chains are finite and acyclic.
//! - Stored segments are hash-chained and verified on load.

pub mod graph;
pub mod merge;
pub mod store;
pub mod version;

pub use graph::{GraphError, MergeResult, VersionControl, VersionControlConfig};
pub use merge::{MergeConflict, MergeOutcome, three_way_merge};
pub use store::{SaveMeta, SaveStore, StoreError};
pub use version::{Branch, SnapshotTrigger, StateSnapshot, Version, VersionMetadata};
