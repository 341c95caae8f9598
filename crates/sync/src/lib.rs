//! Cloud save synchronization: conflict detection, strategy-table
//! resolution and the sync engine.
//!
//! # Invariants
//! - A sync either completes fully or writes nothing.
//! - No conflict is dropped: each one is resolved or returned to the caller.
//! - At most one sync runs per engine at a time.

pub mod collab;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod events;
pub mod resolver;

pub use collab::{FileLocalStore, LocalPersistence, MemoryLocal, MemoryRemote, RemoteStateStore};
pub use config::{ConfigError, SyncConfig};
pub use conflict::{
    ConflictType, Observed, Resolution, ResolutionStrategy, Severity, SyncConflict,
    detect_conflicts,
};
pub use engine::{Clock, SyncEngine, SyncResult};
pub use error::{CollabError, SyncError};
pub use events::{ChannelSink, EventSink, SyncEvent, SyncKind, TracingSink};
pub use resolver::{ConflictResolver, StrategyRule, default_rules};
