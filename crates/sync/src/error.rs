use woolsync_kernel::{DeltaError, PathError, StateError, ValidationError};
use woolsync_persist::{GraphError, StoreError};

/// Why a sync did not complete. Carried inside `SyncResult`, never raised
/// across the engine boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// The merged or incoming state broke an integrity or value rule.
    /// Nothing was written.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Conflicts need a caller decision. Nothing was written.
    #[error("{count} conflict(s) need resolution")]
    Conflict { count: usize },
    /// A collaborator call failed. Local state is untouched.
    #[error("network error: {0}")]
    Network(String),
    #[error("a sync is already in progress")]
    Concurrency,
    #[error("delta error: {0}")]
    Delta(String),
    #[error("version graph error: {0}")]
    Graph(String),
}

impl From<ValidationError> for SyncError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<StateError> for SyncError {
    fn from(e: StateError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<PathError> for SyncError {
    fn from(e: PathError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<DeltaError> for SyncError {
    fn from(e: DeltaError) -> Self {
        Self::Delta(e.to_string())
    }
}

impl From<GraphError> for SyncError {
    fn from(e: GraphError) -> Self {
        Self::Graph(e.to_string())
    }
}

impl From<CollabError> for SyncError {
    fn from(e: CollabError) -> Self {
        Self::Network(e.to_string())
    }
}

/// Failures reported by remote and local collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollabError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for CollabError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e.to_string())
    }
}
