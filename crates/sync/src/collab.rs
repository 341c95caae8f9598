//! Collaborator seams: where remote and local saves come from and go to.
//!
//! The engine only talks to these traits. In-memory implementations back
//! the tests and the demo; [`FileLocalStore`] persists to a [`SaveStore`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;
use woolsync_common::VersionId;
use woolsync_kernel::{StateDelta, VersionedGameState, diff_states};
use woolsync_persist::SaveStore;

use crate::error::CollabError;

/// The cloud side of the save.
#[async_trait]
pub trait RemoteStateStore: Send + Sync {
    /// Current remote head state.
    async fn fetch_remote_state(&self) -> Result<VersionedGameState, CollabError>;
    /// Version id of the remote head.
    async fn get_remote_version(&self) -> Result<VersionId, CollabError>;
    /// Operations turning the state at `from` into the state at `to`.
    async fn fetch_delta(&self, from: VersionId, to: VersionId) -> Result<StateDelta, CollabError>;
    /// Replace the remote head.
    async fn upload_state(&self, state: &VersionedGameState) -> Result<(), CollabError>;
}

/// The device-local save slot.
#[async_trait]
pub trait LocalPersistence: Send + Sync {
    async fn load_local_state(&self) -> Result<Option<VersionedGameState>, CollabError>;
    async fn save_local_state(&self, state: &VersionedGameState) -> Result<(), CollabError>;
}

#[derive(Debug)]
struct RemoteInner {
    head: VersionedGameState,
    history: HashMap<VersionId, VersionedGameState>,
    offline: bool,
    uploads: usize,
    gate: Option<Arc<Notify>>,
}

/// In-memory remote keeping every state it has seen by version id, so it
/// can serve deltas between any two of them.
#[derive(Debug)]
pub struct MemoryRemote {
    inner: Mutex<RemoteInner>,
}

impl MemoryRemote {
    pub fn new(head: VersionedGameState) -> Self {
        let mut history = HashMap::new();
        history.insert(head.version, head.clone());
        Self {
            inner: Mutex::new(RemoteInner {
                head,
                history,
                offline: false,
                uploads: 0,
                gate: None,
            }),
        }
    }

    /// Make every call fail with `Unavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Hold `fetch_remote_state` until `gate` is notified.
    pub fn hold_fetches(&self, gate: Arc<Notify>) {
        self.inner.lock().gate = Some(gate);
    }

    /// Replace the head as another device would, without counting it as an
    /// upload from this engine.
    pub fn push_from_other_device(&self, state: VersionedGameState) {
        let mut inner = self.inner.lock();
        inner.history.insert(state.version, state.clone());
        inner.head = state;
    }

    pub fn head(&self) -> VersionedGameState {
        self.inner.lock().head.clone()
    }

    pub fn uploads(&self) -> usize {
        self.inner.lock().uploads
    }

    fn check_online(&self) -> Result<(), CollabError> {
        if self.inner.lock().offline {
            return Err(CollabError::Unavailable("remote is offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStateStore for MemoryRemote {
    async fn fetch_remote_state(&self) -> Result<VersionedGameState, CollabError> {
        let gate = self.inner.lock().gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.check_online()?;
        Ok(self.head())
    }

    async fn get_remote_version(&self) -> Result<VersionId, CollabError> {
        self.check_online()?;
        Ok(self.inner.lock().head.version)
    }

    async fn fetch_delta(&self, from: VersionId, to: VersionId) -> Result<StateDelta, CollabError> {
        self.check_online()?;
        let inner = self.inner.lock();
        let lookup = |id: VersionId| {
            inner
                .history
                .get(&id)
                .ok_or_else(|| CollabError::NotFound(format!("version {id}")))
        };
        let (a, b) = (lookup(from)?, lookup(to)?);
        let ops = diff_states(a, b, &b.device_id, b.timestamp)
            .map_err(|e| CollabError::Storage(e.to_string()))?;
        Ok(StateDelta::new(from, to, ops))
    }

    async fn upload_state(&self, state: &VersionedGameState) -> Result<(), CollabError> {
        self.check_online()?;
        let mut inner = self.inner.lock();
        inner.history.insert(state.version, state.clone());
        inner.head = state.clone();
        inner.uploads += 1;
        Ok(())
    }
}

/// In-memory local slot counting writes.
#[derive(Debug, Default)]
pub struct MemoryLocal {
    slot: Mutex<Option<VersionedGameState>>,
    writes: Mutex<usize>,
}

impl MemoryLocal {
    pub fn new(state: Option<VersionedGameState>) -> Self {
        Self {
            slot: Mutex::new(state),
            writes: Mutex::new(0),
        }
    }

    pub fn current(&self) -> Option<VersionedGameState> {
        self.slot.lock().clone()
    }

    /// Overwrite the slot as gameplay would, without counting a write.
    pub fn play(&self, state: VersionedGameState) {
        *self.slot.lock() = Some(state);
    }

    pub fn writes(&self) -> usize {
        *self.writes.lock()
    }
}

#[async_trait]
impl LocalPersistence for MemoryLocal {
    async fn load_local_state(&self) -> Result<Option<VersionedGameState>, CollabError> {
        Ok(self.current())
    }

    async fn save_local_state(&self, state: &VersionedGameState) -> Result<(), CollabError> {
        *self.slot.lock() = Some(state.clone());
        *self.writes.lock() += 1;
        Ok(())
    }
}

/// Local persistence over a [`SaveStore`]. File IO runs on the blocking
/// pool.
#[derive(Clone)]
pub struct FileLocalStore {
    store: Arc<Mutex<SaveStore>>,
}

impl FileLocalStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CollabError> {
        Ok(Self {
            store: Arc::new(Mutex::new(SaveStore::open(path)?)),
        })
    }

    pub fn store(&self) -> Arc<Mutex<SaveStore>> {
        Arc::clone(&self.store)
    }
}

#[async_trait]
impl LocalPersistence for FileLocalStore {
    async fn load_local_state(&self) -> Result<Option<VersionedGameState>, CollabError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.lock().load_latest_state())
            .await
            .map_err(|e| CollabError::Storage(e.to_string()))?
            .map_err(CollabError::from)
    }

    async fn save_local_state(&self, state: &VersionedGameState) -> Result<(), CollabError> {
        let store = Arc::clone(&self.store);
        let state = state.clone();
        tokio::task::spawn_blocking(move || store.lock().save_state(&state))
            .await
            .map_err(|e| CollabError::Storage(e.to_string()))?
            .map_err(CollabError::from)
    }
}
