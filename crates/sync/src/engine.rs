//! The sync engine: reconciles the local save with the remote one.
//!
//! Every public operation returns a [`SyncResult`]; expected failures are
//! reported inside it, never raised. A sync either completes (merged state
//! validated, versioned, uploaded and saved) or writes nothing.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use woolsync_common::{DeviceId, Timestamp, now_millis};
use woolsync_kernel::{
    StateField, SyncState, ValidationError, VersionedGameState, apply_operations,
    operations_checksum, path, validate_delta, validate_state,
};
use woolsync_persist::{Version, VersionControl, VersionMetadata};

use crate::collab::{LocalPersistence, RemoteStateStore};
use crate::config::SyncConfig;
use crate::conflict::{
    Observed, Resolution, ResolutionStrategy, SyncConflict, detect_conflicts, skew_conflict,
};
use crate::error::SyncError;
use crate::events::{EventSink, SyncEvent, SyncKind, TracingSink};
use crate::resolver::ConflictResolver;

/// Source of "now" for skew detection and sync metadata.
pub type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// Outcome of a sync operation.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub success: bool,
    /// The state now stored locally and remotely.
    pub new_state: Option<VersionedGameState>,
    /// The version recorded for `new_state`, when one was created.
    pub version: Option<Version>,
    /// Number of conflicts detected.
    pub conflicts: usize,
    pub auto_resolved: usize,
    /// Every resolution applied, or computed before escalation.
    pub resolutions: Vec<Resolution>,
    /// Conflicts waiting for a caller decision.
    pub user_conflicts: Vec<SyncConflict>,
    /// Caller decisions whose path no longer conflicts.
    pub stale_resolutions: Vec<Resolution>,
    pub error: Option<SyncError>,
}

impl SyncResult {
    fn failed(error: SyncError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Clears the busy flag when a sync ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Reconciles one device's save with the cloud copy.
///
/// At most one sync runs per engine; an overlapping call is rejected
/// immediately. Each sync works on its own copy of the local state taken
/// when it starts.
pub struct SyncEngine {
    device_id: DeviceId,
    remote: Arc<dyn RemoteStateStore>,
    local: Arc<dyn LocalPersistence>,
    resolver: ConflictResolver,
    config: SyncConfig,
    events: Arc<dyn EventSink>,
    clock: Clock,
    busy: AtomicBool,
    graph: Mutex<Option<VersionControl>>,
}

impl SyncEngine {
    pub fn new(
        device_id: DeviceId,
        remote: Arc<dyn RemoteStateStore>,
        local: Arc<dyn LocalPersistence>,
        config: SyncConfig,
    ) -> Self {
        Self {
            device_id,
            remote,
            local,
            resolver: ConflictResolver::new(config.strategies.clone()),
            config,
            events: Arc::new(TracingSink),
            clock: Arc::new(now_millis),
            busy: AtomicBool::new(false),
            graph: Mutex::new(None),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Continue an existing history instead of starting one at the first
    /// completed sync.
    pub fn with_version_graph(self, graph: VersionControl) -> Self {
        *self.graph.lock() = Some(graph);
        self
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn is_syncing(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// A copy of the engine's version graph, if any sync has completed.
    pub fn version_graph(&self) -> Option<VersionControl> {
        self.graph.lock().clone()
    }

    /// Versions on the active branch, newest first.
    pub fn history(&self) -> Vec<Version> {
        let graph = self.graph.lock();
        let Some(graph) = graph.as_ref() else {
            return Vec::new();
        };
        graph
            .head()
            .and_then(|head| graph.history(head.id))
            .map(|chain| chain.into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Reconcile the whole local state against the whole remote state.
    pub async fn full_sync(&self) -> SyncResult {
        let Some(_guard) = self.begin(SyncKind::Full) else {
            return SyncResult::failed(SyncError::Concurrency);
        };
        let outcome = self.run_full().await;
        self.finish(outcome)
    }

    /// Reconcile by replaying the remote delta since the local version.
    pub async fn incremental_sync(&self) -> SyncResult {
        let Some(_guard) = self.begin(SyncKind::Incremental) else {
            return SyncResult::failed(SyncError::Concurrency);
        };
        let outcome = self.run_incremental().await;
        self.finish(outcome)
    }

    /// Finish an escalated sync with caller decisions.
    ///
    /// Conflicts are re-detected against fresh local and remote states and
    /// `resolutions` are matched to them by path. Anything left unmatched
    /// is escalated again.
    pub async fn resolve_user_conflicts(&self, resolutions: Vec<Resolution>) -> SyncResult {
        let Some(_guard) = self.begin(SyncKind::Resolution) else {
            return SyncResult::failed(SyncError::Concurrency);
        };
        let outcome = self.run_resolution(resolutions).await;
        self.finish(outcome)
    }

    fn begin(&self, kind: SyncKind) -> Option<BusyGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!(?kind, "sync rejected: another sync is in progress");
            return None;
        }
        self.events.publish(SyncEvent::Started { kind });
        Some(BusyGuard(&self.busy))
    }

    fn finish(&self, outcome: Result<SyncResult, SyncError>) -> SyncResult {
        let result = outcome.unwrap_or_else(SyncResult::failed);
        match &result.error {
            None => self.events.publish(SyncEvent::Completed {
                conflicts: result.conflicts,
                auto_resolved: result.auto_resolved,
            }),
            Some(error) => self.events.publish(SyncEvent::Error {
                error: error.to_string(),
            }),
        }
        result
    }

    async fn run_full(&self) -> Result<SyncResult, SyncError> {
        let local = self.local.load_local_state().await?;
        let remote = self.remote.fetch_remote_state().await?;
        check_checksum(&remote)?;

        let Some(local) = local else {
            return self.adopt(remote).await;
        };
        check_checksum(&local)?;

        let conflicts = detect_conflicts(&local, &remote, self.now(), self.config.max_clock_skew_ms);
        tracing::debug!(conflicts = conflicts.len(), "full sync compared states");
        self.settle(local, conflicts, &[], "Full sync").await
    }

    async fn run_incremental(&self) -> Result<SyncResult, SyncError> {
        let Some(local) = self.local.load_local_state().await? else {
            tracing::debug!("no local save, falling back to full sync");
            return self.run_full().await;
        };
        check_checksum(&local)?;

        let remote_version = self.remote.get_remote_version().await?;
        if local.version == remote_version {
            tracing::debug!(version = %remote_version, "already up to date");
            return Ok(SyncResult {
                success: true,
                new_state: Some(local),
                ..SyncResult::default()
            });
        }

        let delta = self.remote.fetch_delta(local.version, remote_version).await?;
        if !validate_delta(&delta) {
            tracing::warn!(from = %delta.from_version, to = %delta.to_version, "delta checksum mismatch");
            return Err(ValidationError::DeltaChecksumMismatch {
                expected: delta.checksum.clone(),
                actual: operations_checksum(&delta.operations),
            }
            .into());
        }
        if delta.from_version != local.version {
            tracing::warn!(from = %delta.from_version, local = %local.version, "delta base mismatch");
            return Err(ValidationError::DeltaBaseMismatch {
                expected: local.version.to_string(),
                actual: delta.from_version.to_string(),
            }
            .into());
        }

        let applied = apply_operations(&local, &delta.operations)?;
        let mut conflicts = Vec::new();
        for divergence in &applied.divergences {
            let Some(op) = delta.operations.get(divergence.index) else {
                continue;
            };
            let local_side = Observed {
                value: divergence.found.clone(),
                timestamp: local.timestamp,
                device: local.device_id.clone(),
            };
            let remote_side = Observed {
                value: divergence.incoming.clone(),
                timestamp: op.timestamp,
                device: op.device_id.clone(),
            };
            // Bookkeeping fields (timestamp, version, ...) classify to None.
            conflicts.extend(SyncConflict::classify(&divergence.path, local_side, remote_side));
        }
        conflicts.sort_by_key(|c| field_rank(&c.path));

        if let Some(op) = delta.operations.iter().max_by_key(|op| op.timestamp) {
            let local_side = Observed {
                value: Some(local.timestamp.into()),
                timestamp: local.timestamp,
                device: local.device_id.clone(),
            };
            let remote_side = Observed {
                value: Some(op.timestamp.into()),
                timestamp: op.timestamp,
                device: op.device_id.clone(),
            };
            conflicts.extend(skew_conflict(
                local_side,
                remote_side,
                self.now(),
                self.config.max_clock_skew_ms,
            ));
        }

        tracing::debug!(
            ops = delta.len(),
            divergences = applied.divergences.len(),
            conflicts = conflicts.len(),
            "delta replayed"
        );
        self.settle(applied.state, conflicts, &[], "Incremental sync").await
    }

    async fn run_resolution(&self, resolutions: Vec<Resolution>) -> Result<SyncResult, SyncError> {
        let local = self
            .local
            .load_local_state()
            .await?
            .ok_or_else(|| SyncError::Validation("no local save to resolve against".into()))?;
        let remote = self.remote.fetch_remote_state().await?;
        check_checksum(&local)?;
        check_checksum(&remote)?;

        let conflicts = detect_conflicts(&local, &remote, self.now(), self.config.max_clock_skew_ms);
        self.settle(local, conflicts, &resolutions, "Resolved conflicts").await
    }

    /// Resolve what can be resolved, escalate the rest, or commit.
    async fn settle(
        &self,
        base: VersionedGameState,
        conflicts: Vec<SyncConflict>,
        decisions: &[Resolution],
        title: &str,
    ) -> Result<SyncResult, SyncError> {
        let decided: HashMap<&str, &Resolution> =
            decisions.iter().map(|r| (r.path.as_str(), r)).collect();
        let stale_resolutions: Vec<Resolution> = decisions
            .iter()
            .filter(|r| !conflicts.iter().any(|c| c.path == r.path))
            .cloned()
            .collect();
        for stale in &stale_resolutions {
            tracing::warn!(path = %stale.path, "decision matches no current conflict");
        }

        let mut resolutions = Vec::new();
        let mut user_conflicts = Vec::new();
        let mut auto_resolved = 0;
        for conflict in &conflicts {
            if let Some(decision) = decided.get(conflict.path.as_str()) {
                resolutions.push(Resolution {
                    conflict_id: conflict.id,
                    automatic: false,
                    ..(*decision).clone()
                });
            } else if conflict.auto_resolvable
                && self.resolver.strategy_for(conflict) != ResolutionStrategy::Manual
            {
                resolutions.push(self.resolver.resolve(conflict));
                auto_resolved += 1;
            } else {
                user_conflicts.push(conflict.clone());
            }
        }

        if !user_conflicts.is_empty() {
            tracing::warn!(
                escalated = user_conflicts.len(),
                auto_resolved,
                "sync paused on conflicts"
            );
            let count = user_conflicts.len();
            return Ok(SyncResult {
                success: false,
                conflicts: conflicts.len(),
                auto_resolved,
                resolutions,
                user_conflicts,
                stale_resolutions,
                error: Some(SyncError::Conflict { count }),
                ..SyncResult::default()
            });
        }

        let merged = self.apply_resolutions(base, &resolutions)?;
        let summary = format!(
            "{} conflicts, {} auto-resolved",
            conflicts.len(),
            auto_resolved
        );
        let version = self
            .commit(merged, VersionMetadata::titled(title).with_summary(summary))
            .await?;
        tracing::info!(
            version = %version.id,
            conflicts = conflicts.len(),
            auto_resolved,
            "sync completed"
        );
        Ok(SyncResult {
            success: true,
            new_state: Some(version.state.clone()),
            version: Some(version),
            conflicts: conflicts.len(),
            auto_resolved,
            resolutions,
            user_conflicts: Vec::new(),
            stale_resolutions,
            error: None,
        })
    }

    /// Write resolved values onto `base` in field order, then by path.
    fn apply_resolutions(
        &self,
        base: VersionedGameState,
        resolutions: &[Resolution],
    ) -> Result<VersionedGameState, SyncError> {
        let mut ordered: Vec<&Resolution> = resolutions.iter().collect();
        ordered.sort_by(|a, b| {
            field_rank(&a.path)
                .cmp(&field_rank(&b.path))
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut doc = base.to_value()?;
        for resolution in ordered {
            path::put(&mut doc, &resolution.path, resolution.value.clone())?;
        }
        let mut merged = VersionedGameState::from_value(doc)?;

        let now = self.now();
        merged.device_id = self.device_id.clone();
        merged.timestamp = now;
        merged.sync_metadata.last_sync_time = Some(now);
        merged.sync_metadata.pending_operations = 0;
        merged.sync_metadata.sync_state = SyncState::Idle;
        merged.seal();
        Ok(merged)
    }

    /// Validate, version, upload, then save locally. The engine's graph is
    /// replaced only once both writes succeeded.
    async fn commit(
        &self,
        merged: VersionedGameState,
        metadata: VersionMetadata,
    ) -> Result<Version, SyncError> {
        validate_state(&merged, &self.config.limits)?;

        let current = self.graph.lock().clone();
        let (staged, version) = match current {
            Some(mut graph) => {
                let version = graph.create_version(merged, metadata)?;
                (graph, version)
            }
            None => {
                let graph = VersionControl::new(merged, self.config.version_control.clone());
                let version = graph.head()?.clone();
                (graph, version)
            }
        };

        self.remote.upload_state(&version.state).await?;
        self.local.save_local_state(&version.state).await?;
        *self.graph.lock() = Some(staged);
        Ok(version)
    }

    /// First sync on a device with no save: take the remote state as is.
    async fn adopt(&self, remote: VersionedGameState) -> Result<SyncResult, SyncError> {
        validate_state(&remote, &self.config.limits)?;
        self.local.save_local_state(&remote).await?;
        tracing::info!(version = %remote.version, "adopted remote save");
        Ok(SyncResult {
            success: true,
            new_state: Some(remote),
            ..SyncResult::default()
        })
    }

    fn now(&self) -> Timestamp {
        (self.clock)()
    }
}

fn check_checksum(state: &VersionedGameState) -> Result<(), SyncError> {
    if state.verify() {
        return Ok(());
    }
    Err(ValidationError::ChecksumMismatch {
        expected: state.checksum.clone(),
        actual: woolsync_kernel::generate_checksum(state),
    }
    .into())
}

/// Canonical processing position of a path: game fields in order, anything
/// else last.
fn field_rank(path: &str) -> usize {
    StateField::of_path(path)
        .and_then(|field| StateField::ALL.iter().position(|f| *f == field))
        .unwrap_or(StateField::ALL.len())
}
