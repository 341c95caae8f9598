//! The version graph: versions, branches, snapshots and merges.
//!
//! # Invariants
//! - Version ids are unique and versions are immutable once stored.
//! - Every `parent_id` refers to an existing, strictly older version, so the
//!   chain from any version to the root is finite and acyclic.
//! - The active branch always exists and every branch head exists.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use woolsync_common::{BranchId, SnapshotId, Timestamp, VersionId, now_millis};
use woolsync_kernel::{
    DeltaError, StateDelta, VersionedGameState, apply_operations, diff_states, validate_delta,
};

use crate::merge::{MergeConflict, three_way_merge};
use crate::version::{Branch, SnapshotTrigger, StateSnapshot, Version, VersionMetadata};

/// Errors from version graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("unknown version {0}")]
    UnknownVersion(VersionId),
    #[error("unknown branch {0:?}")]
    UnknownBranch(String),
    #[error("branch {0:?} already exists")]
    BranchExists(String),
    #[error("cannot delete the active branch {0:?}")]
    ActiveBranch(String),
    #[error("unknown snapshot {0}")]
    UnknownSnapshot(SnapshotId),
    #[error("delta starts at {actual}, expected {expected}")]
    DeltaBaseMismatch {
        expected: VersionId,
        actual: VersionId,
    },
    #[error("delta checksum mismatch")]
    DeltaChecksumMismatch,
    #[error("delta does not apply cleanly at {path:?}")]
    DeltaDiverged { path: String },
    #[error("delta error: {0}")]
    Delta(#[from] DeltaError),
    #[error("branches {source_branch:?} and {target_branch:?} share no ancestor")]
    NoCommonAncestor {
        source_branch: String,
        target_branch: String,
    },
    #[error("parent chain of {0} is cyclic")]
    Cycle(VersionId),
    #[error("version {0} failed verification")]
    Corrupt(VersionId),
}

/// Version graph settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionControlConfig {
    /// Name of the branch holding the root version.
    pub default_branch: String,
    /// Take an automatic snapshot after this many new versions.
    pub auto_snapshot_every: Option<u32>,
}

impl Default for VersionControlConfig {
    fn default() -> Self {
        Self {
            default_branch: "main".into(),
            auto_snapshot_every: None,
        }
    }
}

/// Outcome of a branch merge.
#[derive(Debug, Clone)]
pub struct MergeResult {
    /// Nearest common ancestor used as the merge base.
    pub base: VersionId,
    /// The merge version, present only when the merge succeeded.
    pub version: Option<Version>,
    /// Keys both branches changed differently. Non-empty means nothing was
    /// written.
    pub conflicts: Vec<MergeConflict>,
}

impl MergeResult {
    pub fn success(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// History of a save: an append-only store of versions with named branches
/// and snapshots pointing into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionControl {
    config: VersionControlConfig,
    versions: BTreeMap<VersionId, Version>,
    branches: BTreeMap<String, Branch>,
    active_branch: String,
    snapshots: BTreeMap<SnapshotId, StateSnapshot>,
    versions_since_snapshot: u32,
}

impl VersionControl {
    /// Start a history whose root version holds `initial`.
    pub fn new(initial: VersionedGameState, config: VersionControlConfig) -> Self {
        let now = now_millis();
        let root = build_version(initial, None, None, VersionMetadata::titled("Initial version"));
        let branch = Branch {
            id: BranchId::new(),
            name: config.default_branch.clone(),
            parent_branch: None,
            head: root.id,
            created_at: now,
            modified_at: now,
        };
        tracing::debug!(root = %root.id, branch = %branch.name, "version graph created");

        let mut versions = BTreeMap::new();
        versions.insert(root.id, root);
        let mut branches = BTreeMap::new();
        let active_branch = branch.name.clone();
        branches.insert(branch.name.clone(), branch);

        Self {
            config,
            versions,
            branches,
            active_branch,
            snapshots: BTreeMap::new(),
            versions_since_snapshot: 0,
        }
    }

    pub fn config(&self) -> &VersionControlConfig {
        &self.config
    }

    /// Number of stored versions.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Always false: a graph holds at least its root.
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn get(&self, id: VersionId) -> Option<&Version> {
        self.versions.get(&id)
    }

    fn version(&self, id: VersionId) -> Result<&Version, GraphError> {
        self.versions.get(&id).ok_or(GraphError::UnknownVersion(id))
    }

    fn branch(&self, name: &str) -> Result<&Branch, GraphError> {
        self.branches
            .get(name)
            .ok_or_else(|| GraphError::UnknownBranch(name.to_string()))
    }

    pub fn active_branch(&self) -> Result<&Branch, GraphError> {
        self.branch(&self.active_branch)
    }

    /// Head version of the active branch.
    pub fn head(&self) -> Result<&Version, GraphError> {
        self.version(self.active_branch()?.head)
    }

    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &StateSnapshot> {
        self.snapshots.values()
    }

    /// Record `state` as a new version on the active branch and advance it.
    pub fn create_version(
        &mut self,
        state: VersionedGameState,
        metadata: VersionMetadata,
    ) -> Result<Version, GraphError> {
        let branch = self.active_branch.clone();
        let parent = self.active_branch()?.head;
        let version = self.commit(&branch, parent, state, metadata, None)?;
        tracing::info!(version = %version.id, parent = %parent, branch = %branch, "version created");

        self.versions_since_snapshot += 1;
        if let Some(every) = self.config.auto_snapshot_every {
            if every > 0 && self.versions_since_snapshot >= every {
                let name = format!("auto-{}", version.id);
                self.snapshot_version(version.id, name, SnapshotTrigger::Automatic)?;
            }
        }
        Ok(version)
    }

    /// Store a new version under `parent`. Ids are regenerated on the
    /// (unlikely) event of a collision.
    fn insert_version(
        &mut self,
        parent: VersionId,
        state: VersionedGameState,
        metadata: VersionMetadata,
        merged_from: Option<VersionId>,
    ) -> Result<Version, GraphError> {
        self.version(parent)?;
        let mut version = build_version(state, Some(parent), merged_from, metadata);
        while self.versions.contains_key(&version.id) {
            version = build_version(version.state, Some(parent), merged_from, version.metadata);
        }
        self.versions.insert(version.id, version.clone());
        Ok(version)
    }

    fn advance(&mut self, branch: &str, version: &Version) -> Result<(), GraphError> {
        let branch = self
            .branches
            .get_mut(branch)
            .ok_or_else(|| GraphError::UnknownBranch(branch.to_string()))?;
        branch.head = version.id;
        branch.modified_at = version.timestamp;
        Ok(())
    }

    /// Store a version with the given parent and move `branch` onto it.
    fn commit(
        &mut self,
        branch: &str,
        parent: VersionId,
        state: VersionedGameState,
        metadata: VersionMetadata,
        merged_from: Option<VersionId>,
    ) -> Result<Version, GraphError> {
        self.branch(branch)?;
        let version = self.insert_version(parent, state, metadata, merged_from)?;
        self.advance(branch, &version)?;
        Ok(version)
    }

    /// Minimal operations turning `from`'s state into `to`'s.
    pub fn create_delta(&self, from: VersionId, to: VersionId) -> Result<StateDelta, GraphError> {
        let a = self.version(from)?;
        let b = self.version(to)?;
        let ops = diff_states(&a.state, &b.state, &b.device_id, b.timestamp)?;
        tracing::debug!(%from, %to, ops = ops.len(), "delta computed");
        Ok(StateDelta::new(from, to, ops))
    }

    /// Replay `delta` onto `base` and wrap the result in a new version whose
    /// parent is `base`. The active branch advances only if `base` is its
    /// head.
    pub fn apply_delta(&mut self, base: VersionId, delta: &StateDelta) -> Result<Version, GraphError> {
        if delta.from_version != base {
            return Err(GraphError::DeltaBaseMismatch {
                expected: base,
                actual: delta.from_version,
            });
        }
        if !validate_delta(delta) {
            return Err(GraphError::DeltaChecksumMismatch);
        }
        let applied = apply_operations(&self.version(base)?.state, &delta.operations)?;
        if let Some(divergence) = applied.divergences.first() {
            return Err(GraphError::DeltaDiverged {
                path: divergence.path.clone(),
            });
        }

        let metadata = VersionMetadata::titled("Applied delta")
            .with_summary(format!("{} operations from {}", delta.len(), delta.from_version));
        let active = self.active_branch()?.head == base;
        let version = self.insert_version(base, applied.state, metadata, None)?;
        if active {
            let name = self.active_branch.clone();
            self.advance(&name, &version)?;
        }
        tracing::debug!(%base, version = %version.id, advanced = active, "delta applied");
        Ok(version)
    }

    /// Create a branch at `from` (default: the active head). The active
    /// branch is unchanged.
    pub fn create_branch(&mut self, name: &str, from: Option<VersionId>) -> Result<Branch, GraphError> {
        if self.branches.contains_key(name) {
            return Err(GraphError::BranchExists(name.to_string()));
        }
        let head = match from {
            Some(id) => self.version(id)?.id,
            None => self.head()?.id,
        };
        let now = now_millis();
        let branch = Branch {
            id: BranchId::new(),
            name: name.to_string(),
            parent_branch: Some(self.active_branch()?.id),
            head,
            created_at: now,
            modified_at: now,
        };
        self.branches.insert(name.to_string(), branch.clone());
        tracing::info!(branch = name, %head, "branch created");
        Ok(branch)
    }

    /// Make `name` the active branch and return its head.
    pub fn switch_branch(&mut self, name: &str) -> Result<&Version, GraphError> {
        self.branch(name)?;
        self.active_branch = name.to_string();
        tracing::info!(branch = name, "switched branch");
        self.head()
    }

    /// Drop a branch pointer. Its versions stay in the history.
    pub fn delete_branch(&mut self, name: &str) -> Result<Branch, GraphError> {
        if name == self.active_branch {
            return Err(GraphError::ActiveBranch(name.to_string()));
        }
        self.branches
            .remove(name)
            .ok_or_else(|| GraphError::UnknownBranch(name.to_string()))
    }

    /// Three-way merge of `source`'s head into `target`.
    ///
    /// On success a merge version is committed on `target` (parent: target
    /// head, `merged_from`: source head). On conflicts the graph is left
    /// untouched and the conflicts are returned for the caller to resolve.
    pub fn merge_branches(&mut self, source: &str, target: &str) -> Result<MergeResult, GraphError> {
        let source_head = self.branch(source)?.head;
        let target_head = self.branch(target)?.head;
        let base = self
            .nearest_common_ancestor(source_head, target_head)
            .ok_or_else(|| GraphError::NoCommonAncestor {
                source_branch: source.to_string(),
                target_branch: target.to_string(),
            })?;

        let outcome = three_way_merge(
            &self.version(base)?.state,
            &self.version(source_head)?.state,
            &self.version(target_head)?.state,
        );
        if !outcome.conflicts.is_empty() {
            tracing::warn!(
                source,
                target,
                conflicts = outcome.conflicts.len(),
                "merge stopped on conflicts"
            );
            return Ok(MergeResult {
                base,
                version: None,
                conflicts: outcome.conflicts,
            });
        }

        let metadata = VersionMetadata::titled(format!("Merge {source} into {target}")).with_tag("merge");
        let version = self.commit(target, target_head, outcome.state, metadata, Some(source_head))?;
        tracing::info!(source, target, %base, version = %version.id, "branches merged");
        Ok(MergeResult {
            base,
            version: Some(version),
            conflicts: Vec::new(),
        })
    }

    /// Best common ancestor of `a` and `b` over parent and merge edges: a
    /// shared ancestor that no other shared ancestor descends from. Ties go
    /// to the newest.
    pub fn nearest_common_ancestor(&self, a: VersionId, b: VersionId) -> Option<VersionId> {
        let from_a = self.ancestors(a);
        let common: Vec<VersionId> = self
            .ancestors(b)
            .into_iter()
            .filter(|id| from_a.contains(id))
            .collect();

        let mut shadowed = HashSet::new();
        for id in &common {
            shadowed.extend(self.ancestors(*id).into_iter().filter(|anc| anc != id));
        }
        common
            .into_iter()
            .filter(|id| !shadowed.contains(id))
            .max_by_key(|id| (self.versions.get(id).map(|v| v.timestamp), *id))
    }

    /// `id` and everything reachable from it over parent and merge edges.
    fn ancestors(&self, id: VersionId) -> HashSet<VersionId> {
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(version) = self.versions.get(&id) {
                stack.extend(version.lineage());
            }
        }
        seen
    }

    /// Parent chain from `id` to the root, newest first.
    pub fn history(&self, id: VersionId) -> Result<Vec<&Version>, GraphError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if !seen.insert(current) {
                return Err(GraphError::Cycle(id));
            }
            let version = self.version(current)?;
            chain.push(version);
            cursor = version.parent_id;
        }
        Ok(chain)
    }

    /// Snapshot the active head.
    pub fn create_snapshot(&mut self, name: &str) -> Result<SnapshotId, GraphError> {
        let head = self.head()?.id;
        self.snapshot_version(head, name.to_string(), SnapshotTrigger::Manual)
    }

    fn snapshot_version(
        &mut self,
        version_id: VersionId,
        name: String,
        trigger: SnapshotTrigger,
    ) -> Result<SnapshotId, GraphError> {
        let state = self.version(version_id)?.state.clone();
        let snapshot = StateSnapshot {
            id: SnapshotId::new(),
            name,
            version_id,
            state,
            trigger,
            created_at: now_millis(),
        };
        let id = snapshot.id;
        tracing::debug!(snapshot = %id, version = %version_id, ?trigger, "snapshot taken");
        self.snapshots.insert(id, snapshot);
        self.versions_since_snapshot = 0;
        Ok(id)
    }

    pub fn get_snapshot(&self, id: SnapshotId) -> Option<&StateSnapshot> {
        self.snapshots.get(&id)
    }

    pub fn delete_snapshot(&mut self, id: SnapshotId) -> Result<StateSnapshot, GraphError> {
        self.snapshots.remove(&id).ok_or(GraphError::UnknownSnapshot(id))
    }

    /// Commit a snapshot's state as a new version on the active branch.
    pub fn restore_from_snapshot(&mut self, id: SnapshotId) -> Result<Version, GraphError> {
        let snapshot = self.snapshots.get(&id).ok_or(GraphError::UnknownSnapshot(id))?;
        let metadata = VersionMetadata::titled(format!("Restore snapshot {}", snapshot.name))
            .with_tag("restore");
        let state = snapshot.state.clone();
        self.create_version(state, metadata)
    }

    /// Commit a prior version's state as a new version on the active
    /// branch. History is never rewritten.
    pub fn rollback(&mut self, to: VersionId) -> Result<Version, GraphError> {
        let state = self.version(to)?.state.clone();
        let metadata = VersionMetadata::titled(format!("Rollback to {to}")).with_tag("rollback");
        self.create_version(state, metadata)
    }

    /// Check every stored invariant.
    pub fn verify(&self) -> Result<(), GraphError> {
        for version in self.versions.values() {
            if !version.verify() {
                return Err(GraphError::Corrupt(version.id));
            }
            for edge in version.lineage() {
                self.version(edge)?;
            }
            self.history(version.id)?;
        }
        for branch in self.branches.values() {
            self.version(branch.head)?;
        }
        self.active_branch()?;
        for snapshot in self.snapshots.values() {
            self.version(snapshot.version_id)?;
        }
        Ok(())
    }
}

fn build_version(
    mut state: VersionedGameState,
    parent_id: Option<VersionId>,
    merged_from: Option<VersionId>,
    metadata: VersionMetadata,
) -> Version {
    let id = VersionId::new();
    let timestamp: Timestamp = now_millis();
    state.version = id;
    state.seal();
    Version {
        id,
        parent_id,
        merged_from,
        timestamp,
        device_id: state.device_id.clone(),
        checksum: state.checksum.clone(),
        metadata,
        state,
    }
}
