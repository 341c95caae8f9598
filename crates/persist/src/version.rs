use serde::{Deserialize, Serialize};
use woolsync_common::{BranchId, DeviceId, SnapshotId, Timestamp, VersionId};
use woolsync_kernel::VersionedGameState;

/// Descriptive metadata attached to a version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMetadata {
    pub title: String,
    pub tags: Vec<String>,
    pub change_summary: String,
}

impl VersionMetadata {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.change_summary = summary.into();
        self
    }
}

/// An immutable node in the save history.
///
/// The embedded state carries this version's id and a checksum sealed over
/// it, so a version can be verified on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub id: VersionId,
    pub parent_id: Option<VersionId>,
    /// Head of the branch merged in, for merge versions. Provenance only:
    /// `parent_id` alone forms the history tree.
    pub merged_from: Option<VersionId>,
    pub timestamp: Timestamp,
    pub device_id: DeviceId,
    pub checksum: String,
    pub metadata: VersionMetadata,
    pub state: VersionedGameState,
}

impl Version {
    /// Check the version against its embedded state.
    pub fn verify(&self) -> bool {
        self.state.version == self.id && self.state.checksum == self.checksum && self.state.verify()
    }

    /// Parent plus merge provenance, the edges walked for ancestry.
    pub fn lineage(&self) -> impl Iterator<Item = VersionId> + '_ {
        self.parent_id.into_iter().chain(self.merged_from)
    }
}

/// A named, movable pointer into the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: BranchId,
    pub name: String,
    pub parent_branch: Option<BranchId>,
    pub head: VersionId,
    pub created_at: Timestamp,
    pub modified_at: Timestamp,
}

/// What caused a snapshot to be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotTrigger {
    Manual,
    Automatic,
}

/// A checkpoint kept independently of branch progression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub id: SnapshotId,
    pub name: String,
    pub version_id: VersionId,
    pub state: VersionedGameState,
    pub trigger: SnapshotTrigger,
    pub created_at: Timestamp,
}
