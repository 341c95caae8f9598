//! File-backed save persistence.
//!
//! Layout inside the store directory:
//! ```text
//! save.meta.json               - schema version and segment counters
//! states/
//!   000001.state.cbor.zst      - CBOR+zstd compressed game states
//! graph/
//!   000001.graph.cbor.zst      - CBOR+zstd compressed version graphs
//! integrity/
//!   manifest.json              - hash chain manifest
//! ```
//!
//! Every write appends a new segment; the newest segment of each kind is
//! the current value. Older segments stay on disk and in the hash chain.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use woolsync_kernel::VersionedGameState;

use crate::graph::{GraphError, VersionControl};

/// Current on-disk schema version.
const SAVE_SCHEMA_VERSION: u32 = 1;

const META_FILE: &str = "save.meta.json";

/// Errors from file-backed persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("segment {0} is missing from the integrity manifest")]
    Untracked(String),
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("stored state fails its checksum")]
    CorruptState,
    #[error("stored version graph is invalid: {0}")]
    CorruptGraph(#[from] GraphError),
}

/// Kinds of segment kept by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    State,
    Graph,
}

impl Segment {
    fn dir(self) -> &'static str {
        match self {
            Self::State => "states",
            Self::Graph => "graph",
        }
    }

    fn filename(self, index: u32) -> String {
        match self {
            Self::State => format!("{index:06}.state.cbor.zst"),
            Self::Graph => format!("{index:06}.graph.cbor.zst"),
        }
    }

    fn of_filename(name: &str) -> Option<Self> {
        if name.ends_with(".state.cbor.zst") {
            Some(Self::State)
        } else if name.ends_with(".graph.cbor.zst") {
            Some(Self::Graph)
        } else {
            None
        }
    }
}

/// Metadata stored in save.meta.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveMeta {
    pub schema_version: u32,
    pub state_count: u32,
    pub graph_count: u32,
}

/// A single entry in the integrity manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub sha256: String,
    pub prev_hash: Option<String>,
}

/// Integrity manifest tracking all segment hashes in a chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub entries: Vec<ManifestEntry>,
}

/// File-backed store for the local save and its version graph.
pub struct SaveStore {
    root: PathBuf,
    meta: SaveMeta,
    manifest: IntegrityManifest,
}

impl SaveStore {
    /// Open or create a save store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(Segment::State.dir()))?;
        std::fs::create_dir_all(root.join(Segment::Graph.dir()))?;
        std::fs::create_dir_all(root.join("integrity"))?;

        let meta_path = root.join(META_FILE);
        let manifest_path = root.join("integrity").join("manifest.json");

        let (meta, manifest) = if meta_path.exists() {
            let meta: SaveMeta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
            if meta.schema_version != SAVE_SCHEMA_VERSION {
                return Err(StoreError::SchemaMismatch {
                    file_version: meta.schema_version,
                    expected_version: SAVE_SCHEMA_VERSION,
                });
            }
            let manifest: IntegrityManifest = if manifest_path.exists() {
                serde_json::from_reader(std::fs::File::open(&manifest_path)?)?
            } else {
                IntegrityManifest::default()
            };
            (meta, manifest)
        } else {
            let meta = SaveMeta {
                schema_version: SAVE_SCHEMA_VERSION,
                state_count: 0,
                graph_count: 0,
            };
            let manifest = IntegrityManifest::default();
            serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, &meta)?;
            serde_json::to_writer_pretty(std::fs::File::create(&manifest_path)?, &manifest)?;
            (meta, manifest)
        };

        tracing::debug!(
            root = %root.display(),
            states = meta.state_count,
            graphs = meta.graph_count,
            "save store opened"
        );
        Ok(Self {
            root,
            meta,
            manifest,
        })
    }

    /// Append `state` as the newest local save.
    pub fn save_state(&mut self, state: &VersionedGameState) -> Result<(), StoreError> {
        let index = self.meta.state_count + 1;
        self.write_segment(Segment::State, index, state)
    }

    /// The newest saved state, if any. Fails closed on hash or checksum
    /// mismatch.
    pub fn load_latest_state(&self) -> Result<Option<VersionedGameState>, StoreError> {
        if self.meta.state_count == 0 {
            return Ok(None);
        }
        let state: VersionedGameState = self.read_segment(Segment::State, self.meta.state_count)?;
        if !state.verify() {
            return Err(StoreError::CorruptState);
        }
        Ok(Some(state))
    }

    /// Append `graph` as the newest version graph.
    pub fn save_graph(&mut self, graph: &VersionControl) -> Result<(), StoreError> {
        let index = self.meta.graph_count + 1;
        self.write_segment(Segment::Graph, index, graph)
    }

    /// The newest saved version graph, if any, after checking its
    /// invariants.
    pub fn load_latest_graph(&self) -> Result<Option<VersionControl>, StoreError> {
        if self.meta.graph_count == 0 {
            return Ok(None);
        }
        let graph: VersionControl = self.read_segment(Segment::Graph, self.meta.graph_count)?;
        graph.verify()?;
        Ok(Some(graph))
    }

    /// Verify all integrity hashes in the manifest.
    pub fn verify_integrity(&self) -> Result<(), StoreError> {
        let mut prev_hash: Option<String> = None;
        for entry in &self.manifest.entries {
            if entry.prev_hash != prev_hash {
                return Err(StoreError::IntegrityMismatch {
                    expected: prev_hash.unwrap_or_else(|| "None".into()),
                    actual: entry.prev_hash.clone().unwrap_or_else(|| "None".into()),
                });
            }

            let segment = Segment::of_filename(&entry.filename)
                .ok_or_else(|| StoreError::Untracked(entry.filename.clone()))?;
            let data = std::fs::read(self.root.join(segment.dir()).join(&entry.filename))?;
            let actual_hash = sha256_hex(&data);
            if actual_hash != entry.sha256 {
                return Err(StoreError::IntegrityMismatch {
                    expected: entry.sha256.clone(),
                    actual: actual_hash,
                });
            }

            prev_hash = Some(entry.sha256.clone());
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> &SaveMeta {
        &self.meta
    }

    fn write_segment<T: Serialize + ?Sized>(
        &mut self,
        segment: Segment,
        index: u32,
        value: &T,
    ) -> Result<(), StoreError> {
        let filename = segment.filename(index);
        let path = self.root.join(segment.dir()).join(&filename);

        let cbor_bytes = cbor_serialize(value)?;
        let compressed = zstd_compress(&cbor_bytes)?;

        let hash = sha256_hex(&compressed);
        let prev_hash = self.manifest.entries.last().map(|e| e.sha256.clone());

        std::fs::write(&path, &compressed)?;
        match segment {
            Segment::State => self.meta.state_count = index,
            Segment::Graph => self.meta.graph_count = index,
        }

        self.manifest.entries.push(ManifestEntry {
            filename,
            sha256: hash,
            prev_hash,
        });

        self.save_meta()?;
        self.save_manifest()?;
        tracing::debug!(segment = ?segment, index, bytes = compressed.len(), "segment written");
        Ok(())
    }

    fn read_segment<T: for<'de> Deserialize<'de>>(
        &self,
        segment: Segment,
        index: u32,
    ) -> Result<T, StoreError> {
        let filename = segment.filename(index);
        let compressed = std::fs::read(self.root.join(segment.dir()).join(&filename))?;

        self.verify_file_hash(&filename, &compressed)?;

        let cbor_bytes = zstd_decompress(&compressed)?;
        cbor_deserialize(&cbor_bytes)
    }

    fn verify_file_hash(&self, filename: &str, data: &[u8]) -> Result<(), StoreError> {
        let entry = self
            .manifest
            .entries
            .iter()
            .find(|e| e.filename == filename)
            .ok_or_else(|| StoreError::Untracked(filename.to_string()))?;
        let actual = sha256_hex(data);
        if entry.sha256 != actual {
            return Err(StoreError::IntegrityMismatch {
                expected: entry.sha256.clone(),
                actual,
            });
        }
        Ok(())
    }

    fn save_meta(&self) -> Result<(), StoreError> {
        let path = self.root.join(META_FILE);
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.meta)?;
        Ok(())
    }

    fn save_manifest(&self) -> Result<(), StoreError> {
        let path = self.root.join("integrity").join("manifest.json");
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.manifest)?;
        Ok(())
    }
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(data).map_err(|e| StoreError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), 3)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::VersionControlConfig;
    use crate::version::VersionMetadata;
    use woolsync_common::DeviceId;

    fn state(wool: &str) -> VersionedGameState {
        VersionedGameState::new(DeviceId::new("desk"), 5)
            .with_resource("wool", wool)
            .with_building("barn", 2, true)
            .with_setting("sound", serde_json::json!(true))
    }

    #[test]
    fn open_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SaveStore::open(tmp.path().join("save")).unwrap();
        assert_eq!(store.meta().state_count, 0);
        assert!(store.root().join("states").is_dir());
        assert!(store.root().join("graph").is_dir());
        assert!(store.root().join("integrity").is_dir());
        assert!(store.load_latest_state().unwrap().is_none());
        assert!(store.load_latest_graph().unwrap().is_none());
    }

    #[test]
    fn latest_state_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("save");
        {
            let mut store = SaveStore::open(&path).unwrap();
            store.save_state(&state("1")).unwrap();
            store.save_state(&state("2.5")).unwrap();
        }
        let store = SaveStore::open(&path).unwrap();
        assert_eq!(store.meta().state_count, 2);
        let loaded = store.load_latest_state().unwrap().unwrap();
        assert_eq!(loaded, state("2.5"));
        store.verify_integrity().unwrap();
    }

    #[test]
    fn failed_write_keeps_previous_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = SaveStore::open(tmp.path().join("save")).unwrap();
        store.save_state(&state("1")).unwrap();

        let blocker = store.root().join("states").join(Segment::State.filename(2));
        std::fs::create_dir(&blocker).unwrap();
        assert!(matches!(store.save_state(&state("2")), Err(StoreError::Io(_))));
        assert_eq!(store.meta().state_count, 1);
        assert_eq!(store.load_latest_state().unwrap(), Some(state("1")));

        std::fs::remove_dir(&blocker).unwrap();
        store.save_state(&state("3")).unwrap();
        assert_eq!(store.meta().state_count, 2);
        assert_eq!(store.load_latest_state().unwrap(), Some(state("3")));
        store.verify_integrity().unwrap();
    }

    #[test]
    fn graph_roundtrips_through_cbor() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = SaveStore::open(tmp.path().join("save")).unwrap();
        let mut graph = VersionControl::new(state("0"), VersionControlConfig::default());
        graph
            .create_version(state("9"), VersionMetadata::titled("progress"))
            .unwrap();
        graph.create_branch("alt", None).unwrap();
        store.save_graph(&graph).unwrap();

        let loaded = store.load_latest_graph().unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.head().unwrap().id, graph.head().unwrap().id);
        assert_eq!(loaded.branches().count(), 2);
    }

    #[test]
    fn corruption_fails_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("save");
        let mut store = SaveStore::open(&path).unwrap();
        store.save_state(&state("1")).unwrap();

        let seg = path.join("states").join("000001.state.cbor.zst");
        let mut data = std::fs::read(&seg).unwrap();
        if let Some(byte) = data.last_mut() {
            *byte ^= 0xff;
        }
        std::fs::write(&seg, &data).unwrap();

        let store = SaveStore::open(&path).unwrap();
        assert!(store.verify_integrity().is_err());
        assert!(matches!(
            store.load_latest_state(),
            Err(StoreError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn broken_hash_chain_is_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("save");
        let mut store = SaveStore::open(&path).unwrap();
        store.save_state(&state("1")).unwrap();
        store.save_state(&state("2")).unwrap();

        let manifest_path = path.join("integrity").join("manifest.json");
        let mut manifest: IntegrityManifest =
            serde_json::from_reader(std::fs::File::open(&manifest_path).unwrap()).unwrap();
        manifest.entries[1].prev_hash = Some("0".repeat(64));
        serde_json::to_writer_pretty(std::fs::File::create(&manifest_path).unwrap(), &manifest)
            .unwrap();

        let store = SaveStore::open(&path).unwrap();
        assert!(matches!(
            store.verify_integrity(),
            Err(StoreError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn schema_mismatch_fail_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("save");
        let _store = SaveStore::open(&path).unwrap();

        let meta_path = path.join(META_FILE);
        let mut meta: SaveMeta =
            serde_json::from_reader(std::fs::File::open(&meta_path).unwrap()).unwrap();
        meta.schema_version = 999;
        serde_json::to_writer_pretty(std::fs::File::create(&meta_path).unwrap(), &meta).unwrap();

        match SaveStore::open(&path) {
            Err(StoreError::SchemaMismatch {
                file_version,
                expected_version,
            }) => {
                assert_eq!(file_version, 999);
                assert_eq!(expected_version, SAVE_SCHEMA_VERSION);
            }
            Err(e) => panic!("expected SchemaMismatch, got: {e}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }
}
