use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use woolsync_common::{DeviceId, Timestamp, VersionId};

use crate::checksum;
use crate::path::{self, PathError};
use crate::state::{StateError, StateField, VersionedGameState};

/// Bookkeeping fields diffed after the game fields, in this order.
const META_FIELDS: [&str; 4] = ["deviceId", "timestamp", "version", "syncMetadata"];

/// Errors from computing or replaying deltas.
#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("{op:?} at {path:?} carries no value")]
    MissingValue { op: OpKind, path: String },
    #[error("move to {0:?} has no source path")]
    MissingSource(String),
}

/// Kind of a field-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Update,
    Delete,
    Move,
}

/// One field-level change. `previous_value` is what the producer saw at
/// `path` before the change and is used to detect divergence on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaOperation {
    pub op: OpKind,
    pub path: String,
    /// Source path of a move.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub value: Option<Value>,
    pub previous_value: Option<Value>,
    pub timestamp: Timestamp,
    pub device_id: DeviceId,
}

/// An ordered list of operations turning `from_version` into `to_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDelta {
    pub operations: Vec<DeltaOperation>,
    pub checksum: String,
    pub from_version: VersionId,
    pub to_version: VersionId,
}

impl StateDelta {
    /// Build a delta and stamp the checksum over its operations.
    pub fn new(from_version: VersionId, to_version: VersionId, operations: Vec<DeltaOperation>) -> Self {
        let checksum = checksum::operations_checksum(&operations);
        Self {
            operations,
            checksum,
            from_version,
            to_version,
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// A place where the state being patched did not hold what the operation
/// expected, i.e. the target diverged from the delta's base.
#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    /// Index of the operation in the replayed list.
    pub index: usize,
    pub path: String,
    pub expected: Option<Value>,
    pub found: Option<Value>,
    /// What the operation wrote (`None` for deletes).
    pub incoming: Option<Value>,
}

/// Result of replaying operations.
#[derive(Debug, Clone)]
pub struct Applied {
    /// Patched and re-sealed state.
    pub state: VersionedGameState,
    pub divergences: Vec<Divergence>,
}

/// Minimal operations transforming `from` into `to`.
///
/// Keyed fields diff per key; a removed key whose exact value reappears under
/// an added key becomes a `move`. Sets and scalar fields are replaced whole.
/// Operations come out in canonical field order, keys sorted.
pub fn diff_states(
    from: &VersionedGameState,
    to: &VersionedGameState,
    device_id: &DeviceId,
    timestamp: Timestamp,
) -> Result<Vec<DeltaOperation>, DeltaError> {
    let mut a = from.to_value()?;
    let mut b = to.to_value()?;
    for v in [&mut a, &mut b] {
        if let Value::Object(map) = v {
            map.remove("checksum");
        }
    }
    let (Value::Object(a), Value::Object(b)) = (&a, &b) else {
        return Err(StateError::NotAnObject.into());
    };

    let mut differ = Differ {
        ops: Vec::new(),
        device_id,
        timestamp,
    };

    let mut fields: Vec<&str> = StateField::ALL.iter().map(|f| f.key()).collect();
    fields.extend(META_FIELDS);
    let mut extra: Vec<&str> = a
        .keys()
        .chain(b.keys())
        .map(String::as_str)
        .filter(|k| !fields.contains(k))
        .collect();
    extra.sort_unstable();
    extra.dedup();
    fields.extend(extra);

    for field in fields {
        let keyed = StateField::of_path(field).is_some_and(StateField::is_keyed);
        match (a.get(field), b.get(field)) {
            (Some(Value::Object(old)), Some(Value::Object(new))) if keyed => {
                differ.diff_map(field, old, new);
            }
            (old, new) if old != new => differ.push(
                OpKind::Update,
                field.to_string(),
                None,
                new.cloned(),
                old.cloned(),
            ),
            _ => {}
        }
    }
    Ok(differ.ops)
}

struct Differ<'a> {
    ops: Vec<DeltaOperation>,
    device_id: &'a DeviceId,
    timestamp: Timestamp,
}

impl Differ<'_> {
    fn push(
        &mut self,
        op: OpKind,
        path: String,
        from: Option<String>,
        value: Option<Value>,
        previous_value: Option<Value>,
    ) {
        self.ops.push(DeltaOperation {
            op,
            path,
            from,
            value,
            previous_value,
            timestamp: self.timestamp,
            device_id: self.device_id.clone(),
        });
    }

    fn diff_map(&mut self, field: &str, old: &Map<String, Value>, new: &Map<String, Value>) {
        let path = |key: &str| format!("{field}.{key}");

        let mut removed: Vec<&String> = old.keys().filter(|k| !new.contains_key(*k)).collect();
        let mut added: Vec<&String> = new.keys().filter(|k| !old.contains_key(*k)).collect();
        removed.sort();
        added.sort();

        let mut moved_from = Vec::new();
        let mut moved_to = Vec::new();
        for src in &removed {
            let target = added
                .iter()
                .find(|dst| !moved_to.contains(*dst) && new[dst.as_str()] == old[src.as_str()]);
            if let Some(dst) = target {
                self.push(
                    OpKind::Move,
                    path(dst),
                    Some(path(src)),
                    Some(old[src.as_str()].clone()),
                    None,
                );
                moved_from.push(*src);
                moved_to.push(*dst);
            }
        }

        let mut keys: Vec<&String> = old.keys().chain(new.keys()).collect();
        keys.sort();
        keys.dedup();
        for key in keys {
            if moved_from.contains(&key) || moved_to.contains(&key) {
                continue;
            }
            match (old.get(key), new.get(key)) {
                (Some(o), None) => self.push(OpKind::Delete, path(key), None, None, Some(o.clone())),
                (None, Some(n)) => self.push(OpKind::Add, path(key), None, Some(n.clone()), None),
                (Some(o), Some(n)) if o != n => {
                    self.push(OpKind::Update, path(key), None, Some(n.clone()), Some(o.clone()))
                }
                _ => {}
            }
        }
    }
}

/// Replay operations onto `base` in order.
///
/// Replay never stops at a divergence: the operation still wins and the
/// divergence is reported so the caller can decide (strict callers reject,
/// the sync engine turns them into conflicts). A target that already holds
/// the operation's outcome is not a divergence, which keeps re-application
/// of a delta harmless.
pub fn apply_operations(
    base: &VersionedGameState,
    operations: &[DeltaOperation],
) -> Result<Applied, DeltaError> {
    let mut root = base.to_value()?;
    let mut divergences = Vec::new();

    for (index, op) in operations.iter().enumerate() {
        let mut check = |path: &str, expected: Option<Value>, found: Option<Value>, incoming: Option<Value>| {
            if found != expected && found != incoming {
                divergences.push(Divergence {
                    index,
                    path: path.to_string(),
                    expected,
                    found,
                    incoming,
                });
            }
        };

        match op.op {
            OpKind::Add | OpKind::Update => {
                let value = op.value.clone().ok_or_else(|| DeltaError::MissingValue {
                    op: op.op,
                    path: op.path.clone(),
                })?;
                let found = path::get(&root, &op.path)?.cloned();
                let expected = match op.op {
                    OpKind::Add => None,
                    _ => op.previous_value.clone(),
                };
                check(&op.path, expected, found, Some(value.clone()));
                path::set(&mut root, &op.path, value)?;
            }
            OpKind::Delete => {
                let found = path::get(&root, &op.path)?.cloned();
                check(&op.path, op.previous_value.clone(), found, None);
                path::remove(&mut root, &op.path)?;
            }
            OpKind::Move => {
                let from = op
                    .from
                    .as_deref()
                    .ok_or_else(|| DeltaError::MissingSource(op.path.clone()))?;
                let source = path::get(&root, from)?.cloned();
                let value = op.value.clone().or_else(|| source.clone()).ok_or_else(|| {
                    DeltaError::MissingValue {
                        op: op.op,
                        path: op.path.clone(),
                    }
                })?;
                check(from, Some(value.clone()), source, None);
                let found = path::get(&root, &op.path)?.cloned();
                check(&op.path, None, found, Some(value.clone()));
                path::remove(&mut root, from)?;
                path::set(&mut root, &op.path, value)?;
            }
        }
    }

    let mut state = VersionedGameState::from_value(root)?;
    state.seal();
    Ok(Applied { state, divergences })
}
