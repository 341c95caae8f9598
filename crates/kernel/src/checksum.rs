//! Integrity checksums for states and deltas.
//!
//! Every participant (each device and the remote store) must hash with the
//! same algorithm or integrity checks fail spuriously. The encoding is the
//! JSON form with object keys sorted at every depth and no whitespace; the
//! hash is SHA-256 rendered as lowercase hex.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::delta::{DeltaOperation, StateDelta};
use crate::state::VersionedGameState;

/// Hash of a state, computed over every field except `checksum` itself.
pub fn generate_checksum(state: &VersionedGameState) -> String {
    let mut value = to_json(state);
    if let Value::Object(map) = &mut value {
        map.remove("checksum");
    }
    hash_value(&value)
}

/// Hash of an operation list, as carried in `StateDelta::checksum`.
pub fn operations_checksum(operations: &[DeltaOperation]) -> String {
    hash_value(&to_json(operations))
}

/// Recompute the checksum over `delta.operations` and compare.
pub fn validate_delta(delta: &StateDelta) -> bool {
    operations_checksum(&delta.operations) == delta.checksum
}

/// Recompute a state's checksum and compare with the stored one.
pub fn verify_state(state: &VersionedGameState) -> bool {
    generate_checksum(state) == state.checksum
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Value {
    // Plain-data types with string keys always serialize.
    serde_json::to_value(value).unwrap_or_else(|err| {
        tracing::error!(%err, "value not representable as JSON, hashing null");
        Value::Null
    })
}

fn hash_value(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    sha256_hex(out.as_bytes())
}

/// Canonical JSON: sorted keys, no insignificant whitespace.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
