//! Dotted paths into the JSON form of a state.
//!
//! A path is either a top-level field (`achievements`, `timestamp`) or a
//! field plus one map key (`resources.wool`). Only the first `.` splits, so
//! keys may themselves contain dots.

use serde_json::{Map, Value};

/// Errors from path navigation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("unknown top-level field {0:?}")]
    UnknownField(String),
    #[error("field {0:?} is not a keyed map")]
    NotAMap(String),
    #[error("state root is not an object")]
    RootNotObject,
}

/// Split a path into field and optional key.
pub fn split(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((field, key)) => (field, Some(key)),
        None => (path, None),
    }
}

fn root_map(root: &Value) -> Result<&Map<String, Value>, PathError> {
    root.as_object().ok_or(PathError::RootNotObject)
}

fn root_map_mut(root: &mut Value) -> Result<&mut Map<String, Value>, PathError> {
    root.as_object_mut().ok_or(PathError::RootNotObject)
}

/// Read the value at `path`. `Ok(None)` means the map key is absent.
pub fn get<'a>(root: &'a Value, path: &str) -> Result<Option<&'a Value>, PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    let (field, key) = split(path);
    let value = root_map(root)?
        .get(field)
        .ok_or_else(|| PathError::UnknownField(field.to_string()))?;
    match key {
        None => Ok(Some(value)),
        Some(key) => {
            let map = value
                .as_object()
                .ok_or_else(|| PathError::NotAMap(field.to_string()))?;
            Ok(map.get(key))
        }
    }
}

/// Write `value` at `path`, returning what was there.
pub fn set(root: &mut Value, path: &str, value: Value) -> Result<Option<Value>, PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    let (field, key) = split(path);
    let slot = root_map_mut(root)?
        .get_mut(field)
        .ok_or_else(|| PathError::UnknownField(field.to_string()))?;
    match key {
        None => Ok(Some(std::mem::replace(slot, value))),
        Some(key) => {
            let map = slot
                .as_object_mut()
                .ok_or_else(|| PathError::NotAMap(field.to_string()))?;
            Ok(map.insert(key.to_string(), value))
        }
    }
}

/// Remove the map entry at `path`. Top-level fields cannot be removed.
pub fn remove(root: &mut Value, path: &str) -> Result<Option<Value>, PathError> {
    let (field, key) = split(path);
    let Some(key) = key else {
        return Err(PathError::NotAMap(field.to_string()));
    };
    let slot = root_map_mut(root)?
        .get_mut(field)
        .ok_or_else(|| PathError::UnknownField(field.to_string()))?;
    let map = slot
        .as_object_mut()
        .ok_or_else(|| PathError::NotAMap(field.to_string()))?;
    Ok(map.remove(key))
}

/// Write `Some(value)` or remove on `None`.
pub fn put(root: &mut Value, path: &str, value: Option<Value>) -> Result<(), PathError> {
    match value {
        Some(value) => set(root, path, value).map(|_| ()),
        None => remove(root, path).map(|_| ()),
    }
}
