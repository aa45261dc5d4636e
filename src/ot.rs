use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum OtError {
    #[error("Empty operation path")]
    EmptyPath,
    #[error("Path {0} does not exist")]
    PathNotFound(String),
    #[error("Index {index} out of bounds (length {len}) at {path}")]
    IndexOutOfBounds { path: String, index: usize, len: usize },
    #[error("Expected {expected} at {path}")]
    TypeMismatch { path: String, expected: &'static str },
    #[error("Value at {0} does not match the removed value")]
    ValueMismatch(String),
    #[error("Component at {0} has no recognised operation")]
    InvalidComponent(String),
}

/// One step of a json0 path: an array index or an object key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl PathSegment {
    fn as_key(&self) -> String {
        match self {
            PathSegment::Index(i) => i.to_string(),
            PathSegment::Key(k) => k.clone(),
        }
    }

    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathSegment::Index(i) => Some(*i),
            PathSegment::Key(k) => k.parse().ok(),
        }
    }

    pub fn is_key(&self, key: &str) -> bool {
        matches!(self, PathSegment::Key(k) if k == key)
    }
}

impl From<usize> for PathSegment {
    fn from(index: usize) -> Self {
        PathSegment::Index(index)
    }
}

impl From<&str> for PathSegment {
    fn from(key: &str) -> Self {
        PathSegment::Key(key.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(key: String) -> Self {
        PathSegment::Key(key)
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PathSegment::Index(i) => write!(f, "{i}"),
            PathSegment::Key(k) => write!(f, "{k:?}"),
        }
    }
}

/// A single json0 operation component.
///
/// Exactly one family of fields is expected per component: list (`li`/`ld`),
/// object (`oi`/`od`) or string (`si`/`sd`).
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct OpComponent {
    pub p: Vec<PathSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub li: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ld: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oi: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub od: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub si: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sd: Option<String>,
}

impl OpComponent {
    pub fn list_insert(p: Vec<PathSegment>, value: Value) -> Self {
        Self { p, li: Some(value), ..Self::default() }
    }

    pub fn list_replace(p: Vec<PathSegment>, old: Value, new: Value) -> Self {
        Self { p, li: Some(new), ld: Some(old), ..Self::default() }
    }

    pub fn object_insert(p: Vec<PathSegment>, value: Value) -> Self {
        Self { p, oi: Some(value), ..Self::default() }
    }

    pub fn object_delete(p: Vec<PathSegment>, old: Value) -> Self {
        Self { p, od: Some(old), ..Self::default() }
    }

    pub fn object_replace(p: Vec<PathSegment>, old: Value, new: Value) -> Self {
        Self { p, oi: Some(new), od: Some(old), ..Self::default() }
    }

    pub fn string_insert(p: Vec<PathSegment>, text: &str) -> Self {
        Self { p, si: Some(text.to_string()), ..Self::default() }
    }

    pub fn string_delete(p: Vec<PathSegment>, text: &str) -> Self {
        Self { p, sd: Some(text.to_string()), ..Self::default() }
    }
}

fn render_path(path: &[PathSegment]) -> String {
    let parts: Vec<String> = path.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

fn descend<'a>(mut value: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value, OtError> {
    for (depth, segment) in path.iter().enumerate() {
        let next = match value {
            Value::Array(items) => segment.as_index().and_then(|i| items.get_mut(i)),
            Value::Object(map) => map.get_mut(&segment.as_key()),
            _ => None,
        };
        value = next.ok_or_else(|| OtError::PathNotFound(render_path(&path[..=depth])))?;
    }
    Ok(value)
}

fn apply_list(container: &mut Value, op: &OpComponent, last: &PathSegment) -> Result<(), OtError> {
    let path = render_path(&op.p);
    let Value::Array(items) = container else {
        return Err(OtError::TypeMismatch { path, expected: "array" });
    };
    let index = last
        .as_index()
        .ok_or_else(|| OtError::TypeMismatch { path: path.clone(), expected: "array index" })?;

    if let Some(expected) = &op.ld {
        let current = items.get(index).ok_or(OtError::IndexOutOfBounds {
            path: path.clone(),
            index,
            len: items.len(),
        })?;
        if current != expected {
            return Err(OtError::ValueMismatch(path));
        }
        match &op.li {
            Some(value) => items[index] = value.clone(),
            None => {
                items.remove(index);
            }
        }
        return Ok(());
    }

    if let Some(value) = &op.li {
        if index > items.len() {
            return Err(OtError::IndexOutOfBounds { path, index, len: items.len() });
        }
        items.insert(index, value.clone());
    }
    Ok(())
}

fn apply_object(
    container: &mut Value,
    op: &OpComponent,
    last: &PathSegment,
) -> Result<(), OtError> {
    let path = render_path(&op.p);
    let Value::Object(map) = container else {
        return Err(OtError::TypeMismatch { path, expected: "object" });
    };
    let key = last.as_key();

    if let Some(expected) = &op.od {
        match map.get(&key) {
            Some(current) if current == expected => {}
            Some(_) => return Err(OtError::ValueMismatch(path)),
            None => return Err(OtError::PathNotFound(path)),
        }
    }
    match &op.oi {
        Some(value) => {
            map.insert(key, value.clone());
        }
        None => {
            map.remove(&key);
        }
    }
    Ok(())
}

fn apply_string(
    container: &mut Value,
    op: &OpComponent,
    last: &PathSegment,
) -> Result<(), OtError> {
    let path = render_path(&op.p);
    let Value::String(text) = container else {
        return Err(OtError::TypeMismatch { path, expected: "string" });
    };
    let offset = last
        .as_index()
        .ok_or_else(|| OtError::TypeMismatch { path: path.clone(), expected: "string offset" })?;

    let mut chars: Vec<char> = text.chars().collect();
    if offset > chars.len() {
        return Err(OtError::IndexOutOfBounds { path, index: offset, len: chars.len() });
    }
    if let Some(deleted) = &op.sd {
        let count = deleted.chars().count();
        let end = offset + count;
        if end > chars.len() || !chars[offset..end].iter().copied().eq(deleted.chars()) {
            return Err(OtError::ValueMismatch(path));
        }
        chars.drain(offset..end);
    }
    if let Some(inserted) = &op.si {
        chars.splice(offset..offset, inserted.chars());
    }
    *text = chars.into_iter().collect();
    Ok(())
}

fn apply_component(doc: &mut Value, op: &OpComponent) -> Result<(), OtError> {
    let (last, parent) = op.p.split_last().ok_or(OtError::EmptyPath)?;
    let container = descend(doc, parent)?;

    if op.li.is_some() || op.ld.is_some() {
        apply_list(container, op, last)
    } else if op.oi.is_some() || op.od.is_some() {
        apply_object(container, op, last)
    } else if op.si.is_some() || op.sd.is_some() {
        apply_string(container, op, last)
    } else {
        Err(OtError::InvalidComponent(render_path(&op.p)))
    }
}

/// Applies every component of `op` to `doc`. Either all components apply or
/// the document is left untouched.
pub fn apply(doc: &mut Value, op: &[OpComponent]) -> Result<(), OtError> {
    let mut next = doc.clone();
    for component in op {
        apply_component(&mut next, component)?;
    }
    *doc = next;
    Ok(())
}
