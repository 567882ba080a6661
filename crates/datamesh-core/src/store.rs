//! Path Store - URI-addressed JSON tree
//!
//! One rooted tree of `serde_json::Value` behind a single lock.
//! Traversal is read-through: a missing segment becomes an empty mapping,
//! so anything that resolves a URI can assume a mapping exists there.

use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::{MeshError, Result};

/// Non-empty segments of a URI. `""`, `"/"` and `"//"` all name the root.
pub fn segments(uri: &str) -> impl Iterator<Item = &str> {
    uri.split('/').filter(|s| !s.is_empty())
}

/// Final segment of a URI (empty for the root)
pub fn last_segment(uri: &str) -> String {
    segments(uri).last().unwrap_or_default().to_string()
}

/// Canonical form of a URI: leading slash, no empty segments
pub fn normalize(uri: &str) -> String {
    let mut out = String::from("/");
    out.push_str(&segments(uri).collect::<Vec<_>>().join("/"));
    out
}

/// Deep merge `body` into `target`.
///
/// Mappings merge key by key; any other pairing overwrites `target`.
pub fn merge_value(target: &mut Value, body: Value) {
    match (target, body) {
        (Value::Object(dst), Value::Object(src)) => merge_maps(dst, src),
        (slot, body) => *slot = body,
    }
}

fn merge_maps(dst: &mut Map<String, Value>, src: Map<String, Value>) {
    for (key, value) in src {
        if let Some(existing) = dst.get_mut(&key) {
            if existing.is_object() && value.is_object() {
                merge_value(existing, value);
                continue;
            }
        }
        dst.insert(key, value);
    }
}

fn empty() -> Value {
    Value::Object(Map::new())
}

/// Replace a non-mapping with an empty mapping and borrow it as one
fn ensure_map(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = empty();
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just made an object"),
    }
}

/// Child mapping under `key`, created (or replacing a scalar) if needed
pub fn child_map<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    ensure_map(map.entry(key.to_string()).or_insert_with(empty))
}

/// Walk to `uri`, creating mappings (and replacing scalars) on the way
fn descend<'a>(mut node: &'a mut Value, uri: &str) -> &'a mut Value {
    for seg in segments(uri) {
        node = ensure_map(node)
            .entry(seg.to_string())
            .or_insert_with(empty);
    }
    node
}

/// Process-wide hierarchical store
pub struct Store {
    root: Mutex<Value>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            root: Mutex::new(empty()),
        }
    }

    /// Mapping at `uri`, created if missing. A scalar in the way is replaced.
    pub fn resolve(&self, uri: &str) -> Value {
        self.update(uri, |map| Value::Object(map.clone()))
    }

    /// Current value at `uri`.
    ///
    /// Missing segments are created as empty mappings; an existing
    /// non-mapping on the path is left alone and the read yields `null`.
    pub fn read(&self, uri: &str) -> Value {
        let mut root = self.root.lock();
        let mut node: &mut Value = &mut root;
        for seg in segments(uri) {
            let Value::Object(map) = node else {
                return Value::Null;
            };
            node = map.entry(seg.to_string()).or_insert_with(empty);
        }
        node.clone()
    }

    /// Merge `body` at `uri` and return the resulting value there
    pub fn merge(&self, uri: &str, body: Value) -> Result<Value> {
        if segments(uri).next().is_none() && !body.is_object() {
            return Err(MeshError::RootNotMapping);
        }

        let mut root = self.root.lock();
        let slot = descend(&mut root, uri);
        merge_value(slot, body);
        Ok(slot.clone())
    }

    /// Run `f` against the mapping at `uri` under the store lock
    pub fn update<F, R>(&self, uri: &str, f: F) -> R
    where
        F: FnOnce(&mut Map<String, Value>) -> R,
    {
        let mut root = self.root.lock();
        let slot = descend(&mut root, uri);
        f(ensure_map(slot))
    }

    /// Copy of the whole tree
    pub fn snapshot(&self) -> Value {
        self.root.lock().clone()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
