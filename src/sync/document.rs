//! Versioned preference document with dotted-path access.
//!
//! The document is a tree of JSON values addressed by dot-separated keys
//! (`"dashboard.layout.columns"`). Mutations go through [`PreferenceDocument::set`]
//! and friends, which enforce the deep-equality no-op short circuit. Whether
//! a mutation counts as unsaved is a policy decision, so dirty-key tracking
//! is explicit via [`PreferenceDocument::mark_dirty`].

use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// In-memory preference tree plus version counter and dirty-key set.
///
/// The version is the last server-confirmed version; it only moves forward.
/// Dirty keys are top-level keys the owner has marked as carrying local
/// changes not yet confirmed persisted.
#[derive(Debug, Clone, Default)]
pub struct PreferenceDocument {
    /// Root of the preference tree
    root: Map<String, Value>,
    /// Last server-confirmed version
    version: u64,
    /// Top-level keys with unsaved local changes
    dirty: BTreeSet<String>,
}

impl PreferenceDocument {
    /// Create a new empty document at version 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a document from a known tree and version (cache hydration,
    /// authoritative fetch)
    pub fn from_parts(root: Map<String, Value>, version: u64) -> Self {
        Self {
            root,
            version,
            dirty: BTreeSet::new(),
        }
    }

    /// Last server-confirmed version
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Root map of the preference tree
    pub fn root(&self) -> &Map<String, Value> {
        &self.root
    }

    /// Full copy of the tree as a JSON object value
    pub fn snapshot(&self) -> Value {
        Value::Object(self.root.clone())
    }

    /// Top-level keys with unsaved local changes
    pub fn dirty_keys(&self) -> &BTreeSet<String> {
        &self.dirty
    }

    /// Whether any top-level key has unsaved local changes
    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Read a value by dotted path
    pub fn get(&self, key: &str) -> Option<&Value> {
        let segments = split_path(key)?;
        let mut node: &Value = self.root.get(segments[0])?;
        for seg in &segments[1..] {
            node = node.as_object()?.get(*seg)?;
        }
        Some(node)
    }

    /// Read a value by dotted path, falling back to `default` when any path
    /// segment is absent
    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).cloned().unwrap_or(default)
    }

    /// Read a value by dotted path and deserialize it into a concrete type
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Set a value by dotted path.
    ///
    /// Intermediate objects are created on demand; non-object intermediates
    /// are replaced. Returns the affected top-level key, or `None` when the
    /// path is invalid or the value is deep-equal to the current one (no-op).
    pub fn set(&mut self, key: &str, value: Value) -> Option<String> {
        let segments = split_path(key)?;

        if self.get(key) == Some(&value) {
            return None;
        }

        let top = segments[0].to_string();
        let (last, parents) = segments.split_last()?;

        let mut node = &mut self.root;
        for seg in parents {
            let entry = node
                .entry(seg.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            let Value::Object(map) = entry else {
                unreachable!()
            };
            node = map;
        }
        node.insert(last.to_string(), value);

        Some(top)
    }

    /// Apply a batch of dotted-path assignments, returning the union of
    /// affected top-level keys (deep-equal entries are skipped)
    pub fn apply_many<I>(&mut self, entries: I) -> Vec<String>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut changed = BTreeSet::new();
        for (key, value) in entries {
            if let Some(top) = self.set(&key, value) {
                changed.insert(top);
            }
        }
        changed.into_iter().collect()
    }

    /// Remove a value by dotted path. Returns the affected top-level key, or
    /// `None` when nothing was removed.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let segments = split_path(key)?;
        let top = segments[0].to_string();
        let (last, parents) = segments.split_last()?;

        let mut node = &mut self.root;
        for seg in parents {
            node = node.get_mut(*seg)?.as_object_mut()?;
        }
        node.remove(*last)?;

        Some(top)
    }

    /// Explicitly mark a top-level key as carrying unsaved changes
    pub fn mark_dirty(&mut self, top_key: impl Into<String>) {
        self.dirty.insert(top_key.into());
    }

    /// Replace the whole tree and version (remote update or authoritative
    /// fetch). Returns the top-level keys that differ between the old and new
    /// trees. Dirty state is untouched; callers clear it when appropriate.
    pub fn replace(&mut self, root: Map<String, Value>, version: u64) -> Vec<String> {
        let changed = changed_top_level(&self.root, &root);
        self.root = root;
        self.version = version;
        changed
    }

    /// Record a confirmed persistence: adopt the server version and clear
    /// only the keys that were part of the saved snapshot. Keys dirtied while
    /// the save was in flight stay dirty.
    pub fn confirm_saved(&mut self, saved_keys: &[String], version: u64) {
        for key in saved_keys {
            self.dirty.remove(key);
        }
        self.version = version;
    }

    /// Drop all dirty-key state (conflict recovery, identity switch)
    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    /// Reset to an empty document at version 0
    pub fn reset(&mut self) {
        self.root.clear();
        self.version = 0;
        self.dirty.clear();
    }
}

/// Split a dotted key into segments; any empty segment makes the whole path
/// invalid
fn split_path(key: &str) -> Option<Vec<&str>> {
    if key.is_empty() {
        return None;
    }
    let segments: Vec<&str> = key.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments)
}

/// Symmetric difference of top-level keys between two trees: keys present in
/// exactly one side, plus keys whose values differ
pub fn changed_top_level(a: &Map<String, Value>, b: &Map<String, Value>) -> Vec<String> {
    let mut changed = BTreeSet::new();
    for (key, value) in a {
        if b.get(key) != Some(value) {
            changed.insert(key.clone());
        }
    }
    for key in b.keys() {
        if !a.contains_key(key) {
            changed.insert(key.clone());
        }
    }
    changed.into_iter().collect()
}
