//! In-memory tree store with child-level watches.

use super::{DropReason, TreeEvent, TreePath, TreeStore, WatchConfig, WatchHandle, WatchId};
use crate::error::{Result, SyncError};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Internal watch state.
struct Watcher {
    path: TreePath,
    sender: Sender<TreeEvent>,
}

impl Watcher {
    /// A mutation at `path` can change this watcher's children.
    fn is_affected_by(&self, path: &TreePath) -> bool {
        path.starts_with(&self.path) || self.path.starts_with(path)
    }
}

/// Tree store held entirely in memory.
///
/// Mutations and event delivery happen under one write lock, so every
/// watcher sees events in mutation order.
pub struct MemoryTree {
    /// Root node, always an object.
    root: RwLock<Value>,
    /// Active watches by ID.
    watchers: RwLock<HashMap<WatchId, Watcher>>,
    /// Counter for generating watch IDs.
    next_id: AtomicU64,
    /// When false every operation fails with `StoreUnavailable`.
    online: AtomicBool,
    /// Number of write/delete calls accepted.
    mutations: AtomicU64,
}

impl MemoryTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::from_json(Value::Object(Map::new()))
    }

    /// Create a tree seeded with a JSON dump.
    pub fn from_json(value: Value) -> Self {
        let root = match normalize(value) {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(Map::new()),
        };
        Self {
            root: RwLock::new(root),
            watchers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            online: AtomicBool::new(true),
            mutations: AtomicU64::new(0),
        }
    }

    /// Load a JSON dump from disk.
    pub fn load_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let value: Value = serde_json::from_slice(&bytes)?;
        Ok(Self::from_json(value))
    }

    /// Snapshot of the whole tree.
    pub fn export_json(&self) -> Value {
        self.root.read().clone()
    }

    /// Simulate losing or regaining the connection to the store.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of write and delete calls accepted so far.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Number of live watches.
    pub fn watch_count(&self) -> usize {
        self.watchers.read().len()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::StoreUnavailable("memory tree is offline".to_string()))
        }
    }

    /// Apply a mutation and notify affected watchers.
    fn mutate<F>(&self, path: &TreePath, apply: F) -> Result<()>
    where
        F: FnOnce(&mut Value),
    {
        self.ensure_online()?;

        let mut root = self.root.write();

        let affected: Vec<(WatchId, TreePath)> = self
            .watchers
            .read()
            .iter()
            .filter(|(_, w)| w.is_affected_by(path))
            .map(|(id, w)| (*id, w.path.clone()))
            .collect();

        let before: Vec<Map<String, Value>> = affected
            .iter()
            .map(|(_, watched)| children_of(&root, watched))
            .collect();

        apply(&mut root);
        if !root.is_object() {
            *root = Value::Object(Map::new());
        }
        self.mutations.fetch_add(1, Ordering::SeqCst);

        let mut pending = Vec::new();
        for ((id, watched), before) in affected.iter().zip(before) {
            let after = children_of(&root, watched);
            let events = diff_children(before, &after);
            if !events.is_empty() {
                pending.push((*id, events));
            }
        }

        // Delivered before the write lock is released.
        self.deliver(pending);
        Ok(())
    }

    /// Send events to watchers. Drops watchers that fail to receive.
    fn deliver(&self, pending: Vec<(WatchId, Vec<TreeEvent>)>) {
        if pending.is_empty() {
            return;
        }

        let mut to_remove = Vec::new();

        {
            let watchers = self.watchers.read();
            for (id, events) in pending {
                let Some(watcher) = watchers.get(&id) else {
                    continue;
                };
                for event in events {
                    match watcher.sender.try_send(event) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            to_remove.push((id, DropReason::BufferOverflow));
                            break;
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            to_remove.push((id, DropReason::Unwatched));
                            break;
                        }
                    }
                }
            }
        }

        if !to_remove.is_empty() {
            let mut watchers = self.watchers.write();
            for (id, reason) in to_remove {
                if let Some(watcher) = watchers.remove(&id) {
                    tracing::debug!(watch = ?id, path = %watcher.path, ?reason, "removing watcher");
                    // Might fail, that's ok
                    let _ = watcher.sender.try_send(TreeEvent::Dropped { reason });
                }
            }
        }
    }
}

impl Default for MemoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeStore for MemoryTree {
    fn read(&self, path: &TreePath) -> Result<Option<Value>> {
        self.ensure_online()?;
        let root = self.root.read();
        Ok(node_at(&root, path).filter(|v| !v.is_null()).cloned())
    }

    fn write(&self, path: &TreePath, value: Value) -> Result<()> {
        self.mutate(path, |root| write_at(root, path.segments(), value))
    }

    fn delete(&self, path: &TreePath) -> Result<()> {
        self.mutate(path, |root| delete_at(root, path.segments()))
    }

    fn watch(&self, path: &TreePath, config: WatchConfig) -> Result<WatchHandle> {
        self.ensure_online()?;

        // Hold the read lock so no mutation slips between replay and registration.
        let root = self.root.read();

        let id = WatchId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size.max(1));

        if config.replay_existing {
            let existing = children_of(&root, path);
            if existing.len() + 1 > config.buffer_size.max(1) {
                return Err(SyncError::InvalidOperation(format!(
                    "watch buffer of {} cannot replay {} children of {}",
                    config.buffer_size,
                    existing.len(),
                    path
                )));
            }
            for (key, value) in existing {
                let _ = sender.try_send(TreeEvent::Added { key, value });
            }
            let _ = sender.try_send(TreeEvent::CaughtUp);
        }

        self.watchers.write().insert(
            id,
            Watcher {
                path: path.clone(),
                sender,
            },
        );

        Ok(WatchHandle {
            id,
            path: path.clone(),
            receiver,
        })
    }

    fn unwatch(&self, id: WatchId) {
        let mut watchers = self.watchers.write();
        if let Some(watcher) = watchers.remove(&id) {
            // Best effort
            let _ = watcher.sender.try_send(TreeEvent::Dropped {
                reason: DropReason::Unwatched,
            });
        }
    }
}

fn node_at<'a>(root: &'a Value, path: &TreePath) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.segments() {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn children_of(root: &Value, path: &TreePath) -> Map<String, Value> {
    match node_at(root, path) {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    }
}

fn diff_children(before: Map<String, Value>, after: &Map<String, Value>) -> Vec<TreeEvent> {
    let mut events = Vec::new();
    for (key, old) in &before {
        match after.get(key) {
            None => events.push(TreeEvent::Removed {
                key: key.clone(),
                value: old.clone(),
            }),
            Some(new) if new != old => events.push(TreeEvent::Changed {
                key: key.clone(),
                value: new.clone(),
            }),
            Some(_) => {}
        }
    }
    for (key, new) in after {
        if !before.contains_key(key) {
            events.push(TreeEvent::Added {
                key: key.clone(),
                value: new.clone(),
            });
        }
    }
    events
}

fn is_empty_node(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Drop nulls and empty objects below the top level.
fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize(v)))
                .filter(|(_, v)| !is_empty_node(v))
                .collect(),
        ),
        other => other,
    }
}

fn merge_into(node: &mut Value, value: Value) {
    match (node, value) {
        (Value::Object(existing), Value::Object(fields)) => {
            for (key, field) in fields {
                let field = normalize(field);
                if is_empty_node(&field) {
                    existing.remove(&key);
                } else {
                    existing.insert(key, field);
                }
            }
        }
        (node, value) => *node = normalize(value),
    }
}

fn write_at(node: &mut Value, segments: &[String], value: Value) {
    match segments.split_first() {
        None => merge_into(node, value),
        Some((head, rest)) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                let child = map.entry(head.clone()).or_insert(Value::Null);
                write_at(child, rest, value);
                if is_empty_node(child) {
                    map.remove(head);
                }
            }
        }
    }
}

fn delete_at(node: &mut Value, segments: &[String]) {
    match segments.split_first() {
        None => *node = Value::Null,
        Some((head, rest)) => {
            if let Value::Object(map) = node {
                if let Some(child) = map.get_mut(head) {
                    delete_at(child, rest);
                    if is_empty_node(child) {
                        map.remove(head);
                    }
                }
            }
        }
    }
}
