//! Hierarchical key-value store contract.
//!
//! The sync engine never talks to a concrete database. It consumes the
//! [`TreeStore`] trait:
//! - point reads and shallow key listings
//! - upserts that merge object fields
//! - deletions
//! - watches on any node, delivering child-level change events
//!
//! [`MemoryTree`] is the in-process implementation used by tests and by
//! embedders that mirror a remote tree locally.
//!
//! # Example
//!
//! ```ignore
//! let tree = MemoryTree::new();
//! let path = TreePath::parse("catalog/dev01/activeStreams")?;
//! let handle = tree.watch(&path, WatchConfig::default())?;
//!
//! tree.write(&path.child("sensor_temp"), json!({"channelID": 1}))?;
//!
//! match handle.recv() {
//!     Ok(TreeEvent::Added { key, .. }) => println!("new subscription {key}"),
//!     Ok(TreeEvent::Dropped { reason }) => eprintln!("watch dropped: {reason:?}"),
//!     _ => {}
//! }
//! ```

mod memory;
mod path;
mod watch;

pub use memory::MemoryTree;
pub use path::{Layout, TreePath, AVAILABLE, CHANNELS, NAME_FIELD, ROOM_FIELD};
pub use watch::{DropReason, TreeEvent, WatchConfig, WatchHandle, WatchId};

use crate::error::{Result, SyncError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;

/// Contract of the remote tree store.
///
/// Every operation touches exactly one node. There are no multi-key
/// transactions.
pub trait TreeStore: Send + Sync {
    /// One-shot read of a node. Absent nodes are `Ok(None)`.
    fn read(&self, path: &TreePath) -> Result<Option<Value>>;

    /// Upsert a node. Objects are merged field by field into an existing
    /// object; a `null` field removes that child. Anything else replaces.
    fn write(&self, path: &TreePath, value: Value) -> Result<()>;

    /// Remove a node and everything below it.
    fn delete(&self, path: &TreePath) -> Result<()>;

    /// Start watching the children of a node.
    fn watch(&self, path: &TreePath, config: WatchConfig) -> Result<WatchHandle>;

    /// Release a watch. Unknown ids are ignored.
    fn unwatch(&self, id: WatchId);

    /// Shallow listing of a node's child keys.
    fn keys(&self, path: &TreePath) -> Result<BTreeSet<String>> {
        Ok(match self.read(path)? {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => BTreeSet::new(),
        })
    }
}

/// Typed helpers over any [`TreeStore`].
pub trait TreeStoreExt: TreeStore {
    /// Read and deserialize a node.
    fn read_as<T: DeserializeOwned>(&self, path: &TreePath) -> Result<Option<T>> {
        match self.read(path)? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                SyncError::MalformedValue {
                    path: path.to_string(),
                    reason: e.to_string(),
                }
            }),
        }
    }

    /// Serialize and upsert a node.
    fn write_as<T: Serialize>(&self, path: &TreePath, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.write(path, value)
    }
}

impl<S: TreeStore + ?Sized> TreeStoreExt for S {}
