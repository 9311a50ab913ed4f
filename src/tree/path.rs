//! Tree paths and the catalog / view layout.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::types::{ChannelId, DeviceId, RoomId, Subtree, ViewTarget};
use std::fmt;

/// Segment path into the tree. The empty path is the root.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TreePath(Vec<String>);

impl TreePath {
    pub fn root() -> Self {
        TreePath(Vec::new())
    }

    /// Parse `a/b/c`. Leading and trailing slashes are ignored; empty inner
    /// segments are rejected.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let segments: Vec<String> = trimmed.split('/').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(SyncError::InvalidPath(s.to_string()));
        }
        Ok(TreePath(segments))
    }

    /// Append one segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        TreePath(segments)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(TreePath(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// True if `prefix` is this path or one of its ancestors.
    pub fn starts_with(&self, prefix: &TreePath) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Debug for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreePath({})", self)
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// Where catalog and view nodes live in the tree.
///
/// ```text
/// catalog/{device}                      name, room
/// catalog/{device}/{subtree}/{sub}      { channelID }
/// catalog/{device}/available/{sub}      { name, widget }
/// catalog/{device}/channels/{chan}      { type }
/// views/{room}/{device}/{target}/{sub}  { name, widget }
/// ```
#[derive(Clone, Debug)]
pub struct Layout {
    catalog: TreePath,
    views: TreePath,
}

/// Catalog child holding the mirror of the device's `available` view.
pub const AVAILABLE: &str = "available";

/// Catalog child describing the device's channels.
pub const CHANNELS: &str = "channels";

/// Device metadata fields.
pub const NAME_FIELD: &str = "name";
pub const ROOM_FIELD: &str = "room";

impl Layout {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            catalog: TreePath::root().child(config.catalog_root.clone()),
            views: TreePath::root().child(config.views_root.clone()),
        }
    }

    pub fn catalog_root(&self) -> &TreePath {
        &self.catalog
    }

    pub fn views_root(&self) -> &TreePath {
        &self.views
    }

    pub fn device(&self, device: &DeviceId) -> TreePath {
        self.catalog.child(device.as_str())
    }

    pub fn subtree(&self, device: &DeviceId, subtree: Subtree) -> TreePath {
        self.device(device).child(subtree.as_str())
    }

    pub fn binding(&self, device: &DeviceId, subtree: Subtree, subscription: &str) -> TreePath {
        self.subtree(device, subtree).child(subscription)
    }

    pub fn catalog_available(&self, device: &DeviceId) -> TreePath {
        self.device(device).child(AVAILABLE)
    }

    pub fn channel(&self, device: &DeviceId, channel: &ChannelId) -> TreePath {
        self.device(device).child(CHANNELS).child(channel.as_key())
    }

    pub fn room(&self, room: &RoomId) -> TreePath {
        self.views.child(room.as_str())
    }

    pub fn view_device(&self, room: &RoomId, device: &DeviceId) -> TreePath {
        self.room(room).child(device.as_str())
    }

    pub fn view(&self, room: &RoomId, device: &DeviceId, target: ViewTarget) -> TreePath {
        self.view_device(room, device).child(target.as_str())
    }
}
