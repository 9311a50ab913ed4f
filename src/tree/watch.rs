//! Watch types for live tree updates.

use super::TreePath;
use serde_json::Value;

/// Configuration for a watch.
#[derive(Clone, Debug)]
pub struct WatchConfig {
    /// Max buffered events before dropping the watcher.
    /// Default: 1024
    pub buffer_size: usize,

    /// Send an `Added` event for every existing child, then `CaughtUp`.
    pub replay_existing: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            replay_existing: false,
        }
    }
}

impl WatchConfig {
    /// Live events only.
    pub fn live(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            replay_existing: false,
        }
    }

    /// Existing children first, then live events.
    pub fn replay(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            replay_existing: true,
        }
    }
}

/// Events emitted for the direct children of a watched node.
#[derive(Clone, Debug, PartialEq)]
pub enum TreeEvent {
    /// A child appeared.
    Added { key: String, value: Value },

    /// A child's value changed.
    Changed { key: String, value: Value },

    /// A child disappeared. Carries its last value.
    Removed { key: String, value: Value },

    /// Replay of existing children finished.
    CaughtUp,

    /// The watch was dropped by the store.
    Dropped { reason: DropReason },
}

impl TreeEvent {
    /// Child key for the three change events.
    pub fn key(&self) -> Option<&str> {
        match self {
            TreeEvent::Added { key, .. }
            | TreeEvent::Changed { key, .. }
            | TreeEvent::Removed { key, .. } => Some(key),
            TreeEvent::CaughtUp | TreeEvent::Dropped { .. } => None,
        }
    }
}

/// Why a watch was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unwatched.
    Unwatched,
    /// Store-side failure.
    Error(String),
}

/// Unique identifier for a watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

/// Handle to a live watch.
#[derive(Debug)]
pub struct WatchHandle {
    pub id: WatchId,
    pub path: TreePath,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<TreeEvent>,
}

impl WatchHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<TreeEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<TreeEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<TreeEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
