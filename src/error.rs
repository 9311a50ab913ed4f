//! Error types for the sync engine.

use thiserror::Error;

/// Main error type for sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    #[error("Malformed value at {path}: {reason}")]
    MalformedValue { path: String, reason: String },

    #[error("Invalid subtree name: {0:?}")]
    InvalidSubtree(String),

    #[error("Invalid agent id: {0:?}")]
    InvalidAgentId(String),

    #[error("Device not found in catalog: {0}")]
    UnknownDevice(String),

    #[error("Device has no name or room yet: {0}")]
    NotProvisioned(String),

    #[error("Subscription {subscription} not found for device {device}")]
    UnknownSubscription { device: String, subscription: String },

    #[error("Widget {widget} assigned to more than one subscription")]
    DuplicateWidget { widget: String },

    #[error("Watch closed")]
    WatchClosed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            SyncError::Deserialization(e.to_string())
        } else {
            SyncError::Serialization(e.to_string())
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
