//! # Room Sync
//!
//! Keeps a per-room dashboard view consistent with a per-device settings
//! catalog held in a hierarchical, live-updating tree store.
//!
//! ## Core Concepts
//!
//! - **Catalog**: source of truth, one node per device with four subscription subtrees
//! - **Room view**: derived cache of `available` and `active` entries per room and device
//! - **Reconciliation**: idempotent diff-and-apply of catalog names onto a view subtree
//! - **Propagation**: one session thread per device reacting to live changes
//! - **Toggle**: the explicit user action moving a subscription between active and inactive
//!
//! ## Example
//!
//! ```ignore
//! use roomsync::{Engine, MemoryTree, SyncConfig, TreeStore};
//! use std::sync::Arc;
//!
//! let store: Arc<dyn TreeStore> = Arc::new(MemoryTree::load_json_file("dump.json")?);
//! let engine = Engine::new(store, SyncConfig::default());
//!
//! // Full resync, then live propagation
//! let summary = engine.start()?;
//! println!("{} writes at startup", summary.writes());
//!
//! // Activate a subscription
//! engine.toggle(&"0c2a69000001".into(), "sensor_lightLevel")?;
//!
//! // What the room shows
//! for panel in engine.dashboard().panels(&"maxwell".into())? {
//!     println!("{}: {:?}", panel.title, panel.temp);
//! }
//! ```

pub mod admin;
pub mod catalog;
pub mod config;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod propagate;
pub mod reconcile;
pub mod toggle;
pub mod tree;
pub mod types;

// Re-exports
pub use admin::{validate_agent_id, DeviceAdmin, DeviceConfig};
pub use catalog::CatalogReader;
pub use config::SyncConfig;
pub use dashboard::{
    ActiveSubscription, ChannelCard, ChannelColumn, Dashboard, DashboardUpdate, DevicePanel,
    RoomFeed,
};
pub use engine::Engine;
pub use error::{Result, SyncError};
pub use propagate::{Propagator, SyncEvent};
pub use reconcile::{
    default_display_name, humanize, ReconcilePlan, ReconcileReport, Reconciler, ResyncReport,
    ResyncSummary,
};
pub use toggle::{ToggleHandler, ToggleOutcome};
pub use tree::{
    DropReason, Layout, MemoryTree, TreeEvent, TreePath, TreeStore, TreeStoreExt, WatchConfig,
    WatchHandle, WatchId,
};
pub use types::*;
