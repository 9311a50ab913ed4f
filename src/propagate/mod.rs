//! Live propagation between the catalog and the room view.
//!
//! Each attached device gets its own session thread holding:
//! - one watch per catalog subtree, re-running reconciliation on change
//! - one watch on the device metadata, following renames and relocations
//! - one watch on the room's `available` view, mirroring additions and
//!   removals into the catalog `available` node
//!
//! Sessions share nothing but the store. Events of one device are handled in
//! delivery order; different devices run concurrently.
//!
//! # Example
//!
//! ```ignore
//! let propagator = Propagator::new(store, &SyncConfig::default());
//! let events = propagator.events();
//! propagator.attach(&DeviceId::from("0c2a69000000"))?;
//!
//! while let Ok(event) = events.recv() {
//!     match event {
//!         SyncEvent::Reconciled { report } => println!("{} writes", report.writes()),
//!         SyncEvent::Failed { device, error } => eprintln!("{device}: {error}"),
//!         _ => {}
//!     }
//! }
//! ```

mod session;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::tree::{Layout, TreeStore};
use crate::types::DeviceId;
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use session::{DeviceSession, SessionContext};
use std::collections::HashMap;
use std::sync::Arc;

/// State-change descriptions emitted by the propagator.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    /// Session started and its initial resync finished.
    Attached { device: DeviceId },

    /// A view subtree was brought in line with the catalog.
    Reconciled { report: ReconcileReport },

    /// A view entry appeared first; its catalog mirror was created.
    CatalogSeeded {
        device: DeviceId,
        subscription: String,
    },

    /// A view entry was removed; its catalog mirror was deleted.
    CatalogPruned {
        device: DeviceId,
        subscription: String,
    },

    /// The device has no name or room yet. Retried on the next notification.
    Deferred { device: DeviceId },

    /// A reaction failed. The next trigger reconciles again.
    Failed { device: DeviceId, error: String },

    /// Session stopped.
    Detached { device: DeviceId },
}

/// Owns the per-device sessions.
pub struct Propagator {
    context: SessionContext,
    sessions: Mutex<HashMap<DeviceId, DeviceSession>>,
    events: Receiver<SyncEvent>,
}

impl Propagator {
    pub fn new(store: Arc<dyn TreeStore>, config: &SyncConfig) -> Self {
        let layout = Layout::new(config);
        let (sender, events) = bounded(config.event_buffer_size.max(1));
        let context = SessionContext {
            reconciler: Reconciler::new(Arc::clone(&store), layout.clone()),
            store,
            layout,
            watch_buffer_size: config.watch_buffer_size,
            replay_view: config.replay_view_on_attach,
            events: sender,
        };
        Self {
            context,
            sessions: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Receiver for outbound sync events. Clones share one queue.
    pub fn events(&self) -> Receiver<SyncEvent> {
        self.events.clone()
    }

    /// Start a session for `device`. Returns false if one is already running.
    ///
    /// Watches are registered before this returns, so no change made after
    /// `attach` is missed.
    pub fn attach(&self, device: &DeviceId) -> Result<bool> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(device) {
            return Ok(false);
        }
        let session = DeviceSession::start(device.clone(), self.context.clone())?;
        sessions.insert(device.clone(), session);
        tracing::debug!(device = %device, "attached device session");
        Ok(true)
    }

    /// Stop a device's session. Work already triggered runs to completion.
    pub fn detach(&self, device: &DeviceId) -> bool {
        let session = self.sessions.lock().remove(device);
        match session {
            Some(session) => {
                session.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every session.
    pub fn detach_all(&self) {
        let sessions: Vec<DeviceSession> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.stop();
        }
    }

    pub fn is_attached(&self, device: &DeviceId) -> bool {
        self.sessions.lock().contains_key(device)
    }

    /// Devices with a running session.
    pub fn attached(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.sessions.lock().keys().cloned().collect();
        devices.sort();
        devices
    }
}

impl Drop for Propagator {
    fn drop(&mut self) {
        self.detach_all();
    }
}
