//! Engine tying the components together.

use crate::admin::DeviceAdmin;
use crate::config::SyncConfig;
use crate::dashboard::Dashboard;
use crate::error::{Result, SyncError};
use crate::propagate::{Propagator, SyncEvent};
use crate::reconcile::{Reconciler, ResyncSummary};
use crate::toggle::{ToggleHandler, ToggleOutcome};
use crate::tree::{Layout, TreeEvent, TreeStore, WatchConfig, WatchHandle};
use crate::types::DeviceId;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;

/// The sync engine.
///
/// Provides a unified interface for:
/// - Startup resync of every device
/// - Live propagation, with devices attached as they appear in the catalog
/// - Toggling subscriptions
/// - Device administration and dashboard queries
pub struct Engine {
    store: Arc<dyn TreeStore>,
    config: SyncConfig,
    layout: Layout,
    reconciler: Reconciler,
    toggles: ToggleHandler,
    admin: DeviceAdmin,
    dashboard: Dashboard,
    propagator: Arc<Propagator>,

    /// Catalog root watcher, present while started.
    discovery: Mutex<Option<Discovery>>,
}

struct Discovery {
    shutdown: Sender<()>,
    thread: JoinHandle<()>,
}

impl Engine {
    pub fn new(store: Arc<dyn TreeStore>, config: SyncConfig) -> Self {
        let layout = Layout::new(&config);
        Self {
            reconciler: Reconciler::new(Arc::clone(&store), layout.clone()),
            toggles: ToggleHandler::new(Arc::clone(&store), layout.clone()),
            admin: DeviceAdmin::new(Arc::clone(&store), layout.clone()),
            dashboard: Dashboard::new(Arc::clone(&store), &config),
            propagator: Arc::new(Propagator::new(Arc::clone(&store), &config)),
            discovery: Mutex::new(None),
            store,
            config,
            layout,
        }
    }

    /// Resync everything, attach every catalog device and start watching
    /// the catalog for new ones.
    pub fn start(&self) -> Result<ResyncSummary> {
        let mut discovery = self.discovery.lock();
        if discovery.is_some() {
            return Err(SyncError::InvalidOperation("engine already started".to_string()));
        }

        // Watch first so devices registered during startup are not missed.
        let root = self.store.watch(
            self.layout.catalog_root(),
            WatchConfig::live(self.config.watch_buffer_size),
        )?;

        let summary = match self.bootstrap() {
            Ok(summary) => summary,
            Err(e) => {
                self.store.unwatch(root.id);
                self.propagator.detach_all();
                return Err(e);
            }
        };

        let (shutdown, shutdown_receiver) = bounded(1);
        let watcher = CatalogWatcher {
            store: Arc::clone(&self.store),
            layout: self.layout.clone(),
            buffer_size: self.config.watch_buffer_size,
            propagator: Arc::clone(&self.propagator),
            root,
        };
        let thread = std::thread::Builder::new()
            .name("roomsync-discovery".to_string())
            .spawn(move || watcher.run(shutdown_receiver))?;
        *discovery = Some(Discovery { shutdown, thread });

        tracing::info!(
            attached = self.propagator.attached().len(),
            writes = summary.writes(),
            "sync engine started"
        );
        Ok(summary)
    }

    fn bootstrap(&self) -> Result<ResyncSummary> {
        let summary = self.reconciler.resync_all()?;
        for device in self.reconciler.catalog().list_devices()? {
            self.propagator.attach(&device)?;
        }
        Ok(summary)
    }

    /// Stop discovery and every device session.
    pub fn stop(&self) {
        let discovery = self.discovery.lock().take();
        if let Some(discovery) = discovery {
            let _ = discovery.shutdown.send(());
            if discovery.thread.join().is_err() {
                tracing::error!("catalog watcher panicked");
            }
        }
        self.propagator.detach_all();
        tracing::info!("sync engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.discovery.lock().is_some()
    }

    /// Activate or deactivate a subscription by name.
    pub fn toggle(&self, device: &DeviceId, subscription: &str) -> Result<ToggleOutcome> {
        self.toggles.toggle_by_name(device, subscription)
    }

    /// Outbound sync events of all sessions.
    pub fn events(&self) -> Receiver<SyncEvent> {
        self.propagator.events()
    }

    pub fn store(&self) -> &Arc<dyn TreeStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn toggles(&self) -> &ToggleHandler {
        &self.toggles
    }

    pub fn admin(&self) -> &DeviceAdmin {
        &self.admin
    }

    pub fn dashboard(&self) -> &Dashboard {
        &self.dashboard
    }

    pub fn propagator(&self) -> &Propagator {
        &self.propagator
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Attaches devices appearing under the catalog root and detaches removed ones.
struct CatalogWatcher {
    store: Arc<dyn TreeStore>,
    layout: Layout,
    buffer_size: usize,
    propagator: Arc<Propagator>,
    root: WatchHandle,
}

impl CatalogWatcher {
    fn run(mut self, shutdown: Receiver<()>) {
        loop {
            let event = select! {
                recv(shutdown) -> _ => break,
                recv(self.root.receiver) -> event => event,
            };
            match event {
                Ok(TreeEvent::Added { key, .. }) => self.attach(&DeviceId(key)),
                Ok(TreeEvent::Removed { key, .. }) => {
                    let device = DeviceId(key);
                    if self.propagator.detach(&device) {
                        tracing::info!(device = %device, "device left the catalog, detached");
                    }
                }
                Ok(TreeEvent::Changed { .. }) | Ok(TreeEvent::CaughtUp) => {}
                Ok(TreeEvent::Dropped { .. }) | Err(_) => self.recover(),
            }
        }
        self.store.unwatch(self.root.id);
    }

    fn attach(&self, device: &DeviceId) {
        match self.propagator.attach(device) {
            Ok(true) => tracing::info!(device = %device, "new catalog device, attached"),
            Ok(false) => {}
            Err(e) => tracing::warn!(device = %device, error = %e, "failed to attach device"),
        }
    }

    /// Re-establish the root watch and catch up with what changed meanwhile.
    fn recover(&mut self) {
        let root = match self
            .store
            .watch(self.layout.catalog_root(), WatchConfig::live(self.buffer_size))
        {
            Ok(root) => root,
            Err(e) => {
                tracing::warn!(error = %e, "catalog watch lost and could not be re-established");
                std::thread::sleep(std::time::Duration::from_millis(250));
                return;
            }
        };
        let old = std::mem::replace(&mut self.root, root);
        self.store.unwatch(old.id);

        let present: BTreeSet<DeviceId> = match self.store.keys(self.layout.catalog_root()) {
            Ok(keys) => keys.into_iter().map(DeviceId).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to list catalog after watch loss");
                return;
            }
        };
        for device in self.propagator.attached() {
            if !present.contains(&device) {
                self.propagator.detach(&device);
            }
        }
        for device in &present {
            self.attach(device);
        }
        tracing::warn!(devices = present.len(), "catalog watch re-established");
    }
}
