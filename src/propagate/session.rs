//! Per-device session thread.

use super::SyncEvent;
use crate::catalog::CatalogReader;
use crate::error::{Result, SyncError};
use crate::reconcile::{default_entry, Reconciler};
use crate::tree::{
    Layout, TreeEvent, TreeStore, TreeStoreExt, WatchConfig, WatchHandle, NAME_FIELD, ROOM_FIELD,
};
use crate::types::{DeviceId, DeviceInfo, Subtree, ViewTarget};
use crossbeam_channel::{bounded, Receiver, RecvError, Select, Sender, TrySendError};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Metadata keys that change where or how a device is shown.
const META_KEYS: [&str; 3] = [NAME_FIELD, ROOM_FIELD, "location"];

/// Pause before retrying a watch the store refused to re-establish.
const REWATCH_DELAY: Duration = Duration::from_millis(250);

type Received = std::result::Result<TreeEvent, RecvError>;

/// Everything a session needs, shared by all sessions of one propagator.
#[derive(Clone)]
pub(super) struct SessionContext {
    pub(super) store: Arc<dyn TreeStore>,
    pub(super) layout: Layout,
    pub(super) reconciler: Reconciler,
    pub(super) watch_buffer_size: usize,
    pub(super) replay_view: bool,
    pub(super) events: Sender<SyncEvent>,
}

impl SessionContext {
    fn emit(&self, event: SyncEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::trace!(?event, "sync event queue full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn catalog(&self) -> &CatalogReader {
        self.reconciler.catalog()
    }

    fn live(&self) -> WatchConfig {
        WatchConfig::live(self.watch_buffer_size)
    }
}

/// Handle to a running session.
pub(super) struct DeviceSession {
    device: DeviceId,
    /// Signaled to end the session loop after the current reaction.
    shutdown: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceSession {
    /// Register the session's watches and spawn its thread.
    pub(super) fn start(device: DeviceId, context: SessionContext) -> Result<Self> {
        let worker = Worker::new(device.clone(), context)?;
        let (shutdown, shutdown_receiver) = bounded(1);

        let thread = std::thread::Builder::new()
            .name(format!("roomsync-{}", device))
            .spawn(move || worker.run(shutdown_receiver))?;

        Ok(Self {
            device,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Signal the session and wait for it to finish its current reaction.
    pub(super) fn stop(mut self) {
        let _ = self.shutdown.try_send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(device = %self.device, "device session panicked");
            }
        }
    }
}

/// What woke the session loop.
enum Wake {
    Shutdown,
    Meta(Received),
    Subtree(Subtree, Received),
    View(Received),
}

/// What a metadata refresh found.
enum Refresh {
    Unchanged,
    Renamed,
    Moved,
}

/// Channel registered with the select, in registration order.
enum Source<'a> {
    Shutdown(&'a Receiver<()>),
    Meta(&'a Receiver<TreeEvent>),
    Subtree(Subtree, &'a Receiver<TreeEvent>),
    View(&'a Receiver<TreeEvent>),
}

/// The session loop state, owned by the session thread.
struct Worker {
    device: DeviceId,
    context: SessionContext,
    subtrees: Vec<(Subtree, WatchHandle)>,
    meta: WatchHandle,
    /// Watch on `views/{room}/{device}/available`, present once provisioned.
    view: Option<WatchHandle>,
    info: Option<DeviceInfo>,
}

impl Worker {
    fn new(device: DeviceId, context: SessionContext) -> Result<Self> {
        let meta = context
            .store
            .watch(&context.layout.device(&device), context.live())?;

        let mut worker = Self {
            device,
            context,
            subtrees: Vec::with_capacity(Subtree::ALL.len()),
            meta,
            view: None,
            info: None,
        };
        if let Err(e) = worker.init() {
            worker.release();
            return Err(e);
        }
        Ok(worker)
    }

    fn init(&mut self) -> Result<()> {
        for subtree in Subtree::ALL {
            let path = self.context.layout.subtree(&self.device, subtree);
            let handle = self.context.store.watch(&path, self.context.live())?;
            self.subtrees.push((subtree, handle));
        }
        self.info = self.context.catalog().device_info(&self.device)?;
        self.arm_view_watch(self.context.replay_view)
    }

    fn run(mut self, shutdown: Receiver<()>) {
        tracing::trace!(device = %self.device, "session thread started");

        self.resync();
        self.context.emit(SyncEvent::Attached {
            device: self.device.clone(),
        });

        loop {
            match self.wait(&shutdown) {
                Wake::Shutdown => break,
                Wake::Subtree(subtree, event) => self.on_subtree(subtree, event),
                Wake::Meta(event) => self.on_meta(event),
                Wake::View(event) => self.on_view(event),
            }
        }

        self.release();
        tracing::trace!(device = %self.device, "session thread finished");
        self.context.emit(SyncEvent::Detached {
            device: self.device.clone(),
        });
    }

    /// Block until one of the session's channels is ready.
    fn wait(&self, shutdown: &Receiver<()>) -> Wake {
        let mut sources = vec![Source::Shutdown(shutdown), Source::Meta(&self.meta.receiver)];
        for (subtree, handle) in &self.subtrees {
            sources.push(Source::Subtree(*subtree, &handle.receiver));
        }
        if let Some(view) = &self.view {
            sources.push(Source::View(&view.receiver));
        }

        let mut select = Select::new();
        for source in &sources {
            match source {
                Source::Shutdown(r) => select.recv(*r),
                Source::Meta(r) | Source::Subtree(_, r) | Source::View(r) => select.recv(*r),
            };
        }

        let operation = select.select();
        match &sources[operation.index()] {
            Source::Shutdown(r) => {
                let _ = operation.recv(*r);
                Wake::Shutdown
            }
            Source::Meta(r) => Wake::Meta(operation.recv(*r)),
            Source::Subtree(subtree, r) => Wake::Subtree(*subtree, operation.recv(*r)),
            Source::View(r) => Wake::View(operation.recv(*r)),
        }
    }

    // --- Catalog subtrees ---

    fn on_subtree(&mut self, subtree: Subtree, event: Received) {
        let mut active_touched = subtree.is_active();
        let mut lost = Vec::new();

        if matches!(event, Ok(TreeEvent::Dropped { .. }) | Err(_)) {
            lost.push(subtree);
        }

        // Coalesce the rest of the burst into one reconciliation.
        for (other, handle) in &self.subtrees {
            while let Ok(event) = handle.try_recv() {
                match event {
                    TreeEvent::Dropped { .. } => lost.push(*other),
                    _ => active_touched |= other.is_active(),
                }
            }
        }

        lost.sort();
        lost.dedup();
        let lost_any = !lost.is_empty();
        for subtree in lost {
            self.rewatch_subtree(subtree);
        }

        match self.refresh_info() {
            Ok(Refresh::Unchanged) => {}
            // Already resynced in the current room.
            Ok(_) => return,
            Err(e) => {
                self.fail(e);
                return;
            }
        }
        if lost_any {
            // Changes may have been missed while the watch was gone.
            self.resync();
            return;
        }

        let Some(info) = self.info.clone() else {
            self.defer();
            return;
        };

        let catalog = self.context.catalog();
        let result = catalog.subscription_names(&self.device).and_then(|all| {
            self.reconcile(&info, ViewTarget::Available, &all)?;
            if active_touched {
                let active = catalog.active_names(&self.device)?;
                self.reconcile(&info, ViewTarget::Active, &active)?;
            }
            Ok(())
        });
        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn reconcile(
        &self,
        info: &DeviceInfo,
        target: ViewTarget,
        source: &BTreeSet<String>,
    ) -> Result<()> {
        let report = self.context.reconciler.reconcile_in(info, target, source)?;
        if report.writes() > 0 {
            self.context.emit(SyncEvent::Reconciled { report });
        }
        Ok(())
    }

    fn rewatch_subtree(&mut self, subtree: Subtree) {
        let path = self.context.layout.subtree(&self.device, subtree);
        match self.context.store.watch(&path, self.context.live()) {
            Ok(handle) => {
                tracing::warn!(
                    device = %self.device,
                    %subtree,
                    "catalog watch lost, re-established"
                );
                if let Some(slot) = self.subtrees.iter_mut().find(|(s, _)| *s == subtree) {
                    let old = std::mem::replace(&mut slot.1, handle);
                    self.context.store.unwatch(old.id);
                }
            }
            Err(e) => {
                self.fail(e);
                std::thread::sleep(REWATCH_DELAY);
            }
        }
    }

    // --- Device metadata ---

    fn on_meta(&mut self, event: Received) {
        let mut relevant = match event {
            Ok(TreeEvent::Dropped { .. }) | Err(_) => {
                self.rewatch_meta();
                true
            }
            Ok(event) => is_meta_key(&event),
        };
        // Subtree changes also surface here; the subtree watches handle those.
        while let Ok(event) = self.meta.try_recv() {
            relevant |= is_meta_key(&event);
        }
        if !relevant {
            return;
        }

        if let Err(e) = self.refresh_info() {
            self.fail(e);
        }
    }

    /// Re-read device metadata and follow renames and relocations.
    ///
    /// On any change the device is resynced in its current room before
    /// returning.
    fn refresh_info(&mut self) -> Result<Refresh> {
        let info = self.context.catalog().device_info(&self.device)?;
        if info == self.info {
            return Ok(Refresh::Unchanged);
        }

        let previous = std::mem::replace(&mut self.info, info);
        let old_room = previous.as_ref().map(|i| i.room.clone());
        let new_room = self.info.as_ref().map(|i| i.room.clone());
        tracing::info!(device = %self.device, ?old_room, ?new_room, "device metadata changed");

        let refresh = if old_room != new_room {
            // The device left its old room; nothing of it may stay behind.
            if let Some(room) = &old_room {
                self.context
                    .store
                    .delete(&self.context.layout.view_device(room, &self.device))?;
            }
            self.arm_view_watch(true)?;
            Refresh::Moved
        } else {
            Refresh::Renamed
        };
        self.resync();
        Ok(refresh)
    }

    fn rewatch_meta(&mut self) {
        let path = self.context.layout.device(&self.device);
        match self.context.store.watch(&path, self.context.live()) {
            Ok(handle) => {
                let old = std::mem::replace(&mut self.meta, handle);
                self.context.store.unwatch(old.id);
            }
            Err(e) => {
                self.fail(e);
                std::thread::sleep(REWATCH_DELAY);
            }
        }
    }

    // --- Available view ---

    /// Point the view watch at the current room, or release it.
    fn arm_view_watch(&mut self, replay: bool) -> Result<()> {
        if let Some(old) = self.view.take() {
            self.context.store.unwatch(old.id);
        }
        let Some(info) = &self.info else {
            return Ok(());
        };
        let path = self
            .context
            .layout
            .view(&info.room, &self.device, ViewTarget::Available);
        let config = WatchConfig {
            buffer_size: self.context.watch_buffer_size,
            replay_existing: replay,
        };
        self.view = Some(self.context.store.watch(&path, config)?);
        Ok(())
    }

    fn on_view(&mut self, event: Received) {
        let result = match event {
            Ok(TreeEvent::Added { key, .. }) | Ok(TreeEvent::Changed { key, .. }) => {
                match self.in_current_room() {
                    Ok(true) => self.seed_catalog(&key),
                    other => other.map(|_| ()),
                }
            }
            Ok(TreeEvent::Removed { key, .. }) => {
                match self.in_current_room() {
                    Ok(true) => self.prune_catalog(&key),
                    other => other.map(|_| ()),
                }
            }
            Ok(TreeEvent::CaughtUp) => Ok(()),
            Ok(TreeEvent::Dropped { .. }) | Err(_) => {
                tracing::warn!(device = %self.device, "view watch lost, re-establishing");
                let rearmed = self.arm_view_watch(true);
                if rearmed.is_err() {
                    std::thread::sleep(REWATCH_DELAY);
                }
                rearmed
            }
        };
        if let Err(e) = result {
            self.fail(e);
        }
    }

    /// False when the event came from a room the device has since left. The
    /// view watch is re-armed on the new room and replays its entries.
    fn in_current_room(&mut self) -> Result<bool> {
        Ok(!matches!(self.refresh_info()?, Refresh::Moved))
    }

    /// A view entry exists: make sure the catalog mirror does too.
    fn seed_catalog(&self, subscription: &str) -> Result<()> {
        let Some(info) = &self.info else {
            self.defer();
            return Ok(());
        };
        let path = self
            .context
            .layout
            .catalog_available(&self.device)
            .child(subscription);

        // Read before write: duplicate notifications find the entry present.
        if self.context.store.read(&path)?.is_some() {
            return Ok(());
        }
        self.context
            .store
            .write_as(&path, &default_entry(&info.name, subscription))?;
        tracing::debug!(device = %self.device, subscription, "seeded catalog available entry");
        self.context.emit(SyncEvent::CatalogSeeded {
            device: self.device.clone(),
            subscription: subscription.to_string(),
        });
        Ok(())
    }

    /// A view entry is gone: remove the catalog mirror if still there.
    fn prune_catalog(&self, subscription: &str) -> Result<()> {
        if self.info.is_none() {
            self.defer();
            return Ok(());
        }
        let path = self
            .context
            .layout
            .catalog_available(&self.device)
            .child(subscription);

        if self.context.store.read(&path)?.is_none() {
            return Ok(());
        }
        self.context.store.delete(&path)?;
        tracing::debug!(device = %self.device, subscription, "pruned catalog available entry");
        self.context.emit(SyncEvent::CatalogPruned {
            device: self.device.clone(),
            subscription: subscription.to_string(),
        });
        Ok(())
    }

    // --- Helpers ---

    fn resync(&self) {
        let Some(info) = &self.info else {
            self.defer();
            return;
        };
        match self.context.reconciler.resync_resolved(info) {
            Ok(report) => {
                for report in [report.available, report.active] {
                    if report.writes() > 0 {
                        self.context.emit(SyncEvent::Reconciled { report });
                    }
                }
            }
            Err(e) => self.fail(e),
        }
    }

    fn defer(&self) {
        tracing::debug!(device = %self.device, "device not provisioned, deferring");
        self.context.emit(SyncEvent::Deferred {
            device: self.device.clone(),
        });
    }

    fn fail(&self, error: SyncError) {
        tracing::warn!(device = %self.device, %error, "propagation failed");
        self.context.emit(SyncEvent::Failed {
            device: self.device.clone(),
            error: error.to_string(),
        });
    }

    /// Release every watch held by the session.
    fn release(&mut self) {
        for (_, handle) in self.subtrees.drain(..) {
            self.context.store.unwatch(handle.id);
        }
        self.context.store.unwatch(self.meta.id);
        if let Some(view) = self.view.take() {
            self.context.store.unwatch(view.id);
        }
    }
}

fn is_meta_key(event: &TreeEvent) -> bool {
    event.key().is_some_and(|key| META_KEYS.contains(&key))
}
