//! Device administration: provisioning, configuration and removal.

use crate::catalog::{CatalogReader, LEGACY_ROOM_FIELD};
use crate::error::{Result, SyncError};
use crate::reconcile::{Reconciler, ResyncReport};
use crate::tree::{Layout, TreeStore, TreeStoreExt, NAME_FIELD, ROOM_FIELD};
use crate::types::{DeviceId, DeviceInfo, RoomId, ViewEntry, ViewTarget, WidgetKind};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Length of an agent identifier.
pub const AGENT_ID_LEN: usize = 12;

/// Check that `id` looks like an agent identifier: exactly twelve characters
/// of ASCII letters, digits, `_` or `-`.
pub fn validate_agent_id(id: &str) -> Result<DeviceId> {
    let valid = id.len() == AGENT_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(DeviceId::new(id))
    } else {
        Err(SyncError::InvalidAgentId(id.to_string()))
    }
}

/// Changes to apply to a provisioned device. `None` leaves a field as is.
#[derive(Clone, Debug, Default)]
pub struct DeviceConfig {
    pub device: DeviceId,
    pub name: Option<String>,
    pub room: Option<RoomId>,
    /// New view entries, keyed by subscription name.
    pub subscriptions: BTreeMap<String, ViewEntry>,
}

impl DeviceConfig {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            ..Default::default()
        }
    }

    pub fn rename(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn relocate(mut self, room: RoomId) -> Self {
        self.room = Some(room);
        self
    }

    pub fn subscription(mut self, subscription: impl Into<String>, entry: ViewEntry) -> Self {
        self.subscriptions.insert(subscription.into(), entry);
        self
    }
}

/// Administrative operations on devices.
#[derive(Clone)]
pub struct DeviceAdmin {
    store: Arc<dyn TreeStore>,
    layout: Layout,
    reconciler: Reconciler,
}

impl DeviceAdmin {
    pub fn new(store: Arc<dyn TreeStore>, layout: Layout) -> Self {
        let reconciler = Reconciler::new(Arc::clone(&store), layout.clone());
        Self {
            store,
            layout,
            reconciler,
        }
    }

    fn catalog(&self) -> &CatalogReader {
        self.reconciler.catalog()
    }

    /// Provision a device the agent has already registered in the catalog.
    ///
    /// An empty name defaults to the agent id. Returns the resync of the
    /// device's views in its room.
    pub fn add_device(&self, id: &str, room: &RoomId, name: &str) -> Result<ResyncReport> {
        let device = validate_agent_id(id)?;
        if room.as_str().is_empty() {
            return Err(SyncError::InvalidOperation(format!(
                "device {} needs a room",
                device
            )));
        }
        if !self.catalog().list_devices()?.contains(&device) {
            return Err(SyncError::UnknownDevice(device.to_string()));
        }

        let name = if name.trim().is_empty() {
            device.to_string()
        } else {
            name.trim().to_string()
        };
        let info = DeviceInfo {
            id: device,
            name,
            room: room.clone(),
        };
        self.write_meta(&info)?;
        tracing::info!(device = %info.id, room = %info.room, name = %info.name, "device added");

        self.reconciler.resync_resolved(&info)
    }

    /// Apply a configuration form to a provisioned device.
    ///
    /// A relocation carries the device's view entries to the new room as
    /// they are, so administrator names and widgets survive the move. A
    /// rename does not touch existing entry names. Each displayed widget
    /// kind can be bound to at most one subscription of the device.
    pub fn configure_device(&self, config: &DeviceConfig) -> Result<DeviceInfo> {
        let device = &config.device;
        let current = self
            .catalog()
            .device_info(device)?
            .ok_or_else(|| SyncError::NotProvisioned(device.to_string()))?;

        let declared = self.catalog().subscription_names(device)?;
        if let Some(unknown) = config.subscriptions.keys().find(|s| !declared.contains(*s)) {
            return Err(SyncError::UnknownSubscription {
                device: device.to_string(),
                subscription: unknown.clone(),
            });
        }

        let available_path = self.layout.view(&current.room, device, ViewTarget::Available);
        let mut available: BTreeMap<String, ViewEntry> =
            self.store.read_as(&available_path)?.unwrap_or_default();
        available.extend(config.subscriptions.clone());
        check_widgets(&available)?;

        let updated = DeviceInfo {
            id: device.clone(),
            name: config.name.clone().unwrap_or_else(|| current.name.clone()),
            room: config.room.clone().unwrap_or_else(|| current.room.clone()),
        };

        if updated.room != current.room {
            self.move_views(&current, &updated)?;
        } else if updated.name != current.name {
            self.write_meta(&updated)?;
        }

        if !config.subscriptions.is_empty() {
            let active = self
                .store
                .keys(&self.layout.view(&updated.room, device, ViewTarget::Active))?;
            let available_path = self.layout.view(&updated.room, device, ViewTarget::Available);
            let active_path = self.layout.view(&updated.room, device, ViewTarget::Active);
            for (subscription, entry) in &config.subscriptions {
                self.store
                    .write_as(&available_path.child(subscription.as_str()), entry)?;
                if active.contains(subscription) {
                    self.store
                        .write_as(&active_path.child(subscription.as_str()), entry)?;
                }
            }
        }

        tracing::info!(
            device = %device,
            room = %updated.room,
            name = %updated.name,
            edited = config.subscriptions.len(),
            "device configured"
        );
        Ok(updated)
    }

    /// Copy the device's view node to its new room, point the metadata
    /// there, then drop the old node.
    fn move_views(&self, current: &DeviceInfo, updated: &DeviceInfo) -> Result<()> {
        let from = self.layout.view_device(&current.room, &current.id);
        let to = self.layout.view_device(&updated.room, &updated.id);
        if let Some(node) = self.store.read(&from)? {
            self.store.write(&to, node)?;
        }
        self.write_meta(updated)?;
        self.store.delete(&from)?;
        tracing::debug!(
            device = %current.id,
            from = %current.room,
            to = %updated.room,
            "moved device views"
        );
        Ok(())
    }

    fn write_meta(&self, info: &DeviceInfo) -> Result<()> {
        let mut meta = Map::new();
        meta.insert(NAME_FIELD.to_string(), json!(info.name));
        meta.insert(ROOM_FIELD.to_string(), json!(info.room));
        // Older dumps keep the room under `location`; drop it so it cannot disagree.
        meta.insert(LEGACY_ROOM_FIELD.to_string(), Value::Null);
        self.store.write(&self.layout.device(&info.id), Value::Object(meta))
    }

    /// Remove a device from the catalog and from every room view.
    pub fn delete_device(&self, device: &DeviceId) -> Result<()> {
        let rooms = self.store.keys(self.layout.views_root())?;
        let mut removed = 0;
        for room in rooms {
            let path = self.layout.view_device(&RoomId(room), device);
            if self.store.read(&path)?.is_some() {
                self.store.delete(&path)?;
                removed += 1;
            }
        }
        self.store.delete(&self.layout.device(device))?;
        tracing::info!(device = %device, rooms = removed, "device deleted");
        Ok(())
    }

    /// Devices with a name and room.
    pub fn provisioned_devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut devices = Vec::new();
        for device in self.catalog().list_devices()? {
            if let Some(info) = self.catalog().device_info(&device)? {
                devices.push(info);
            }
        }
        Ok(devices)
    }

    /// Devices present in the catalog that nobody has added yet.
    pub fn unprovisioned_devices(&self) -> Result<BTreeSet<DeviceId>> {
        let mut devices = self.catalog().list_devices()?;
        for info in self.provisioned_devices()? {
            devices.remove(&info.id);
        }
        Ok(devices)
    }
}

fn check_widgets(entries: &BTreeMap<String, ViewEntry>) -> Result<()> {
    for widget in WidgetKind::DISPLAYED {
        if entries.values().filter(|e| e.widget == widget).count() > 1 {
            return Err(SyncError::DuplicateWidget {
                widget: widget.to_string(),
            });
        }
    }
    Ok(())
}
