//! Read-only access to the per-device settings catalog.

use crate::error::Result;
use crate::tree::{Layout, TreePath, TreeStore, TreeStoreExt, NAME_FIELD, ROOM_FIELD};
use crate::types::{CatalogEntry, ChannelId, DeviceId, DeviceInfo, RoomId, Subtree, ViewEntry};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Older dumps store the room under this field.
pub(crate) const LEGACY_ROOM_FIELD: &str = "location";

fn resolve(device: &DeviceId, name: Option<String>, room: Option<String>) -> Option<DeviceInfo> {
    match (name, room) {
        (Some(name), Some(room)) if !room.is_empty() => Some(DeviceInfo {
            id: device.clone(),
            name,
            room: RoomId(room),
        }),
        _ => None,
    }
}

/// Enumerates devices and their declared subscriptions.
///
/// Absence of data is never an error: missing nodes read as empty.
#[derive(Clone)]
pub struct CatalogReader {
    store: Arc<dyn TreeStore>,
    layout: Layout,
}

impl CatalogReader {
    pub fn new(store: Arc<dyn TreeStore>, layout: Layout) -> Self {
        Self { store, layout }
    }

    /// Every device with a catalog node, provisioned or not.
    pub fn list_devices(&self) -> Result<BTreeSet<DeviceId>> {
        let keys = self.store.keys(self.layout.catalog_root())?;
        Ok(keys.into_iter().map(DeviceId).collect())
    }

    /// Subscription bindings in one of the four subtrees.
    pub fn list_subscriptions(
        &self,
        device: &DeviceId,
        subtree: Subtree,
    ) -> Result<BTreeMap<String, CatalogEntry>> {
        let path = self.layout.subtree(device, subtree);
        Ok(self
            .store
            .read_as::<BTreeMap<String, CatalogEntry>>(&path)?
            .unwrap_or_default())
    }

    /// The catalog mirror of the device's `available` view.
    pub fn list_available(&self, device: &DeviceId) -> Result<BTreeMap<String, ViewEntry>> {
        let path = self.layout.catalog_available(device);
        Ok(self
            .store
            .read_as::<BTreeMap<String, ViewEntry>>(&path)?
            .unwrap_or_default())
    }

    /// Subscription names across the given subtrees, duplicates collapsed.
    pub fn names_in(&self, device: &DeviceId, subtrees: &[Subtree]) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for subtree in subtrees {
            names.extend(self.store.keys(&self.layout.subtree(device, *subtree))?);
        }
        Ok(names)
    }

    /// Union of all four subtrees.
    pub fn subscription_names(&self, device: &DeviceId) -> Result<BTreeSet<String>> {
        self.names_in(device, &Subtree::ALL)
    }

    /// Union of `activeStreams` and `activeEvents`.
    pub fn active_names(&self, device: &DeviceId) -> Result<BTreeSet<String>> {
        self.names_in(device, &Subtree::ACTIVE)
    }

    /// Name and room of a device. `None` until the device is provisioned.
    pub fn device_info(&self, device: &DeviceId) -> Result<Option<DeviceInfo>> {
        let device_path = self.layout.device(device);
        let name = self.read_string(&device_path.child(NAME_FIELD))?;
        let room = match self.read_string(&device_path.child(ROOM_FIELD))? {
            Some(room) => Some(room),
            None => self.read_string(&device_path.child(LEGACY_ROOM_FIELD))?,
        };
        Ok(resolve(device, name, room))
    }

    fn read_string(&self, path: &TreePath) -> Result<Option<String>> {
        Ok(self
            .store
            .read(path)?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Which subtree currently holds a subscription, with its binding.
    pub fn find_subscription(
        &self,
        device: &DeviceId,
        subscription: &str,
    ) -> Result<Option<(Subtree, CatalogEntry)>> {
        for subtree in Subtree::ALL {
            let path = self.layout.binding(device, subtree, subscription);
            if let Some(entry) = self.store.read_as::<CatalogEntry>(&path)? {
                return Ok(Some((subtree, entry)));
            }
        }
        Ok(None)
    }

    /// Sensor type description of a channel, if the device reported one.
    pub fn channel_type(&self, device: &DeviceId, channel: &ChannelId) -> Result<Option<String>> {
        let path = self.layout.channel(device, channel).child("type");
        Ok(self
            .store
            .read(&path)?
            .and_then(|v| v.as_str().map(str::to_string)))
    }
}
