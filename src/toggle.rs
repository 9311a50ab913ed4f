//! User-initiated activation and deactivation of one subscription.
//!
//! This is the only writer that moves a binding between activation subtrees.
//! Reconciliation never calls it, so the two cannot feed each other.

use crate::catalog::CatalogReader;
use crate::error::{Result, SyncError};
use crate::tree::{Layout, TreeStore};
use crate::types::{ChannelId, DeviceId, RoomId, Subtree, ViewTarget};
use serde_json::{Map, Value};
use std::sync::Arc;

const CHANNEL_FIELD: &str = "channelID";

/// Result of a toggle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToggleOutcome {
    pub device: DeviceId,
    pub subscription: String,
    pub from: Subtree,
    pub to: Subtree,
    /// False when activating found no `available` entry to copy; the next
    /// reconciliation fills the active entry with its default instead.
    pub view_mirrored: bool,
}

/// Moves subscriptions between active and inactive catalog subtrees.
#[derive(Clone)]
pub struct ToggleHandler {
    store: Arc<dyn TreeStore>,
    layout: Layout,
    catalog: CatalogReader,
}

impl ToggleHandler {
    pub fn new(store: Arc<dyn TreeStore>, layout: Layout) -> Self {
        let catalog = CatalogReader::new(Arc::clone(&store), layout.clone());
        Self {
            store,
            layout,
            catalog,
        }
    }

    /// Flip one subscription out of `current` into its opposite subtree.
    ///
    /// The stored binding moves as is. `current` is only cleared once the
    /// binding reads back from its new subtree.
    ///
    /// Activating copies the room's `available` entry into `active` as is, so
    /// administrator names and widgets carry over. Deactivating removes the
    /// `active` entry.
    pub fn toggle(
        &self,
        device: &DeviceId,
        room: &RoomId,
        subscription: &str,
        channel: &ChannelId,
        current: Subtree,
    ) -> Result<ToggleOutcome> {
        let to = current.opposite();
        let from_path = self.layout.binding(device, current, subscription);
        let to_path = self.layout.binding(device, to, subscription);

        // The binding lands in its new subtree before it leaves the old one.
        if let Some(binding) = moved_binding(self.store.read(&from_path)?, channel) {
            self.store.write(&to_path, binding)?;
        }
        if self.store.read(&to_path)?.is_none() {
            return Err(SyncError::InvalidOperation(format!(
                "subscription {} of device {} has no binding to move to {}",
                subscription, device, to
            )));
        }
        self.store.delete(&from_path)?;

        let active = self
            .layout
            .view(room, device, ViewTarget::Active)
            .child(subscription);

        let view_mirrored = if to.is_active() {
            let available = self
                .layout
                .view(room, device, ViewTarget::Available)
                .child(subscription);
            match self.store.read(&available)? {
                Some(entry) => {
                    self.store.write(&active, entry)?;
                    true
                }
                None => {
                    tracing::warn!(
                        device = %device,
                        room = %room,
                        subscription,
                        "activated subscription has no available entry to copy"
                    );
                    false
                }
            }
        } else {
            self.store.delete(&active)?;
            true
        };

        tracing::info!(
            device = %device,
            subscription,
            from = %current,
            to = %to,
            "toggled subscription"
        );

        Ok(ToggleOutcome {
            device: device.clone(),
            subscription: subscription.to_string(),
            from: current,
            to,
            view_mirrored,
        })
    }

    /// Toggle a subscription knowing only its name. Room, channel and current
    /// subtree are read from the catalog.
    pub fn toggle_by_name(&self, device: &DeviceId, subscription: &str) -> Result<ToggleOutcome> {
        let info = self
            .catalog
            .device_info(device)?
            .ok_or_else(|| SyncError::NotProvisioned(device.to_string()))?;

        let (current, entry) = self
            .catalog
            .find_subscription(device, subscription)?
            .ok_or_else(|| SyncError::UnknownSubscription {
                device: device.to_string(),
                subscription: subscription.to_string(),
            })?;

        self.toggle(device, &info.room, subscription, &entry.channel_id, current)
    }
}

/// Value to store under the new subtree: the stored binding as it is, with
/// the channel filled in when the caller names one.
fn moved_binding(stored: Option<Value>, channel: &ChannelId) -> Option<Value> {
    let channel = (!channel.0.is_null()).then(|| channel.0.clone());
    match (stored, channel) {
        (Some(Value::Object(mut fields)), Some(channel)) => {
            fields.insert(CHANNEL_FIELD.to_string(), channel);
            Some(Value::Object(fields))
        }
        (Some(stored), _) => Some(stored),
        (None, Some(channel)) => {
            let mut fields = Map::new();
            fields.insert(CHANNEL_FIELD.to_string(), channel);
            Some(Value::Object(fields))
        }
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::tree::{MemoryTree, TreePath};
    use serde_json::{json, Value};

    fn setup(seed: Value) -> (Arc<MemoryTree>, ToggleHandler) {
        let tree = Arc::new(MemoryTree::from_json(seed));
        let store: Arc<dyn TreeStore> = tree.clone();
        (tree, ToggleHandler::new(store, Layout::new(&SyncConfig::default())))
    }

    fn read(tree: &MemoryTree, s: &str) -> Option<Value> {
        tree.read(&TreePath::parse(s).unwrap()).unwrap()
    }

    fn seed() -> Value {
        json!({
            "catalog": {"dev01": {
                "name": "Hall", "room": "lab",
                "inactiveStreams": {"s_temp": {"channelID": 4}},
                "activeEvents": {"e_door": {"channelID": 9}}
            }},
            "views": {"lab": {"dev01": {
                "available": {
                    "s_temp": {"name": "Desk Thermometer", "widget": "temp"},
                    "e_door": {"name": "Hall Door", "widget": ""}
                },
                "active": {"e_door": {"name": "Hall Door", "widget": ""}}
            }}}
        })
    }

    #[test]
    fn test_activate_copies_available_entry() {
        let (tree, handler) = setup(seed());

        let outcome = handler
            .toggle(
                &"dev01".into(),
                &"lab".into(),
                "s_temp",
                &ChannelId::from(4),
                Subtree::INACTIVE_STREAMS,
            )
            .unwrap();

        assert_eq!(outcome.to, Subtree::ACTIVE_STREAMS);
        assert!(outcome.view_mirrored);
        assert_eq!(
            read(&tree, "catalog/dev01/activeStreams/s_temp"),
            Some(json!({"channelID": 4}))
        );
        assert_eq!(read(&tree, "catalog/dev01/inactiveStreams/s_temp"), None);
        assert_eq!(
            read(&tree, "views/lab/dev01/active/s_temp"),
            Some(json!({"name": "Desk Thermometer", "widget": "temp"}))
        );
    }

    #[test]
    fn test_deactivate_removes_active_entry() {
        let (tree, handler) = setup(seed());

        let outcome = handler.toggle_by_name(&"dev01".into(), "e_door").unwrap();

        assert_eq!(outcome.from, Subtree::ACTIVE_EVENTS);
        assert_eq!(outcome.to, Subtree::INACTIVE_EVENTS);
        assert_eq!(
            read(&tree, "catalog/dev01/inactiveEvents/e_door"),
            Some(json!({"channelID": 9}))
        );
        assert_eq!(read(&tree, "catalog/dev01/activeEvents/e_door"), None);
        assert_eq!(read(&tree, "views/lab/dev01/active/e_door"), None);
        // The available entry is untouched.
        assert!(read(&tree, "views/lab/dev01/available/e_door").is_some());
    }

    #[test]
    fn test_toggle_twice_restores_catalog() {
        let (tree, handler) = setup(seed());
        let before = read(&tree, "catalog/dev01");

        handler.toggle_by_name(&"dev01".into(), "s_temp").unwrap();
        handler.toggle_by_name(&"dev01".into(), "s_temp").unwrap();

        assert_eq!(read(&tree, "catalog/dev01"), before);
        assert_eq!(read(&tree, "views/lab/dev01/active/s_temp"), None);
    }

    #[test]
    fn test_activate_without_available_entry() {
        let (tree, handler) = setup(json!({
            "catalog": {"dev01": {
                "name": "Hall", "room": "lab",
                "inactiveEvents": {"e_motion": {"channelID": 2}}
            }}
        }));

        let outcome = handler.toggle_by_name(&"dev01".into(), "e_motion").unwrap();
        assert!(!outcome.view_mirrored);
        assert!(read(&tree, "catalog/dev01/activeEvents/e_motion").is_some());
        assert_eq!(read(&tree, "views/lab/dev01/active/e_motion"), None);
    }

    #[test]
    fn test_toggle_by_name_errors() {
        let (_tree, handler) = setup(json!({
            "catalog": {
                "dev01": {"name": "Hall", "room": "lab"},
                "dev02": {"inactiveEvents": {"e_motion": {"channelID": 2}}}
            }
        }));

        let missing = handler.toggle_by_name(&"dev01".into(), "nope");
        assert!(matches!(missing, Err(SyncError::UnknownSubscription { .. })));

        let unprovisioned = handler.toggle_by_name(&"dev02".into(), "e_motion");
        assert!(matches!(unprovisioned, Err(SyncError::NotProvisioned(_))));
    }

    #[test]
    fn test_write_failure_is_surfaced() {
        let (tree, handler) = setup(seed());
        tree.set_online(false);

        let result = handler.toggle(
            &"dev01".into(),
            &"lab".into(),
            "s_temp",
            &ChannelId::from(4),
            Subtree::INACTIVE_STREAMS,
        );
        assert!(matches!(result, Err(SyncError::StoreUnavailable(_))));

        tree.set_online(true);
        assert_eq!(
            read(&tree, "catalog/dev01/inactiveStreams/s_temp"),
            Some(json!({"channelID": 4}))
        );
    }

    #[test]
    fn test_binding_without_channel_moves_intact() {
        let (tree, handler) = setup(json!({
            "catalog": {"dev01": {
                "name": "Hall", "room": "lab",
                "inactiveEvents": {"sensor_door": {"name": "Door"}}
            }},
            "views": {"lab": {"dev01": {
                "available": {"sensor_door": {"name": "Hall Door", "widget": ""}}
            }}}
        }));

        let outcome = handler.toggle_by_name(&"dev01".into(), "sensor_door").unwrap();

        assert_eq!(outcome.to, Subtree::ACTIVE_EVENTS);
        assert_eq!(
            read(&tree, "catalog/dev01/activeEvents/sensor_door"),
            Some(json!({"name": "Door"}))
        );
        assert_eq!(read(&tree, "catalog/dev01/inactiveEvents/sensor_door"), None);
        assert!(read(&tree, "views/lab/dev01/active/sensor_door").is_some());

        handler.toggle_by_name(&"dev01".into(), "sensor_door").unwrap();
        assert_eq!(
            read(&tree, "catalog/dev01/inactiveEvents/sensor_door"),
            Some(json!({"name": "Door"}))
        );
        assert_eq!(read(&tree, "catalog/dev01/activeEvents/sensor_door"), None);
    }

    #[test]
    fn test_nothing_to_move_keeps_catalog() {
        let (tree, handler) = setup(seed());
        let before = tree.export_json();

        let result = handler.toggle(
            &"dev01".into(),
            &"lab".into(),
            "s_missing",
            &ChannelId::default(),
            Subtree::INACTIVE_STREAMS,
        );

        assert!(matches!(result, Err(SyncError::InvalidOperation(_))));
        assert_eq!(tree.export_json(), before);
    }
}
