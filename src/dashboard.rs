//! Read models for the dashboard.
//!
//! Rendering lives elsewhere. This module answers what a room shows:
//! the active subscriptions per device, which of them drive the light,
//! temperature and humidity widgets, and a live feed of changes.

use crate::catalog::CatalogReader;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::tree::{Layout, TreeEvent, TreeStore, TreeStoreExt, WatchConfig, WatchHandle};
use crate::types::{ChannelId, DeviceId, RoomId, Subtree, ViewEntry, WidgetKind};
use crossbeam_channel::{RecvError, Select};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One active subscription as a room shows it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveSubscription {
    pub device: DeviceId,
    pub subscription: String,
    pub entry: ViewEntry,
}

/// Widget bindings of one device in a room.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DevicePanel {
    pub device: DeviceId,
    pub title: String,
    pub light: Option<String>,
    pub temp: Option<String>,
    pub humid: Option<String>,
}

impl DevicePanel {
    /// Subscription bound to `widget`, if any.
    pub fn slot(&self, widget: WidgetKind) -> Option<&str> {
        match widget {
            WidgetKind::Light => self.light.as_deref(),
            WidgetKind::Temp => self.temp.as_deref(),
            WidgetKind::Humid => self.humid.as_deref(),
            WidgetKind::None => None,
        }
    }

    fn bind(&mut self, widget: WidgetKind, subscription: &str) {
        let slot = match widget {
            WidgetKind::Light => &mut self.light,
            WidgetKind::Temp => &mut self.temp,
            WidgetKind::Humid => &mut self.humid,
            WidgetKind::None => return,
        };
        // First binding in key order wins.
        if slot.is_none() {
            *slot = Some(subscription.to_string());
        }
    }
}

/// A subscription card on the channels board.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelCard {
    pub device: DeviceId,
    pub subscription: String,
    pub channel: ChannelId,
    /// Display name from the room view, empty until provisioned.
    pub title: String,
    pub sensor_type: Option<String>,
    /// "Device in Room", once the device is provisioned.
    pub area: Option<String>,
}

/// All cards of one catalog subtree.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelColumn {
    pub subtree: Subtree,
    pub cards: Vec<ChannelCard>,
}

/// Shape of `views/{room}/{device}`.
#[derive(Default, Deserialize)]
struct DeviceView {
    #[serde(default)]
    available: BTreeMap<String, ViewEntry>,
    #[serde(default)]
    active: BTreeMap<String, ViewEntry>,
}

/// Dashboard queries over the room view.
#[derive(Clone)]
pub struct Dashboard {
    store: Arc<dyn TreeStore>,
    layout: Layout,
    catalog: CatalogReader,
    config: SyncConfig,
}

impl Dashboard {
    pub fn new(store: Arc<dyn TreeStore>, config: &SyncConfig) -> Self {
        let layout = Layout::new(config);
        Self {
            catalog: CatalogReader::new(Arc::clone(&store), layout.clone()),
            store,
            layout,
            config: config.clone(),
        }
    }

    pub fn room_display_name(&self, room: &RoomId) -> String {
        self.config.room_display_name(room.as_str()).to_string()
    }

    fn room_view(&self, room: &RoomId) -> Result<BTreeMap<DeviceId, DeviceView>> {
        Ok(self
            .store
            .read_as(&self.layout.room(room))?
            .unwrap_or_default())
    }

    /// Every active subscription in a room, ordered by device then name.
    pub fn active_subscriptions(&self, room: &RoomId) -> Result<Vec<ActiveSubscription>> {
        let mut out = Vec::new();
        for (device, view) in self.room_view(room)? {
            for (subscription, entry) in view.active {
                out.push(ActiveSubscription {
                    device: device.clone(),
                    subscription,
                    entry,
                });
            }
        }
        Ok(out)
    }

    /// Widget panels of every device with active subscriptions in a room.
    pub fn panels(&self, room: &RoomId) -> Result<Vec<DevicePanel>> {
        let mut panels = Vec::new();
        for (device, view) in self.room_view(room)? {
            if view.active.is_empty() {
                continue;
            }
            let title = match self.catalog.device_info(&device)? {
                Some(info) => info.name,
                None => device.to_string(),
            };
            let mut panel = DevicePanel {
                device,
                title,
                ..Default::default()
            };
            for (subscription, entry) in &view.active {
                panel.bind(entry.widget, subscription);
            }
            panels.push(panel);
        }
        Ok(panels)
    }

    /// The channels page: every catalog binding, grouped by subtree.
    pub fn channel_board(&self) -> Result<Vec<ChannelColumn>> {
        let mut columns: Vec<ChannelColumn> = Subtree::ALL
            .iter()
            .map(|subtree| ChannelColumn {
                subtree: *subtree,
                cards: Vec::new(),
            })
            .collect();

        for device in self.catalog.list_devices()? {
            let info = self.catalog.device_info(&device)?;
            let view = match &info {
                Some(info) => self
                    .store
                    .read_as::<DeviceView>(&self.layout.view_device(&info.room, &device))?
                    .unwrap_or_default(),
                None => DeviceView::default(),
            };
            let area = info
                .as_ref()
                .map(|i| format!("{} in {}", i.name, self.room_display_name(&i.room)));

            for column in &mut columns {
                let bindings = self.catalog.list_subscriptions(&device, column.subtree)?;
                for (subscription, entry) in bindings {
                    let title = view
                        .available
                        .get(&subscription)
                        .map(|e| e.name.clone())
                        .unwrap_or_default();
                    column.cards.push(ChannelCard {
                        sensor_type: self.catalog.channel_type(&device, &entry.channel_id)?,
                        device: device.clone(),
                        subscription,
                        channel: entry.channel_id,
                        title,
                        area: area.clone(),
                    });
                }
            }
        }
        Ok(columns)
    }

    /// Open a live feed of one room's active subscriptions.
    pub fn feed(&self, room: &RoomId) -> Result<RoomFeed> {
        RoomFeed::open(
            Arc::clone(&self.store),
            self.layout.clone(),
            room.clone(),
            self.config.watch_buffer_size,
        )
    }
}

/// A change to what a room shows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DashboardUpdate {
    Upsert {
        device: DeviceId,
        subscription: String,
        entry: ViewEntry,
    },
    Remove {
        device: DeviceId,
        subscription: String,
    },
}

struct FollowedDevice {
    watch: WatchHandle,
    shown: BTreeSet<String>,
}

enum FeedWake {
    Room(std::result::Result<TreeEvent, RecvError>),
    Device(DeviceId, std::result::Result<TreeEvent, RecvError>),
}

/// Live feed of one room.
///
/// Starts with an `Upsert` per active subscription already present, then
/// follows changes, including devices entering and leaving the room.
/// If the store drops the room watch the feed fails with
/// [`SyncError::WatchClosed`] and a new one has to be opened.
pub struct RoomFeed {
    store: Arc<dyn TreeStore>,
    layout: Layout,
    room: RoomId,
    buffer_size: usize,
    room_watch: WatchHandle,
    devices: BTreeMap<DeviceId, FollowedDevice>,
    pending: VecDeque<DashboardUpdate>,
}

impl RoomFeed {
    fn open(
        store: Arc<dyn TreeStore>,
        layout: Layout,
        room: RoomId,
        buffer_size: usize,
    ) -> Result<Self> {
        let room_watch = store.watch(&layout.room(&room), WatchConfig::replay(buffer_size))?;
        Ok(Self {
            store,
            layout,
            room,
            buffer_size,
            room_watch,
            devices: BTreeMap::new(),
            pending: VecDeque::new(),
        })
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Devices currently shown.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.devices.keys().cloned().collect()
    }

    /// Next update, waiting at most `timeout`. `Ok(None)` on timeout.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<DashboardUpdate>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(update) = self.pending.pop_front() {
                return Ok(Some(update));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.wait(remaining) {
                None => return Ok(None),
                Some(FeedWake::Room(event)) => self.on_room(event)?,
                Some(FeedWake::Device(device, event)) => self.on_device(device, event)?,
            }
        }
    }

    /// Next update if one is ready.
    pub fn try_next(&mut self) -> Result<Option<DashboardUpdate>> {
        self.recv_timeout(Duration::ZERO)
    }

    fn wait(&self, timeout: Duration) -> Option<FeedWake> {
        let followed: Vec<(&DeviceId, &FollowedDevice)> = self.devices.iter().collect();

        let mut select = Select::new();
        select.recv(&self.room_watch.receiver);
        for (_, device) in &followed {
            select.recv(&device.watch.receiver);
        }

        let operation = select.select_timeout(timeout).ok()?;
        let index = operation.index();
        if index == 0 {
            return Some(FeedWake::Room(operation.recv(&self.room_watch.receiver)));
        }
        let (id, device) = followed[index - 1];
        Some(FeedWake::Device(id.clone(), operation.recv(&device.watch.receiver)))
    }

    fn on_room(&mut self, event: std::result::Result<TreeEvent, RecvError>) -> Result<()> {
        match event {
            Ok(TreeEvent::Added { key, .. }) => self.follow(DeviceId(key)),
            Ok(TreeEvent::Removed { key, .. }) => {
                self.unfollow(&DeviceId(key));
                Ok(())
            }
            // Entry changes arrive on the device watches.
            Ok(TreeEvent::Changed { .. }) | Ok(TreeEvent::CaughtUp) => Ok(()),
            Ok(TreeEvent::Dropped { .. }) | Err(_) => {
                tracing::warn!(room = %self.room, "room watch lost, closing feed");
                Err(SyncError::WatchClosed)
            }
        }
    }

    fn on_device(
        &mut self,
        device: DeviceId,
        event: std::result::Result<TreeEvent, RecvError>,
    ) -> Result<()> {
        let Some(followed) = self.devices.get_mut(&device) else {
            return Ok(());
        };
        match event {
            Ok(TreeEvent::Added { key, value }) | Ok(TreeEvent::Changed { key, value }) => {
                match serde_json::from_value::<ViewEntry>(value) {
                    Ok(entry) => {
                        followed.shown.insert(key.clone());
                        self.pending.push_back(DashboardUpdate::Upsert {
                            device,
                            subscription: key,
                            entry,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(
                            room = %self.room,
                            device = %device,
                            subscription = %key,
                            error = %e,
                            "skipping malformed view entry"
                        );
                    }
                }
                Ok(())
            }
            Ok(TreeEvent::Removed { key, .. }) => {
                if followed.shown.remove(&key) {
                    self.pending.push_back(DashboardUpdate::Remove {
                        device,
                        subscription: key,
                    });
                }
                Ok(())
            }
            Ok(TreeEvent::CaughtUp) => Ok(()),
            Ok(TreeEvent::Dropped { .. }) | Err(_) => {
                tracing::debug!(
                    room = %self.room,
                    device = %device,
                    "device watch lost, following again"
                );
                self.unfollow(&device);
                self.follow(device)
            }
        }
    }

    fn follow(&mut self, device: DeviceId) -> Result<()> {
        if self.devices.contains_key(&device) {
            return Ok(());
        }
        let path = self
            .layout
            .view(&self.room, &device, crate::types::ViewTarget::Active);
        let watch = self.store.watch(&path, WatchConfig::replay(self.buffer_size))?;
        tracing::trace!(room = %self.room, device = %device, "following device");
        self.devices.insert(
            device,
            FollowedDevice {
                watch,
                shown: BTreeSet::new(),
            },
        );
        Ok(())
    }

    fn unfollow(&mut self, device: &DeviceId) {
        let Some(followed) = self.devices.remove(device) else {
            return;
        };
        self.store.unwatch(followed.watch.id);
        for subscription in followed.shown {
            self.pending.push_back(DashboardUpdate::Remove {
                device: device.clone(),
                subscription,
            });
        }
    }
}

impl Drop for RoomFeed {
    fn drop(&mut self) {
        self.store.unwatch(self.room_watch.id);
        for followed in self.devices.values() {
            self.store.unwatch(followed.watch.id);
        }
    }
}
