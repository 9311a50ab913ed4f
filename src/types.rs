//! Core types for the catalog and the room view.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique agent identifier of a device.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

/// Room (location) key in the view store.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        RoomId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoomId({})", self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        RoomId(s.to_string())
    }
}

/// Opaque channel binding of a subscription.
///
/// Devices report channels as numbers or strings; the engine never interprets
/// the value, it only copies it between subtrees.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ChannelId(pub serde_json::Value);

impl ChannelId {
    /// Key form used when the channel id appears as a path segment.
    pub fn as_key(&self) -> String {
        match &self.0 {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

impl From<u64> for ChannelId {
    fn from(n: u64) -> Self {
        ChannelId(serde_json::Value::from(n))
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        ChannelId(serde_json::Value::from(s))
    }
}

/// Dashboard widget a subscription is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WidgetKind {
    Light,
    Temp,
    Humid,
    /// Not shown on the dashboard. Stored as the empty string.
    #[default]
    None,
}

impl WidgetKind {
    pub const DISPLAYED: [WidgetKind; 3] = [WidgetKind::Light, WidgetKind::Temp, WidgetKind::Humid];

    pub fn as_str(self) -> &'static str {
        match self {
            WidgetKind::Light => "light",
            WidgetKind::Temp => "temp",
            WidgetKind::Humid => "humid",
            WidgetKind::None => "",
        }
    }
}

impl From<String> for WidgetKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "light" => WidgetKind::Light,
            "temp" => WidgetKind::Temp,
            "humid" => WidgetKind::Humid,
            _ => WidgetKind::None,
        }
    }
}

impl From<WidgetKind> for String {
    fn from(w: WidgetKind) -> Self {
        w.as_str().to_string()
    }
}

impl fmt::Display for WidgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WidgetKind::None => f.write_str("none"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Whether a subscription is a continuous stream or a discrete event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionKind {
    Stream,
    Event,
}

/// Activation state of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Activation {
    Active,
    Inactive,
}

impl Activation {
    pub fn flipped(self) -> Self {
        match self {
            Activation::Active => Activation::Inactive,
            Activation::Inactive => Activation::Active,
        }
    }
}

/// One of the four catalog subtrees holding subscription bindings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subtree {
    pub kind: SubscriptionKind,
    pub activation: Activation,
}

impl Subtree {
    pub const ACTIVE_STREAMS: Subtree = Subtree::new(SubscriptionKind::Stream, Activation::Active);
    pub const INACTIVE_STREAMS: Subtree =
        Subtree::new(SubscriptionKind::Stream, Activation::Inactive);
    pub const ACTIVE_EVENTS: Subtree = Subtree::new(SubscriptionKind::Event, Activation::Active);
    pub const INACTIVE_EVENTS: Subtree =
        Subtree::new(SubscriptionKind::Event, Activation::Inactive);

    /// All four subtrees, in catalog order.
    pub const ALL: [Subtree; 4] = [
        Subtree::ACTIVE_STREAMS,
        Subtree::INACTIVE_STREAMS,
        Subtree::ACTIVE_EVENTS,
        Subtree::INACTIVE_EVENTS,
    ];

    /// The two subtrees that feed the `active` view.
    pub const ACTIVE: [Subtree; 2] = [Subtree::ACTIVE_STREAMS, Subtree::ACTIVE_EVENTS];

    pub const fn new(kind: SubscriptionKind, activation: Activation) -> Self {
        Self { kind, activation }
    }

    /// Same kind, flipped activation.
    pub fn opposite(self) -> Self {
        Self {
            kind: self.kind,
            activation: self.activation.flipped(),
        }
    }

    pub fn is_active(self) -> bool {
        self.activation == Activation::Active
    }

    /// Path segment name in the catalog.
    pub fn as_str(self) -> &'static str {
        match (self.activation, self.kind) {
            (Activation::Active, SubscriptionKind::Stream) => "activeStreams",
            (Activation::Inactive, SubscriptionKind::Stream) => "inactiveStreams",
            (Activation::Active, SubscriptionKind::Event) => "activeEvents",
            (Activation::Inactive, SubscriptionKind::Event) => "inactiveEvents",
        }
    }
}

impl fmt::Display for Subtree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subtree {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Subtree::ALL
            .into_iter()
            .find(|subtree| subtree.as_str() == s)
            .ok_or_else(|| SyncError::InvalidSubtree(s.to_string()))
    }
}

/// View subtree under `views/{room}/{device}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ViewTarget {
    /// Every subscription the device declares.
    Available,
    /// Subscriptions currently active.
    Active,
}

impl ViewTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            ViewTarget::Available => "available",
            ViewTarget::Active => "active",
        }
    }
}

impl fmt::Display for ViewTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Room view entry (also the shape of the catalog `available` mirror).
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "widgetKind")]
    pub widget: WidgetKind,
}

impl ViewEntry {
    pub fn new(name: impl Into<String>, widget: WidgetKind) -> Self {
        Self {
            name: name.into(),
            widget,
        }
    }
}

/// Channel binding stored in one of the four catalog subtrees.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "channelID", default)]
    pub channel_id: ChannelId,
}

impl CatalogEntry {
    pub fn new(channel_id: impl Into<ChannelId>) -> Self {
        Self {
            channel_id: channel_id.into(),
        }
    }
}

/// Resolved device metadata. Only exists once the device is provisioned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub room: RoomId,
}
