//! Engine configuration.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Sync engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root segment of the per-device catalog.
    pub catalog_root: String,

    /// Root segment of the per-room view.
    pub views_root: String,

    /// Max buffered tree events per watch before the watcher is dropped.
    /// Default: 1024
    pub watch_buffer_size: usize,

    /// Max buffered outbound sync events.
    /// Default: 4096
    pub event_buffer_size: usize,

    /// Replay existing `available` view entries when a device is attached,
    /// so catalog mirrors missed while detached get seeded.
    pub replay_view_on_attach: bool,

    /// Display names of rooms, keyed by room id.
    pub rooms: BTreeMap<String, String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let rooms = [
            ("maxwell", "Maxwell"),
            ("hertz", "Hertz"),
            ("faraday", "Faraday"),
            ("gauss", "Gauss"),
            ("watt", "Watt"),
            ("balcrear", "Balcony Rear"),
            ("ampere", "Ampere"),
            ("volta", "Volta"),
            ("reception", "Reception"),
            ("lab", "Lab"),
            ("kitchen", "Kitchen"),
            ("balcfront", "Balcony Front"),
            ("openofficearea", "Open Office Area"),
            ("closet", "Closet"),
        ]
        .into_iter()
        .map(|(id, name)| (id.to_string(), name.to_string()))
        .collect();

        Self {
            catalog_root: "catalog".to_string(),
            views_root: "views".to_string(),
            watch_buffer_size: 1024,
            event_buffer_size: 4096,
            replay_view_on_attach: true,
            rooms,
        }
    }
}

impl SyncConfig {
    /// Load a config from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config = serde_json::from_slice(&bytes)?;
        Ok(config)
    }

    /// Display name of a room, falling back to the room id.
    pub fn room_display_name<'a>(&'a self, room: &'a str) -> &'a str {
        self.rooms.get(room).map(String::as_str).unwrap_or(room)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sync.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(br#"{"watch_buffer_size": 8, "rooms": {"attic": "Attic"}}"#)
            .unwrap();

        let config = SyncConfig::from_json_file(&path).unwrap();
        assert_eq!(config.watch_buffer_size, 8);
        assert_eq!(config.catalog_root, "catalog");
        assert_eq!(config.room_display_name("attic"), "Attic");
        // A provided room table replaces the default one.
        assert_eq!(config.room_display_name("maxwell"), "maxwell");
    }

    #[test]
    fn test_missing_config_file() {
        let result = SyncConfig::from_json_file("/nonexistent/sync.json");
        assert!(matches!(result, Err(crate::SyncError::Io(_))));
    }

    #[test]
    fn test_default_room_names() {
        let config = SyncConfig::default();
        assert_eq!(config.room_display_name("balcrear"), "Balcony Rear");
        assert_eq!(config.room_display_name("unknown"), "unknown");
    }
}
