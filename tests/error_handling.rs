//! Error handling tests.

use roomsync::{
    validate_agent_id, DeviceAdmin, DeviceConfig, Layout, MemoryTree, Reconciler, RoomId, Subtree,
    SyncConfig, SyncError, ToggleHandler, TreePath, TreeStore, ViewEntry, ViewTarget, WidgetKind,
};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

fn store(seed: serde_json::Value) -> (Arc<MemoryTree>, Arc<dyn TreeStore>, Layout) {
    let tree = Arc::new(MemoryTree::from_json(seed));
    let store: Arc<dyn TreeStore> = tree.clone();
    (tree, store, Layout::new(&SyncConfig::default()))
}

#[test]
fn test_malformed_subtree_name_fails_loudly() {
    let err = "activeStream".parse::<Subtree>().unwrap_err();
    assert!(matches!(err, SyncError::InvalidSubtree(ref name) if name == "activeStream"));
    assert!("".parse::<Subtree>().is_err());
    assert!("ActiveStreams".parse::<Subtree>().is_err());
}

#[test]
fn test_invalid_paths() {
    assert!(matches!(TreePath::parse("catalog//dev01"), Err(SyncError::InvalidPath(_))));
    assert!(TreePath::parse("/catalog/dev01/").is_ok());
}

#[test]
fn test_missing_data_is_not_an_error() {
    let (tree, store, layout) = store(json!({}));
    let reconciler = Reconciler::new(store, layout);

    assert!(reconciler.catalog().list_devices().unwrap().is_empty());
    let summary = reconciler.resync_all().unwrap();
    assert!(summary.synced.is_empty());
    assert_eq!(tree.mutation_count(), 0);
}

#[test]
fn test_offline_store_fails_every_operation() {
    let (tree, store, layout) = store(json!({
        "catalog": {"0c2a69000001": {
            "name": "Hall", "room": "lab",
            "inactiveStreams": {"s_temp": {"channelID": 1}}
        }}
    }));
    tree.set_online(false);

    let reconciler = Reconciler::new(Arc::clone(&store), layout.clone());
    assert!(matches!(reconciler.resync_all(), Err(SyncError::StoreUnavailable(_))));

    let toggles = ToggleHandler::new(Arc::clone(&store), layout.clone());
    assert!(matches!(
        toggles.toggle_by_name(&"0c2a69000001".into(), "s_temp"),
        Err(SyncError::StoreUnavailable(_))
    ));

    let admin = DeviceAdmin::new(store, layout);
    assert!(matches!(
        admin.delete_device(&"0c2a69000001".into()),
        Err(SyncError::StoreUnavailable(_))
    ));

    // Nothing was changed while offline.
    tree.set_online(true);
    assert_eq!(tree.mutation_count(), 0);
}

#[test]
fn test_failed_write_leaves_other_keys_alone() {
    let (tree, store, layout) = store(json!({
        "catalog": {"0c2a69000001": {"name": "Hall", "room": "lab"}}
    }));
    let reconciler = Reconciler::new(store, layout);
    let before = tree.export_json();

    tree.set_online(false);
    let source: BTreeSet<String> = ["s_a".to_string(), "s_b".to_string()].into();
    assert!(reconciler
        .reconcile(&"0c2a69000001".into(), ViewTarget::Available, &source)
        .is_err());
    tree.set_online(true);

    assert_eq!(tree.export_json(), before);
}

#[test]
fn test_malformed_view_entry_does_not_block_reconcile() {
    let (tree, store, layout) = store(json!({
        "catalog": {"0c2a69000001": {
            "name": "Hall", "room": "lab",
            "activeStreams": {"s_temp": {"channelID": 1}}
        }},
        "views": {"lab": {"0c2a69000001": {"available": {"s_temp": "not an entry"}}}}
    }));
    let reconciler = Reconciler::new(store, layout);

    let report = reconciler.resync_device(&"0c2a69000001".into()).unwrap().unwrap();
    assert_eq!(report.active.created, vec!["s_temp".to_string()]);

    // The administrator's value is left for them to fix.
    let available = TreePath::parse("views/lab/0c2a69000001/available/s_temp").unwrap();
    assert_eq!(tree.read(&available).unwrap(), Some(json!("not an entry")));
    let active = TreePath::parse("views/lab/0c2a69000001/active/s_temp").unwrap();
    assert_eq!(tree.read(&active).unwrap(), Some(json!({"name": "Hall Temp", "widget": ""})));
}

#[test]
fn test_admin_errors() {
    let (_tree, store, layout) = store(json!({
        "catalog": {
            "0c2a69000001": {"inactiveStreams": {"s_temp": {"channelID": 1}}}
        }
    }));
    let admin = DeviceAdmin::new(store, layout);

    assert!(matches!(validate_agent_id("0c2a6900"), Err(SyncError::InvalidAgentId(_))));
    assert!(matches!(
        admin.add_device("0c2a69000001", &RoomId::from(""), "Hall"),
        Err(SyncError::InvalidOperation(_))
    ));

    let config = DeviceConfig::new("0c2a69000001".into())
        .subscription("s_temp", ViewEntry::new("Temp", WidgetKind::Temp));
    assert!(matches!(
        admin.configure_device(&config),
        Err(SyncError::NotProvisioned(_))
    ));
}

#[test]
fn test_error_messages() {
    let err = SyncError::UnknownSubscription {
        device: "0c2a69000001".to_string(),
        subscription: "s_temp".to_string(),
    };
    assert_eq!(err.to_string(), "Subscription s_temp not found for device 0c2a69000001");

    let err = SyncError::DuplicateWidget {
        widget: WidgetKind::Temp.to_string(),
    };
    assert_eq!(err.to_string(), "Widget temp assigned to more than one subscription");
}
