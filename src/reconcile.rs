//! View reconciliation.
//!
//! The room view is a cache derived from the catalog. Reconciling one view
//! subtree computes three sets from the catalog source names `S` and the
//! existing view keys `V`:
//!
//! - create: `S \ V`, written with a humanized default name
//! - keep: `S ∩ V`, left untouched so administrator edits survive
//! - delete: `V \ S`, removed outright
//!
//! Running it twice without a catalog change issues no writes the second time.

use crate::catalog::CatalogReader;
use crate::error::{Result, SyncError};
use crate::tree::{Layout, TreeStore, TreeStoreExt};
use crate::types::{DeviceId, DeviceInfo, RoomId, ViewEntry, ViewTarget, WidgetKind};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Turn a raw subscription id into a display label.
///
/// Drops everything up to the last underscore, puts a space before each
/// inner capital letter and capitalizes the first letter:
/// `sensor_lightLevel` becomes `Light Level`.
pub fn humanize(raw: &str) -> String {
    let tail = raw.rsplit('_').next().unwrap_or(raw);

    let mut spaced = String::with_capacity(tail.len() + 4);
    for (i, ch) in tail.chars().enumerate() {
        if i > 0 && ch.is_ascii_uppercase() {
            spaced.push(' ');
        }
        spaced.push(ch);
    }

    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Default view name for a subscription: device name plus humanized id.
pub fn default_display_name(device_name: &str, raw: &str) -> String {
    let label = humanize(raw);
    if label.is_empty() {
        device_name.to_string()
    } else {
        format!("{} {}", device_name, label)
    }
}

/// Default view entry for a subscription nobody has configured yet.
pub fn default_entry(device_name: &str, raw: &str) -> ViewEntry {
    ViewEntry::new(default_display_name(device_name, raw), WidgetKind::None)
}

/// Partition of catalog names against existing view keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub create: BTreeSet<String>,
    pub keep: BTreeSet<String>,
    pub delete: BTreeSet<String>,
}

impl ReconcilePlan {
    pub fn compute(source: &BTreeSet<String>, existing: &BTreeSet<String>) -> Self {
        Self {
            create: source.difference(existing).cloned().collect(),
            keep: source.intersection(existing).cloned().collect(),
            delete: existing.difference(source).cloned().collect(),
        }
    }

    /// True when applying the plan would not touch the store.
    pub fn is_noop(&self) -> bool {
        self.create.is_empty() && self.delete.is_empty()
    }
}

/// What one reconciliation pass did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileReport {
    pub device: DeviceId,
    pub room: RoomId,
    pub target: ViewTarget,
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub kept: usize,
}

impl ReconcileReport {
    /// Number of store writes and deletes issued.
    pub fn writes(&self) -> usize {
        self.created.len() + self.deleted.len()
    }
}

/// Both view subtrees of one device after a resync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResyncReport {
    pub available: ReconcileReport,
    pub active: ReconcileReport,
}

impl ResyncReport {
    pub fn writes(&self) -> usize {
        self.available.writes() + self.active.writes()
    }
}

/// Outcome of a full resync over every catalog device.
#[derive(Clone, Debug, Default)]
pub struct ResyncSummary {
    pub synced: Vec<ResyncReport>,
    /// Devices without a name or room yet.
    pub deferred: Vec<DeviceId>,
}

impl ResyncSummary {
    pub fn writes(&self) -> usize {
        self.synced.iter().map(ResyncReport::writes).sum()
    }
}

/// Applies catalog state to the room view.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn TreeStore>,
    layout: Layout,
    catalog: CatalogReader,
}

impl Reconciler {
    pub fn new(store: Arc<dyn TreeStore>, layout: Layout) -> Self {
        let catalog = CatalogReader::new(Arc::clone(&store), layout.clone());
        Self {
            store,
            layout,
            catalog,
        }
    }

    pub fn catalog(&self) -> &CatalogReader {
        &self.catalog
    }

    /// Reconcile one view subtree of a device against `source`.
    ///
    /// Returns `Ok(None)` when the device has no name or room yet; the next
    /// trigger retries.
    pub fn reconcile(
        &self,
        device: &DeviceId,
        target: ViewTarget,
        source: &BTreeSet<String>,
    ) -> Result<Option<ReconcileReport>> {
        match self.catalog.device_info(device)? {
            Some(info) => self.reconcile_in(&info, target, source).map(Some),
            None => {
                tracing::debug!(
                    device = %device,
                    view = %target,
                    "device not provisioned, skipping reconcile"
                );
                Ok(None)
            }
        }
    }

    /// Reconcile one view subtree of an already-resolved device.
    pub fn reconcile_in(
        &self,
        info: &DeviceInfo,
        target: ViewTarget,
        source: &BTreeSet<String>,
    ) -> Result<ReconcileReport> {
        let view_path = self.layout.view(&info.room, &info.id, target);
        let existing = self.store.keys(&view_path)?;
        let plan = ReconcilePlan::compute(source, &existing);

        for name in &plan.create {
            // New active entries start as a copy of their available entry.
            let template = match target {
                ViewTarget::Active => self.active_template(info, name)?,
                ViewTarget::Available => None,
            };
            let entry = template.unwrap_or_else(|| default_entry(&info.name, name));
            self.store.write_as(&view_path.child(name.as_str()), &entry)?;
        }

        for name in &plan.delete {
            self.store.delete(&view_path.child(name.as_str()))?;
        }

        if !plan.is_noop() {
            tracing::debug!(
                device = %info.id,
                room = %info.room,
                view = %target,
                created = plan.create.len(),
                deleted = plan.delete.len(),
                "reconciled view"
            );
        }

        Ok(ReconcileReport {
            device: info.id.clone(),
            room: info.room.clone(),
            target,
            created: plan.create.into_iter().collect(),
            deleted: plan.delete.into_iter().collect(),
            kept: plan.keep.len(),
        })
    }

    /// Available entry a new active entry is copied from. A malformed one is
    /// skipped so the rest of the device still reconciles.
    fn active_template(&self, info: &DeviceInfo, name: &str) -> Result<Option<ViewEntry>> {
        let path = self
            .layout
            .view(&info.room, &info.id, ViewTarget::Available)
            .child(name);
        match self.store.read_as::<ViewEntry>(&path) {
            Err(SyncError::MalformedValue { path, reason }) => {
                tracing::warn!(
                    device = %info.id,
                    %path,
                    %reason,
                    "ignoring malformed available entry"
                );
                Ok(None)
            }
            other => other,
        }
    }

    /// Bring both view subtrees of a device in line with the catalog.
    pub fn resync_device(&self, device: &DeviceId) -> Result<Option<ResyncReport>> {
        let Some(info) = self.catalog.device_info(device)? else {
            tracing::debug!(device = %device, "device not provisioned, skipping resync");
            return Ok(None);
        };
        self.resync_resolved(&info).map(Some)
    }

    /// Resync with metadata the caller already holds.
    pub fn resync_resolved(&self, info: &DeviceInfo) -> Result<ResyncReport> {
        // Available first so new active entries can copy from it.
        let all = self.catalog.subscription_names(&info.id)?;
        let available = self.reconcile_in(info, ViewTarget::Available, &all)?;

        let active_names = self.catalog.active_names(&info.id)?;
        let active = self.reconcile_in(info, ViewTarget::Active, &active_names)?;

        Ok(ResyncReport { available, active })
    }

    /// Startup resync of every device in the catalog.
    pub fn resync_all(&self) -> Result<ResyncSummary> {
        let mut summary = ResyncSummary::default();
        for device in self.catalog.list_devices()? {
            match self.resync_device(&device)? {
                Some(report) => summary.synced.push(report),
                None => summary.deferred.push(device),
            }
        }
        tracing::info!(
            synced = summary.synced.len(),
            deferred = summary.deferred.len(),
            writes = summary.writes(),
            "full resync finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::tree::{MemoryTree, TreePath};
    use serde_json::{json, Value};

    fn setup(seed: Value) -> (Arc<MemoryTree>, Reconciler) {
        let tree = Arc::new(MemoryTree::from_json(seed));
        let store: Arc<dyn TreeStore> = tree.clone();
        let reconciler = Reconciler::new(store, Layout::new(&SyncConfig::default()));
        (tree, reconciler)
    }

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn path(s: &str) -> TreePath {
        TreePath::parse(s).unwrap()
    }

    #[test]
    fn test_humanize_examples() {
        assert_eq!(humanize("sensor_lightLevel"), "Light Level");
        assert_eq!(humanize("dev01_humidSensor"), "Humid Sensor");
        assert_eq!(humanize("dev01_temp"), "Temp");
        assert_eq!(humanize("a_b_visibleLight"), "Visible Light");
        assert_eq!(humanize("temperature"), "Temperature");
        assert_eq!(humanize("trailing_"), "");
    }

    #[test]
    fn test_default_display_name() {
        assert_eq!(default_display_name("Hall", "sensor_lightLevel"), "Hall Light Level");
        assert_eq!(default_display_name("Hall", "x_"), "Hall");
    }

    #[test]
    fn test_plan_partitions() {
        let plan = ReconcilePlan::compute(&names(&["a", "b", "c"]), &names(&["b", "c", "d"]));
        assert_eq!(plan.create, names(&["a"]));
        assert_eq!(plan.keep, names(&["b", "c"]));
        assert_eq!(plan.delete, names(&["d"]));
        assert!(!plan.is_noop());

        let same = ReconcilePlan::compute(&names(&["a"]), &names(&["a"]));
        assert!(same.is_noop());
    }

    #[test]
    fn test_reconcile_creates_and_deletes() {
        let (tree, reconciler) = setup(json!({
            "catalog": {"dev01": {"name": "Hall", "room": "lab"}},
            "views": {"lab": {"dev01": {"available": {
                "old_gone": {"name": "Hall Gone", "widget": ""},
                "s_temp": {"name": "My Thermometer", "widget": "temp"}
            }}}}
        }));

        let report = reconciler
            .reconcile(&"dev01".into(), ViewTarget::Available, &names(&["s_temp", "s_lightLevel"]))
            .unwrap()
            .unwrap();

        assert_eq!(report.created, vec!["s_lightLevel".to_string()]);
        assert_eq!(report.deleted, vec!["old_gone".to_string()]);
        assert_eq!(report.kept, 1);

        assert_eq!(
            tree.read(&path("views/lab/dev01/available/s_lightLevel")).unwrap(),
            Some(json!({"name": "Hall Light Level", "widget": ""}))
        );
        // Kept entries keep their administrator configuration.
        assert_eq!(
            tree.read(&path("views/lab/dev01/available/s_temp")).unwrap(),
            Some(json!({"name": "My Thermometer", "widget": "temp"}))
        );
        assert_eq!(tree.read(&path("views/lab/dev01/available/old_gone")).unwrap(), None);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let (tree, reconciler) = setup(json!({
            "catalog": {"dev01": {"name": "Hall", "room": "lab"}}
        }));
        let source = names(&["s_temp", "s_humid"]);

        let first = reconciler
            .reconcile(&"dev01".into(), ViewTarget::Available, &source)
            .unwrap()
            .unwrap();
        assert_eq!(first.writes(), 2);

        let before = tree.mutation_count();
        let second = reconciler
            .reconcile(&"dev01".into(), ViewTarget::Available, &source)
            .unwrap()
            .unwrap();
        assert_eq!(second.writes(), 0);
        assert_eq!(second.kept, 2);
        assert_eq!(tree.mutation_count(), before);
    }

    #[test]
    fn test_unprovisioned_device_is_deferred() {
        let (tree, reconciler) = setup(json!({
            "catalog": {"dev01": {"activeStreams": {"s_temp": {"channelID": 1}}}}
        }));

        let result = reconciler
            .reconcile(&"dev01".into(), ViewTarget::Available, &names(&["s_temp"]))
            .unwrap();
        assert!(result.is_none());
        assert!(reconciler.resync_device(&"dev01".into()).unwrap().is_none());
        assert_eq!(tree.mutation_count(), 0);
    }

    #[test]
    fn test_new_active_entry_copies_available() {
        let (tree, reconciler) = setup(json!({
            "catalog": {"dev01": {
                "name": "Hall", "room": "lab",
                "activeStreams": {"s_temp": {"channelID": 1}},
                "inactiveStreams": {"s_light": {"channelID": 2}}
            }},
            "views": {"lab": {"dev01": {"available": {
                "s_temp": {"name": "Desk Thermometer", "widget": "temp"}
            }}}}
        }));

        let report = reconciler.resync_device(&"dev01".into()).unwrap().unwrap();
        assert_eq!(report.available.created, vec!["s_light".to_string()]);
        assert_eq!(report.active.created, vec!["s_temp".to_string()]);

        assert_eq!(
            tree.read(&path("views/lab/dev01/active/s_temp")).unwrap(),
            Some(json!({"name": "Desk Thermometer", "widget": "temp"}))
        );
        assert_eq!(tree.read(&path("views/lab/dev01/active/s_light")).unwrap(), None);
    }

    #[test]
    fn test_malformed_available_entry_falls_back_to_default() {
        let (tree, reconciler) = setup(json!({
            "catalog": {"dev01": {
                "name": "Hall", "room": "lab",
                "activeStreams": {"s_temp": {"channelID": 1}, "s_humid": {"channelID": 2}}
            }},
            "views": {"lab": {"dev01": {"available": {
                "s_temp": "not an entry",
                "s_humid": {"name": "Desk Humidity", "widget": "humid"}
            }}}}
        }));

        let report = reconciler.resync_device(&"dev01".into()).unwrap().unwrap();
        assert_eq!(report.active.created.len(), 2);

        assert_eq!(
            tree.read(&path("views/lab/dev01/active/s_temp")).unwrap(),
            Some(json!({"name": "Hall Temp", "widget": ""}))
        );
        assert_eq!(
            tree.read(&path("views/lab/dev01/active/s_humid")).unwrap(),
            Some(json!({"name": "Desk Humidity", "widget": "humid"}))
        );
    }

    #[test]
    fn test_resync_all_reports_deferred() {
        let (_tree, reconciler) = setup(json!({
            "catalog": {
                "dev01": {
                    "name": "Hall", "room": "lab",
                    "activeEvents": {"e_door": {"channelID": 1}}
                },
                "dev02": {"inactiveEvents": {"e_door": {"channelID": 1}}}
            }
        }));

        let summary = reconciler.resync_all().unwrap();
        assert_eq!(summary.synced.len(), 1);
        assert_eq!(summary.deferred, vec![DeviceId::from("dev02")]);
        assert_eq!(summary.writes(), 2);
    }

    #[test]
    fn test_store_failure_is_surfaced() {
        let (tree, reconciler) = setup(json!({
            "catalog": {"dev01": {"name": "Hall", "room": "lab"}}
        }));
        tree.set_online(false);

        let result =
            reconciler.reconcile(&"dev01".into(), ViewTarget::Available, &names(&["s_temp"]));
        assert!(matches!(result, Err(crate::SyncError::StoreUnavailable(_))));
    }
}
