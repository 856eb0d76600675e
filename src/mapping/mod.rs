// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Door mapping store.
//!
//! The [`MappingService`] owns every [`DoorMapping`]. It keeps an in-memory
//! index keyed by cloud lock id and persists to a JSON file with debounced
//! writes: every mutation marks the store dirty and restarts a timer, and only
//! the last write of a burst reaches disk. Bulk destructive operations and
//! shutdown save immediately.
//!
//! All check-then-mutate sequences run under one write guard, so the
//! uniqueness of `cloud_lock_id` and `controller_door_id` holds under
//! concurrent callers.
//!
//! # Example
//!
//! ```rust,no_run
//! use door_bridge::mapping::{MappingService, MappingStoreConfig, NewMapping};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let service = MappingService::new(MappingStoreConfig::new("./door_mappings.json"));
//! service.load().await.expect("load failed");
//!
//! let mapping = service.add_mapping(NewMapping::new("lock-1", "door-1", "Front door")).unwrap();
//! assert!(service.get_by_controller_door("door-1").is_some());
//!
//! service.flush().await.expect("flush failed");
//! # let _ = mapping;
//! # }
//! ```

mod persistence;
mod types;

pub use persistence::MappingFile;
pub use types::{DoorMapping, MappingError, MappingEvent, MappingUpdate, NewMapping};

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// Configuration for the mapping store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingStoreConfig {
    pub path: PathBuf,
    /// Quiet period before a dirty store is written (default 5s)
    pub save_debounce: Duration,
}

impl MappingStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            save_debounce: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct MappingIndex {
    by_lock: HashMap<String, DoorMapping>,
    lock_by_id: HashMap<String, String>,
}

impl MappingIndex {
    fn insert(&mut self, mapping: DoorMapping) {
        self.lock_by_id.insert(mapping.id.clone(), mapping.cloud_lock_id.clone());
        self.by_lock.insert(mapping.cloud_lock_id.clone(), mapping);
    }

    fn get_by_id(&self, id: &str) -> Option<&DoorMapping> {
        self.lock_by_id.get(id).and_then(|lock| self.by_lock.get(lock))
    }

    fn controller_door_taken(&self, door_id: &str, except_id: Option<&str>) -> bool {
        self.by_lock
            .values()
            .any(|m| m.controller_door_id == door_id && Some(m.id.as_str()) != except_id)
    }

    /// Reject `mapping` if either identifier clashes with a different record.
    fn check_unique(&self, mapping: &DoorMapping, except_id: Option<&str>) -> Result<(), MappingError> {
        if except_id.is_none() && self.lock_by_id.contains_key(&mapping.id) {
            return Err(MappingError::Validation(format!("mapping id '{}' already exists", mapping.id)));
        }
        if let Some(existing) = self.by_lock.get(&mapping.cloud_lock_id) {
            if Some(existing.id.as_str()) != except_id {
                return Err(MappingError::DuplicateCloudLock(mapping.cloud_lock_id.clone()));
            }
        }
        if self.controller_door_taken(&mapping.controller_door_id, except_id) {
            return Err(MappingError::DuplicateControllerDoor(mapping.controller_door_id.clone()));
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<DoorMapping> {
        let mut all: Vec<DoorMapping> = self.by_lock.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }
}

struct Inner {
    config: MappingStoreConfig,
    file: MappingFile,
    index: RwLock<MappingIndex>,
    dirty: AtomicBool,
    /// Bumped on each scheduled or immediate save; a debounce timer only writes for its own generation.
    save_generation: AtomicU64,
    /// Serializes disk writes.
    save_lock: Mutex<()>,
    events: broadcast::Sender<MappingEvent>,
}

impl Inner {
    async fn save_now(&self) -> Result<(), MappingError> {
        let _guard = self.save_lock.lock().await;
        let snapshot = {
            let index = self.index.read();
            self.dirty.store(false, Ordering::Release);
            index.snapshot()
        };

        let start = Instant::now();
        match self.file.save(&snapshot).await {
            Ok(()) => {
                crate::metrics::record_mapping_save(start.elapsed(), true);
                debug!(count = snapshot.len(), "Mappings persisted");
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                crate::metrics::record_mapping_save(start.elapsed(), false);
                error!(error = %e, path = %self.file.path().display(), "Failed to persist mappings");
                Err(e)
            }
        }
    }
}

/// CRUD store for door mappings with file-backed persistence.
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct MappingService {
    inner: Arc<Inner>,
}

impl MappingService {
    pub fn new(config: MappingStoreConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                file: MappingFile::new(config.path.clone()),
                config,
                index: RwLock::new(MappingIndex::default()),
                dirty: AtomicBool::new(false),
                save_generation: AtomicU64::new(0),
                save_lock: Mutex::new(()),
                events,
            }),
        }
    }

    /// Replace the in-memory set with what is on disk.
    ///
    /// Records that fail validation or clash with an earlier record are
    /// skipped with a warning. Returns the number of mappings loaded.
    #[tracing::instrument(skip(self), fields(path = %self.inner.config.path.display()))]
    pub async fn load(&self) -> Result<usize, MappingError> {
        let stored = self.inner.file.load().await?;
        let total = stored.len();

        let mut index = MappingIndex::default();
        for mapping in stored {
            let valid = mapping
                .validate()
                .and_then(|_| index.check_unique(&mapping, None));
            match valid {
                Ok(()) => index.insert(mapping),
                Err(e) => warn!(id = %mapping.id, error = %e, "Skipping stored mapping"),
            }
        }

        let loaded = index.by_lock.len();
        *self.inner.index.write() = index;
        self.inner.dirty.store(false, Ordering::Release);
        self.publish_gauge();

        info!(loaded, skipped = total - loaded, "Mappings loaded");
        Ok(loaded)
    }

    pub fn add_mapping(&self, new: NewMapping) -> Result<DoorMapping, MappingError> {
        let mapping = new.into_mapping(Utc::now());
        mapping.validate()?;

        {
            let mut index = self.inner.index.write();
            index.check_unique(&mapping, None)?;
            index.insert(mapping.clone());
        }

        info!(id = %mapping.id, lock = %mapping.cloud_lock_id, door = %mapping.controller_door_id, "Mapping added");
        self.schedule_save();
        self.publish_gauge();
        let _ = self.inner.events.send(MappingEvent::Added(mapping.clone()));
        Ok(mapping)
    }

    pub fn update_mapping(&self, id: &str, update: MappingUpdate) -> Result<DoorMapping, MappingError> {
        let (previous, current) = {
            let mut index = self.inner.index.write();
            let previous = index
                .get_by_id(id)
                .cloned()
                .ok_or_else(|| MappingError::NotFound(id.to_string()))?;

            let current = update.apply(previous.clone(), Utc::now());
            current.validate()?;
            index.check_unique(&current, Some(id))?;
            index.insert(current.clone());
            (previous, current)
        };

        info!(id = %current.id, lock = %current.cloud_lock_id, "Mapping updated");
        self.schedule_save();
        self.publish_gauge();
        let _ = self.inner.events.send(MappingEvent::Updated {
            previous,
            current: current.clone(),
        });
        Ok(current)
    }

    pub fn remove_mapping(&self, id: &str) -> Result<DoorMapping, MappingError> {
        let removed = {
            let mut index = self.inner.index.write();
            let lock = index
                .lock_by_id
                .remove(id)
                .ok_or_else(|| MappingError::NotFound(id.to_string()))?;
            index
                .by_lock
                .remove(&lock)
                .ok_or_else(|| MappingError::NotFound(id.to_string()))?
        };

        info!(id = %removed.id, lock = %removed.cloud_lock_id, "Mapping removed");
        self.schedule_save();
        self.publish_gauge();
        let _ = self.inner.events.send(MappingEvent::Removed(removed.clone()));
        Ok(removed)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<DoorMapping, MappingError> {
        self.update_mapping(id, MappingUpdate { enabled: Some(enabled), ..Default::default() })
    }

    /// Replace the whole store with `mappings` and save immediately.
    ///
    /// The batch is validated as a unit; on any error nothing changes.
    pub async fn import_mappings(&self, mappings: Vec<DoorMapping>) -> Result<usize, MappingError> {
        let mut index = MappingIndex::default();
        for mapping in mappings {
            mapping.validate()?;
            index.check_unique(&mapping, None)?;
            index.insert(mapping);
        }
        let count = index.by_lock.len();

        *self.inner.index.write() = index;
        self.inner.dirty.store(true, Ordering::Release);
        self.publish_gauge();
        info!(count, "Mappings imported");
        let _ = self.inner.events.send(MappingEvent::Imported { count });

        self.save_immediate().await?;
        Ok(count)
    }

    /// Remove every mapping and save immediately.
    pub async fn clear(&self) -> Result<usize, MappingError> {
        let count = {
            let mut index = self.inner.index.write();
            let count = index.by_lock.len();
            *index = MappingIndex::default();
            count
        };
        self.inner.dirty.store(true, Ordering::Release);
        self.publish_gauge();
        warn!(count, "All mappings cleared");
        let _ = self.inner.events.send(MappingEvent::Cleared { count });

        self.save_immediate().await?;
        Ok(count)
    }

    #[must_use]
    pub fn get_by_cloud_lock(&self, lock_id: &str) -> Option<DoorMapping> {
        self.inner.index.read().by_lock.get(lock_id).cloned()
    }

    #[must_use]
    pub fn get_by_id(&self, id: &str) -> Option<DoorMapping> {
        self.inner.index.read().get_by_id(id).cloned()
    }

    /// Linear scan; door counts are small.
    #[must_use]
    pub fn get_by_controller_door(&self, door_id: &str) -> Option<DoorMapping> {
        self.inner
            .index
            .read()
            .by_lock
            .values()
            .find(|m| m.controller_door_id == door_id)
            .cloned()
    }

    /// All mappings, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<DoorMapping> {
        self.inner.index.read().snapshot()
    }

    #[must_use]
    pub fn list_enabled(&self) -> Vec<DoorMapping> {
        self.list().into_iter().filter(|m| m.enabled).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.index.read().by_lock.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.index.read().by_lock.values().filter(|m| m.enabled).count()
    }

    /// True when in-memory state has changes not yet on disk.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MappingEvent> {
        self.inner.events.subscribe()
    }

    /// Write now, cancelling any pending debounced save.
    pub async fn save_immediate(&self) -> Result<(), MappingError> {
        self.inner.save_generation.fetch_add(1, Ordering::AcqRel);
        self.inner.save_now().await
    }

    /// Save if there are unsaved changes.
    pub async fn flush(&self) -> Result<(), MappingError> {
        if self.is_dirty() {
            self.save_immediate().await?;
        }
        Ok(())
    }

    fn schedule_save(&self) {
        self.inner.dirty.store(true, Ordering::Release);
        let generation = self.inner.save_generation.fetch_add(1, Ordering::AcqRel) + 1;

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime for debounced save; store stays dirty until flush");
            return;
        };

        let inner = Arc::clone(&self.inner);
        let delay = inner.config.save_debounce;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if inner.save_generation.load(Ordering::Acquire) != generation {
                return;
            }
            // Failure is logged inside and leaves the store dirty for the next flush.
            let _ = inner.save_now().await;
        });
    }

    fn publish_gauge(&self) {
        crate::metrics::set_active_mappings(self.active_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn service(debounce_ms: u64) -> (MappingService, TempDir) {
        let dir = tempdir().unwrap();
        let config = MappingStoreConfig {
            path: dir.path().join("mappings.json"),
            save_debounce: Duration::from_millis(debounce_ms),
        };
        (MappingService::new(config), dir)
    }

    fn on_disk(dir: &TempDir) -> Option<Vec<DoorMapping>> {
        let bytes = std::fs::read(dir.path().join("mappings.json")).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    #[tokio::test]
    async fn test_add_and_lookup_by_every_key() {
        let (svc, _dir) = service(5_000);

        let m = svc.add_mapping(NewMapping::new("L1", "d1", "Front")).unwrap();

        assert_eq!(svc.get_by_cloud_lock("L1").unwrap().id, m.id);
        assert_eq!(svc.get_by_controller_door("d1").unwrap().id, m.id);
        assert_eq!(svc.get_by_id(&m.id).unwrap().cloud_lock_id, "L1");
        assert_eq!(m.created_at, m.updated_at);
        assert_eq!(svc.active_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicates_on_either_side_are_rejected_without_mutation() {
        let (svc, _dir) = service(5_000);
        svc.add_mapping(NewMapping::new("L1", "d1", "Front")).unwrap();

        let dup_lock = svc.add_mapping(NewMapping::new("L1", "d2", "Other"));
        assert!(matches!(dup_lock, Err(MappingError::DuplicateCloudLock(ref l)) if l == "L1"));

        let dup_door = svc.add_mapping(NewMapping::new("L2", "d1", "Other"));
        assert!(matches!(dup_door, Err(MappingError::DuplicateControllerDoor(ref d)) if d == "d1"));

        assert_eq!(svc.len(), 1);
        assert!(svc.get_by_cloud_lock("L2").is_none());
    }

    #[tokio::test]
    async fn test_add_rejects_missing_fields() {
        let (svc, _dir) = service(5_000);

        let err = svc.add_mapping(NewMapping::new("", "d1", "Front")).unwrap_err();
        assert!(matches!(err, MappingError::Validation(_)));
        assert!(svc.is_empty());
    }

    #[tokio::test]
    async fn test_update_preserves_immutable_fields() {
        let (svc, _dir) = service(5_000);
        let m = svc.add_mapping(NewMapping::new("L1", "d1", "Front")).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let updated = svc
            .update_mapping(&m.id, MappingUpdate {
                controller_door_id: Some("d9".into()),
                name: Some("Renamed".into()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(updated.id, m.id);
        assert_eq!(updated.cloud_lock_id, "L1");
        assert_eq!(updated.created_at, m.created_at);
        assert!(updated.updated_at > m.updated_at);
        assert!(svc.get_by_controller_door("d1").is_none());
        assert_eq!(svc.get_by_controller_door("d9").unwrap().name, "Renamed");
    }

    #[tokio::test]
    async fn test_update_cannot_steal_another_door() {
        let (svc, _dir) = service(5_000);
        let a = svc.add_mapping(NewMapping::new("L1", "d1", "A")).unwrap();
        svc.add_mapping(NewMapping::new("L2", "d2", "B")).unwrap();

        let err = svc
            .update_mapping(&a.id, MappingUpdate { controller_door_id: Some("d2".into()), ..Default::default() })
            .unwrap_err();

        assert!(matches!(err, MappingError::DuplicateControllerDoor(_)));
        assert_eq!(svc.get_by_id(&a.id).unwrap().controller_door_id, "d1");
    }

    #[tokio::test]
    async fn test_update_and_remove_unknown_id() {
        let (svc, _dir) = service(5_000);

        assert!(matches!(svc.update_mapping("nope", MappingUpdate::default()), Err(MappingError::NotFound(_))));
        assert!(matches!(svc.remove_mapping("nope"), Err(MappingError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_emits_event() {
        let (svc, _dir) = service(5_000);
        let mut rx = svc.subscribe();
        let m = svc.add_mapping(NewMapping::new("L1", "d1", "Front")).unwrap();

        svc.remove_mapping(&m.id).unwrap();

        assert!(matches!(rx.recv().await.unwrap(), MappingEvent::Added(_)));
        match rx.recv().await.unwrap() {
            MappingEvent::Removed(removed) => assert_eq!(removed.id, m.id),
            other => panic!("unexpected {:?}", other),
        }
        assert!(svc.is_empty());
    }

    #[tokio::test]
    async fn test_debounced_save_coalesces_burst() {
        let (svc, dir) = service(80);

        svc.add_mapping(NewMapping::new("L1", "d1", "A")).unwrap();
        svc.add_mapping(NewMapping::new("L2", "d2", "B")).unwrap();
        svc.add_mapping(NewMapping::new("L3", "d3", "C")).unwrap();

        // Nothing lands before the quiet period ends
        assert!(on_disk(&dir).is_none());
        assert!(svc.is_dirty());

        tokio::time::sleep(Duration::from_millis(300)).await;

        let stored = on_disk(&dir).expect("store written");
        assert_eq!(stored.len(), 3);
        assert!(!svc.is_dirty());
    }

    #[tokio::test]
    async fn test_flush_writes_immediately_and_reload_round_trips() {
        let (svc, dir) = service(60_000);
        svc.add_mapping(NewMapping::new("L1", "d1", "A").with_site("hq")).unwrap();

        svc.flush().await.unwrap();
        assert_eq!(on_disk(&dir).unwrap().len(), 1);

        let reloaded = MappingService::new(MappingStoreConfig {
            path: dir.path().join("mappings.json"),
            save_debounce: Duration::from_secs(60),
        });
        assert_eq!(reloaded.load().await.unwrap(), 1);
        assert_eq!(reloaded.get_by_cloud_lock("L1").unwrap().site_id.as_deref(), Some("hq"));
    }

    #[tokio::test]
    async fn test_load_skips_conflicting_records() {
        let (svc, dir) = service(60_000);
        let now = Utc::now();
        let a = NewMapping::new("L1", "d1", "A").into_mapping(now);
        let b = NewMapping::new("L2", "d1", "B").into_mapping(now);
        std::fs::write(dir.path().join("mappings.json"), serde_json::to_vec(&vec![a, b]).unwrap()).unwrap();

        assert_eq!(svc.load().await.unwrap(), 1);
        assert!(svc.get_by_cloud_lock("L1").is_some());
        assert!(svc.get_by_cloud_lock("L2").is_none());
    }

    #[tokio::test]
    async fn test_clear_saves_immediately() {
        let (svc, dir) = service(60_000);
        svc.add_mapping(NewMapping::new("L1", "d1", "A")).unwrap();
        svc.flush().await.unwrap();

        assert_eq!(svc.clear().await.unwrap(), 1);
        assert_eq!(on_disk(&dir).unwrap().len(), 0);
        assert!(svc.is_empty());
    }

    #[tokio::test]
    async fn test_import_is_all_or_nothing() {
        let (svc, _dir) = service(60_000);
        svc.add_mapping(NewMapping::new("L0", "d0", "Existing")).unwrap();
        let now = Utc::now();

        let bad = vec![
            NewMapping::new("L1", "d1", "A").into_mapping(now),
            NewMapping::new("L1", "d2", "B").into_mapping(now),
        ];
        assert!(svc.import_mappings(bad).await.is_err());
        assert!(svc.get_by_cloud_lock("L0").is_some());

        let good = vec![
            NewMapping::new("L1", "d1", "A").into_mapping(now),
            NewMapping::new("L2", "d2", "B").into_mapping(now),
        ];
        assert_eq!(svc.import_mappings(good).await.unwrap(), 2);
        assert!(svc.get_by_cloud_lock("L0").is_none());
        assert_eq!(svc.len(), 2);
    }

    #[tokio::test]
    async fn test_set_enabled_changes_active_count() {
        let (svc, _dir) = service(60_000);
        let m = svc.add_mapping(NewMapping::new("L1", "d1", "A")).unwrap();
        svc.add_mapping(NewMapping::new("L2", "d2", "B")).unwrap();

        svc.set_enabled(&m.id, false).unwrap();

        assert_eq!(svc.active_count(), 1);
        assert_eq!(svc.list_enabled().len(), 1);
        assert_eq!(svc.list().len(), 2);
    }
}
