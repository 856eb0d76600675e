// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Door synchronization and cloud-side monitoring.
//!
//! Sync is best-effort per door: a door whose cloud registration fails is
//! still mapped locally so unlocks and webhooks keep working for it.

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::clients::{ClientError, Door};
use crate::mapping::NewMapping;
use crate::resilience::circuit_breaker::CircuitError;
use crate::resilience::retry::retry_with;

use super::routing::guarded;
use super::{BridgeCore, BridgeError, BridgeEvent, BridgeService, FailedDoor, ServiceState, SyncSummary};

impl BridgeCore {
    /// Discover doors, map the new ones and register them with the cloud.
    #[tracing::instrument(skip(self))]
    pub(crate) async fn sync_doors(&self) -> Result<SyncSummary, BridgeError> {
        let controller = &self.controller;
        let doors = retry_with(
            "controller.discover_doors",
            &self.retry,
            || controller.discover_doors(),
            ClientError::is_transient,
            |_, _, _| {},
        )
        .await
        .map_err(|source| {
            self.counters.record_error("controller", "discover_doors", source.to_string());
            BridgeError::Client { dependency: "controller", source }
        })?;

        info!(doors = doors.len(), "Synchronizing doors");
        let mut summary = SyncSummary {
            total: doors.len(),
            ..Default::default()
        };

        for door in &doors {
            if self.mappings.get_by_controller_door(&door.id).is_some() {
                debug!(door = %door.id, "Door already mapped");
                summary.synced += 1;
                continue;
            }

            match self.map_new_door(door).await {
                Ok(()) => summary.synced += 1,
                Err(failed) => {
                    summary.failed += 1;
                    summary.failed_doors.push(failed);
                }
            }
        }

        summary.active_mappings = self.mappings.active_count();
        crate::metrics::record_door_sync(summary.synced, summary.failed);
        info!(
            total = summary.total,
            synced = summary.synced,
            failed = summary.failed,
            active_mappings = summary.active_mappings,
            "Door sync complete"
        );
        let _ = self.events.send(BridgeEvent::DoorsSynced(summary.clone()));
        Ok(summary)
    }

    async fn map_new_door(&self, door: &Door) -> Result<(), FailedDoor> {
        let failed = |reason: String, mapped_locally: bool| FailedDoor {
            door_id: door.id.clone(),
            name: door.name.clone(),
            reason,
            mapped_locally,
        };

        let mut new = NewMapping::new(format!("{}{}", self.lock_id_prefix, door.id), door.id.clone(), door.name.clone())
            .with_metadata(door_metadata(door));
        new.site_id = self.default_site_id.clone();

        let mapping = self.mappings.add_mapping(new).map_err(|e| {
            warn!(door = %door.id, error = %e, "Could not map discovered door");
            self.counters.record_error("mappings", "add", e.to_string());
            failed(e.to_string(), false)
        })?;

        let cloud = &self.cloud;
        let registered = guarded("cloud.register_door", &self.circuits.cloud, &self.retry, || {
            cloud.register_door(&mapping)
        })
        .await;

        match registered {
            Ok(()) => {
                info!(door = %door.id, lock = %mapping.cloud_lock_id, "Door mapped and registered");
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    CircuitError::Rejected => "cloud circuit open".to_string(),
                    CircuitError::Inner(inner) => inner.to_string(),
                };
                warn!(
                    door = %door.id,
                    lock = %mapping.cloud_lock_id,
                    reason = %reason,
                    "Cloud registration failed; door mapped locally only"
                );
                self.counters.record_error("cloud", "register_door", reason.clone());
                Err(failed(reason, true))
            }
        }
    }

    /// Ask the cloud to monitor every enabled mapping. Failures are logged only.
    pub(crate) async fn start_monitoring(&self) {
        let cloud = &self.cloud;
        let mut started = 0usize;
        for mapping in self.mappings.list_enabled() {
            let lock_id = mapping.cloud_lock_id.as_str();
            match guarded("cloud.start_door", &self.circuits.cloud, &self.retry, || cloud.start_door(lock_id)).await {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!(lock = %lock_id, error = %e, "Failed to start cloud monitoring");
                    self.counters.record_error("cloud", "start_door", e.to_string());
                }
            }
        }
        debug!(started, "Cloud monitoring started");
    }

    /// Best-effort: a single attempt per door, never retried.
    pub(crate) async fn stop_monitoring(&self) {
        for mapping in self.mappings.list_enabled() {
            let lock_id = mapping.cloud_lock_id.as_str();
            if let Err(e) = self.cloud.stop_door(lock_id).await {
                debug!(lock = %lock_id, error = %e, "Failed to stop cloud monitoring");
            }
        }
    }
}

fn door_metadata(door: &Door) -> Value {
    let mut metadata = match &door.metadata {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(other) => json!({ "controller": other }),
        None => json!({}),
    };
    if let Some(floor) = &door.floor {
        metadata["floor"] = json!(floor);
    }
    metadata
}

impl BridgeService {
    /// Re-run door synchronization while running, then start monitoring new doors.
    pub async fn sync_doors(&self) -> Result<SyncSummary, BridgeError> {
        let state = self.state();
        if state != ServiceState::Running {
            return Err(BridgeError::InvalidState { operation: "sync doors", state });
        }
        let summary = self.core.sync_doors().await?;
        self.core.start_monitoring().await;
        Ok(summary)
    }
}
