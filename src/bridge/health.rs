// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Health probes for the bridge's dependencies and the reaction to their status.
//!
//! Probes capture cloned handles, never the core itself, so the monitor does
//! not keep the bridge alive.

use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::health::{HealthEvent, HealthStatus, ProbeError, ProbeReport};

use super::{BridgeCore, BridgeEvent};

/// Queue utilisation above which the translator reports Degraded.
const QUEUE_DEGRADED_RATIO: f64 = 0.8;

pub(super) fn register_probes(core: &Arc<BridgeCore>) {
    let health = &core.health;

    let controller = Arc::clone(&core.controller);
    let breaker = core.circuits.controller.clone();
    health.register_component("controller", move || {
        let controller = Arc::clone(&controller);
        let circuit = breaker.state().to_string();
        async move {
            controller
                .ping()
                .await
                .map(|_| ProbeReport::healthy().with_details(json!({ "circuit": circuit })))
                .map_err(|e| ProbeError::Failed(e.to_string()))
        }
    });

    let cloud = Arc::clone(&core.cloud);
    let breaker = core.circuits.cloud.clone();
    health.register_component("cloud", move || {
        let cloud = Arc::clone(&cloud);
        let circuit = breaker.state().to_string();
        async move {
            cloud
                .ping()
                .await
                .map(|_| ProbeReport::healthy().with_details(json!({ "circuit": circuit })))
                .map_err(|e| ProbeError::Failed(e.to_string()))
        }
    });

    let translator = core.translator.clone();
    health.register_component("event_translator", move || {
        let utilization = translator.utilization();
        let queue_length = translator.queue_len();
        async move {
            let details = json!({ "queueLength": queue_length, "utilization": utilization });
            let report = if utilization > QUEUE_DEGRADED_RATIO {
                ProbeReport::degraded(format!("event queue {:.0}% full", utilization * 100.0))
            } else {
                ProbeReport::healthy()
            };
            Ok::<_, ProbeError>(report.with_details(details))
        }
    });

    let mappings = core.mappings.clone();
    health.register_component("mappings", move || {
        let total = mappings.len();
        let active = mappings.active_count();
        let dirty = mappings.is_dirty();
        async move {
            let details = json!({ "total": total, "active": active, "dirty": dirty });
            let report = if active == 0 {
                ProbeReport::degraded("no active mappings")
            } else {
                ProbeReport::healthy()
            };
            Ok::<_, ProbeError>(report.with_details(details))
        }
    });
}

/// Log what a dependency's health change means for the bridge and republish
/// it as a [`BridgeEvent::DependencyHealth`].
///
/// The service stays Running either way: unlocks fail per call and events
/// keep queueing.
pub(super) async fn degradation_watch(
    mut events: broadcast::Receiver<HealthEvent>,
    notify: broadcast::Sender<BridgeEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = events.recv() => match received {
                Ok(HealthEvent::StatusChanged { component, previous, current, .. }) => {
                    match (component.as_str(), current) {
                        ("controller", HealthStatus::Unhealthy) => {
                            warn!("Controller unhealthy; unlocks may fail until it recovers");
                        }
                        ("cloud", HealthStatus::Unhealthy) => {
                            warn!("Cloud unhealthy; event forwarding may be delayed, events stay queued");
                        }
                        (_, HealthStatus::Healthy) if previous == HealthStatus::Unhealthy => {
                            info!(component = %component, "Dependency recovered");
                        }
                        _ => debug!(component = %component, status = %current, "Health status changed"),
                    }
                    let _ = notify.send(BridgeEvent::DependencyHealth { component, previous, current });
                }
                Err(RecvError::Lagged(missed)) => debug!(missed, "Health watcher lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}
