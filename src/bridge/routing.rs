// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Unlock routing (cloud → controller) and event forwarding (controller → cloud).
//!
//! Every collaborator call goes through retry (outer) and the dependency's
//! circuit breaker (inner). Retry only follows transient client errors and
//! never a breaker rejection.

use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::clients::{ClientError, CloudClient, DoorEvent, UnlockCommand};
use crate::events::{EventSink, QueuedEvent, SinkError};
use crate::metrics::LatencyTimer;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::resilience::retry::{retry_with, RetryConfig};

use super::{BridgeCore, BridgeCounters, BridgeEvent, BridgeService, UnlockError, UnlockSource, UnlockedDoor};

fn retryable(err: &CircuitError<ClientError>) -> bool {
    matches!(err, CircuitError::Inner(inner) if inner.is_transient())
}

/// Run `op` through `breaker` with retries. `Ok(false)` from the collaborator
/// becomes a `Rejected` error so the breaker counts it.
pub(crate) async fn guarded<F, Fut>(
    operation: &str,
    breaker: &CircuitBreaker,
    retry: &RetryConfig,
    mut op: F,
) -> Result<(), CircuitError<ClientError>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, ClientError>>,
{
    retry_with(
        operation,
        retry,
        || {
            let attempt = op();
            breaker.call(move || async move {
                match attempt.await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(ClientError::Rejected(format!("{} refused", operation))),
                    Err(e) => Err(e),
                }
            })
        },
        retryable,
        |_, _, _| {},
    )
    .await
}

impl BridgeCore {
    /// Unlock the door mapped to cloud lock `lock_id`.
    pub(crate) async fn unlock(
        &self,
        lock_id: &str,
        source: UnlockSource,
        user: Option<&str>,
    ) -> Result<UnlockedDoor, UnlockError> {
        let mapping = match self.mappings.get_by_cloud_lock(lock_id) {
            Some(mapping) if mapping.enabled => mapping,
            Some(_) => {
                warn!(lock = %lock_id, source = source.as_str(), "Unlock for disabled mapping dropped");
                crate::metrics::record_unlock(source.as_str(), "disabled");
                return Err(UnlockError::Disabled(lock_id.to_string()));
            }
            None => {
                warn!(lock = %lock_id, source = source.as_str(), "Unlock for unmapped lock dropped");
                crate::metrics::record_unlock(source.as_str(), "not_mapped");
                return Err(UnlockError::NotMapped(lock_id.to_string()));
            }
        };

        let door_id = mapping.controller_door_id.as_str();
        let controller = &self.controller;
        let result = {
            let _timer = LatencyTimer::new("controller", "unlock");
            guarded("controller.unlock", &self.circuits.controller, &self.retry, || controller.unlock(door_id)).await
        };

        match result {
            Ok(()) => {
                self.counters.record_unlock();
                crate::metrics::record_unlock(source.as_str(), "success");
                info!(
                    lock = %lock_id,
                    door = %door_id,
                    name = %mapping.name,
                    source = source.as_str(),
                    user = user.unwrap_or("-"),
                    "Door unlocked"
                );
                let unlocked = UnlockedDoor {
                    lock_id: lock_id.to_string(),
                    door_id: mapping.controller_door_id.clone(),
                    door_name: mapping.name.clone(),
                    source,
                    at: Utc::now(),
                };
                let _ = self.events.send(BridgeEvent::DoorUnlocked(unlocked.clone()));
                Ok(unlocked)
            }
            Err(CircuitError::Rejected) => {
                warn!(lock = %lock_id, door = %door_id, "Unlock rejected, controller circuit open");
                crate::metrics::record_unlock(source.as_str(), "rejected");
                self.counters.record_error("controller", "unlock", "controller circuit open");
                Err(UnlockError::CircuitOpen)
            }
            Err(CircuitError::Inner(e)) => {
                error!(lock = %lock_id, door = %door_id, error = %e, "Unlock failed");
                crate::metrics::record_unlock(source.as_str(), "failure");
                self.counters.record_error("controller", "unlock", e.to_string());
                Err(UnlockError::Failed(e))
            }
        }
    }

    /// Unlock command pushed by the cloud client. Never surfaces an error.
    pub(crate) async fn handle_unlock_command(&self, command: UnlockCommand) {
        debug!(lock = %command.lock_id, user = ?command.user_id, "Unlock command received");
        // Outcome already logged and counted
        let _ = self
            .unlock(&command.lock_id, UnlockSource::Command, command.user_id.as_deref())
            .await;
    }

    /// Door event pushed by the controller. Unmapped doors are expected and ignored.
    pub(crate) fn handle_door_event(&self, event: DoorEvent) {
        match self.mappings.get_by_controller_door(&event.door_id) {
            Some(mapping) if mapping.enabled => {
                self.translator.translate_and_queue(&event, &mapping);
            }
            Some(_) => debug!(door = %event.door_id, "Door event for disabled mapping ignored"),
            None => debug!(door = %event.door_id, kind = %event.event_type, "Door event for unmapped door ignored"),
        }
    }
}

impl BridgeService {
    /// Operator-initiated unlock by cloud lock id, via the same guarded path.
    pub async fn unlock_door(&self, lock_id: &str) -> Result<UnlockedDoor, UnlockError> {
        self.core.unlock(lock_id, UnlockSource::Manual, None).await
    }

    /// Feed an unlock command as if the cloud client had pushed it.
    pub async fn handle_unlock_command(&self, command: UnlockCommand) {
        self.core.handle_unlock_command(command).await;
    }

    /// Feed a door event as if the controller had pushed it.
    pub fn handle_door_event(&self, event: DoorEvent) {
        self.core.handle_door_event(event);
    }
}

pub(crate) async fn unlock_command_loop(
    core: Arc<BridgeCore>,
    mut commands: broadcast::Receiver<UnlockCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = commands.recv() => match received {
                Ok(command) => core.handle_unlock_command(command).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Unlock command listener lagged; commands lost");
                    core.counters.record_error("cloud", "unlock_commands", format!("{} unlock commands lost", missed));
                }
                Err(RecvError::Closed) => {
                    warn!("Unlock command stream closed");
                    break;
                }
            },
        }
    }
    debug!("Unlock command listener stopped");
}

pub(crate) async fn door_event_loop(
    core: Arc<BridgeCore>,
    mut events: broadcast::Receiver<DoorEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = events.recv() => match received {
                Ok(event) => core.handle_door_event(event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Door event listener lagged; events lost");
                    crate::metrics::record_event("lagged", missed as usize);
                }
                Err(RecvError::Closed) => {
                    warn!("Door event stream closed");
                    break;
                }
            },
        }
    }
    debug!("Door event listener stopped");
}

/// Translator sink that sends ready events to the cloud through its breaker.
///
/// No retry here: a failed send goes back to the translator queue.
pub(crate) struct CloudEventForwarder {
    cloud: Arc<dyn CloudClient>,
    breaker: CircuitBreaker,
    counters: Arc<BridgeCounters>,
    events: broadcast::Sender<BridgeEvent>,
}

impl CloudEventForwarder {
    pub(crate) fn new(
        cloud: Arc<dyn CloudClient>,
        breaker: CircuitBreaker,
        counters: Arc<BridgeCounters>,
        events: broadcast::Sender<BridgeEvent>,
    ) -> Self {
        Self { cloud, breaker, counters, events }
    }
}

#[async_trait]
impl EventSink for CloudEventForwarder {
    async fn deliver(&self, item: &QueuedEvent) -> Result<(), SinkError> {
        let _timer = LatencyTimer::new("cloud", "send_event");
        let cloud = &self.cloud;
        let event = &item.event;

        let result = self
            .breaker
            .call(|| async move {
                match cloud.send_door_event(&event.lock_id, event).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(ClientError::Rejected("cloud refused event".into())),
                    Err(e) => Err(e),
                }
            })
            .await;

        match result {
            Ok(()) => {
                self.counters.record_forwarded();
                let _ = self.events.send(BridgeEvent::EventForwarded {
                    lock_id: event.lock_id.clone(),
                    event_type: event.event_type,
                });
                Ok(())
            }
            Err(CircuitError::Rejected) => Err(SinkError::CircuitOpen),
            Err(CircuitError::Inner(e)) => {
                self.counters.record_error("cloud", "send_event", e.to_string());
                match e {
                    ClientError::Rejected(_) => Err(SinkError::Refused),
                    other => Err(SinkError::Client(other)),
                }
            }
        }
    }
}
