// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bridge lifecycle: construction, start sequence, shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::clients::{ClientError, CloudClient, ControllerClient};
use crate::config::BridgeConfig;
use crate::events::EventTranslator;
use crate::health::{HealthEvent, HealthMonitor};
use crate::mapping::MappingService;
use crate::resilience::circuit_breaker::DependencyCircuits;
use crate::resilience::retry::{retry_with, RetryConfig};
use crate::webhook::WebhookVerifier;

use super::routing::CloudEventForwarder;
use super::{BridgeCore, BridgeCounters, BridgeError, BridgeEvent, BridgeService, Listeners, ServiceState};

impl BridgeService {
    /// Wire the bridge together. Performs no I/O.
    ///
    /// Fails only on an invalid configuration.
    pub fn new(
        config: BridgeConfig,
        controller: Arc<dyn ControllerClient>,
        cloud: Arc<dyn CloudClient>,
    ) -> Result<Self, BridgeError> {
        config.validate().map_err(BridgeError::Config)?;

        let circuits = DependencyCircuits::new(config.circuit_config());
        let counters = Arc::new(BridgeCounters::default());
        let (events, _) = broadcast::channel(256);
        let (state, _) = watch::channel(ServiceState::Stopped);

        let forwarder = CloudEventForwarder::new(
            Arc::clone(&cloud),
            circuits.cloud.clone(),
            Arc::clone(&counters),
            events.clone(),
        );
        let translator = EventTranslator::new(config.translator_config(), Arc::new(forwarder));

        let core = Arc::new(BridgeCore {
            mappings: MappingService::new(config.mapping_store_config()),
            controller,
            cloud,
            circuits,
            retry: config.retry_config(),
            translator,
            health: HealthMonitor::new(config.health_config()),
            counters,
            events,
            state,
            lock_id_prefix: config.lock_id_prefix.clone(),
            default_site_id: config.default_site_id.clone(),
        });
        super::health::register_probes(&core);

        Ok(Self {
            verifier: Arc::new(WebhookVerifier::new(config.webhook_config())),
            startup_retry: config.startup_retry_config(),
            config,
            core,
            initialized: std::sync::atomic::AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            listeners: parking_lot::Mutex::new(None),
        })
    }

    /// Load persisted mappings. Called by [`start`](Self::start) if not done yet.
    #[tracing::instrument(skip(self))]
    pub async fn initialize(&self) -> Result<usize, BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.initialize_locked().await
    }

    async fn initialize_locked(&self) -> Result<usize, BridgeError> {
        let loaded = self.core.mappings.load().await.map_err(|e| {
            error!(error = %e, "Failed to load mappings");
            self.core.counters.record_error("mappings", "load", e.to_string());
            e
        })?;
        self.initialized.store(true, Ordering::Release);
        info!(mappings = loaded, "Bridge initialized");
        Ok(loaded)
    }

    /// Authenticate, sync doors, start background work, then go Running.
    ///
    /// Any failure moves the service to `Error` and is returned.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;

        let state = self.state();
        if !matches!(state, ServiceState::Stopped | ServiceState::Error) {
            return Err(BridgeError::InvalidState { operation: "start", state });
        }

        let startup_start = Instant::now();
        info!("Starting door bridge...");
        self.set_state(ServiceState::Starting);

        match self.start_sequence().await {
            Ok(()) => {
                *self.core.counters.started_at.lock() = Some(chrono::Utc::now());
                self.set_state(ServiceState::Running);
                crate::metrics::record_lifecycle_phase("startup_total", startup_start.elapsed());
                info!(
                    startup_ms = startup_start.elapsed().as_millis() as u64,
                    active_mappings = self.core.mappings.active_count(),
                    "Door bridge running"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Door bridge failed to start");
                self.core.counters.record_error("bridge", "start", e.to_string());
                self.set_state(ServiceState::Error);
                Err(e)
            }
        }
    }

    async fn start_sequence(&self) -> Result<(), BridgeError> {
        if !self.initialized.load(Ordering::Acquire) {
            self.initialize_locked().await?;
        }

        // ========== PHASE 1: Authenticate collaborators ==========
        let phase_start = Instant::now();
        let controller = &self.core.controller;
        authenticate("controller", &self.startup_retry, || controller.authenticate()).await?;
        let cloud = &self.core.cloud;
        authenticate("cloud", &self.startup_retry, || cloud.authenticate()).await?;
        crate::metrics::record_lifecycle_phase("authenticate", phase_start.elapsed());
        info!("Controller and cloud authenticated");

        // ========== PHASE 2: Door synchronization ==========
        let phase_start = Instant::now();
        let summary = self.core.sync_doors().await?;
        crate::metrics::record_lifecycle_phase("sync_doors", phase_start.elapsed());
        debug!(synced = summary.synced, failed = summary.failed, "Initial door sync complete");

        // ========== PHASE 3: Cloud-side monitoring ==========
        let phase_start = Instant::now();
        self.core.start_monitoring().await;
        crate::metrics::record_lifecycle_phase("start_monitoring", phase_start.elapsed());

        // ========== PHASE 4: Background components ==========
        // Subscribed before start so the first probe round is observed
        let health_events = self.core.health.subscribe();
        self.core.translator.start();
        self.core.health.start();

        // ========== PHASE 5: Listeners ==========
        self.spawn_listeners(health_events);
        Ok(())
    }

    fn spawn_listeners(&self, health_events: broadcast::Receiver<HealthEvent>) {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        match self.core.cloud.subscribe_unlock_commands() {
            Some(rx) => handles.push(tokio::spawn(super::routing::unlock_command_loop(
                Arc::clone(&self.core),
                rx,
                shutdown_rx.clone(),
            ))),
            None => info!("Cloud client does not push unlock commands; webhook only"),
        }

        match self.core.controller.subscribe_events() {
            Some(rx) => handles.push(tokio::spawn(super::routing::door_event_loop(
                Arc::clone(&self.core),
                rx,
                shutdown_rx.clone(),
            ))),
            None => info!("Controller does not push door events; nothing to forward"),
        }

        handles.push(tokio::spawn(super::health::degradation_watch(
            health_events,
            self.core.events.clone(),
            shutdown_rx,
        )));

        debug!(listeners = handles.len(), "Listeners spawned");
        *self.listeners.lock() = Some(Listeners { shutdown, handles });
    }

    async fn stop_listeners(&self) {
        let listeners = self.listeners.lock().take();
        if let Some(listeners) = listeners {
            let _ = listeners.shutdown.send(true);
            for handle in listeners.handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Listener task ended abnormally");
                }
            }
        }
    }

    /// Tear down in reverse start order and flush mappings.
    ///
    /// Idempotent when already stopped.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state() == ServiceState::Stopped {
            debug!("Stop requested while already stopped");
            return Ok(());
        }

        info!("Stopping door bridge...");
        self.set_state(ServiceState::Stopping);

        self.core.health.stop().await;
        self.core.translator.stop().await;
        self.stop_listeners().await;
        self.core.stop_monitoring().await;

        self.core.controller.disconnect().await;
        self.core.cloud.disconnect().await;

        let flushed = self.core.mappings.flush().await;
        if let Err(e) = &flushed {
            error!(error = %e, "Failed to flush mappings on stop");
            self.core.counters.record_error("mappings", "flush", e.to_string());
        }

        *self.core.counters.started_at.lock() = None;
        self.set_state(ServiceState::Stopped);
        info!(pending_events = self.core.translator.queue_len(), "Door bridge stopped");
        flushed.map_err(BridgeError::from)
    }

    fn set_state(&self, next: ServiceState) {
        let previous = self.core.state.send_replace(next);
        if previous != next {
            info!(previous = %previous, current = %next, "Bridge state changed");
            crate::metrics::set_service_state(&next.to_string());
            let _ = self.core.events.send(BridgeEvent::StateChanged { previous, current: next });
        }
    }
}

async fn authenticate<F, Fut>(dependency: &'static str, config: &RetryConfig, op: F) -> Result<(), BridgeError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), ClientError>>,
{
    let operation = format!("{}.authenticate", dependency);
    retry_with(&operation, config, op, ClientError::is_transient, |_, _, _| {})
        .await
        .map_err(|source| {
            error!(dependency, error = %source, "Authentication failed");
            BridgeError::Client { dependency, source }
        })
}
