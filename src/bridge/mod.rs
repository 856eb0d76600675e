// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bridge service orchestrator.
//!
//! The [`BridgeService`] ties the components together:
//! - Mapping service (door ↔ lock associations, persisted)
//! - Circuit breakers + retry around both collaborators
//! - Event translator forwarding door events to the cloud
//! - Health monitor probing both collaborators
//! - Webhook router for signed unlock requests
//!
//! # Lifecycle
//!
//! ```text
//! Stopped → Starting → Running → Stopping → Stopped
//!              │
//!              └──► Error (start failed; start() may be retried)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use door_bridge::{BridgeConfig, BridgeService, ServiceState};
//! use door_bridge::clients::{MemoryCloud, MemoryController};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = BridgeConfig {
//!     webhook_secret: Some("whsec_123".into()),
//!     ..Default::default()
//! };
//! let controller = Arc::new(MemoryController::with_door_ids(&["d1", "d2"]));
//! let cloud = Arc::new(MemoryCloud::new());
//!
//! let bridge = BridgeService::new(config, controller, cloud).expect("invalid config");
//! bridge.start().await.expect("start failed");
//! assert_eq!(bridge.state(), ServiceState::Running);
//!
//! bridge.stop().await.expect("stop failed");
//! # }
//! ```

mod health;
mod lifecycle;
mod routing;
mod sync;
mod types;

pub use types::{
    BridgeError, BridgeEvent, BridgeStats, FailedDoor, HealthReport, ServiceState, SyncSummary,
    UnlockError, UnlockSource, UnlockedDoor,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::clients::{CloudClient, ControllerClient};
use crate::config::BridgeConfig;
use crate::events::EventTranslator;
use crate::health::HealthMonitor;
use crate::mapping::MappingService;
use crate::resilience::circuit_breaker::DependencyCircuits;
use crate::resilience::retry::RetryConfig;
use crate::webhook::{self, WebhookVerifier};

/// Counters behind [`BridgeStats`].
#[derive(Default)]
pub(crate) struct BridgeCounters {
    started_at: Mutex<Option<DateTime<Utc>>>,
    unlocks_processed: AtomicU64,
    events_forwarded: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl BridgeCounters {
    pub(crate) fn record_error(&self, dependency: &str, operation: &str, message: impl Into<String>) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(message.into());
        crate::metrics::record_error(dependency, operation);
    }

    pub(crate) fn record_unlock(&self) {
        self.unlocks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_forwarded(&self) {
        self.events_forwarded.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared state reachable from listener tasks, probes and the webhook router.
pub(crate) struct BridgeCore {
    pub(crate) mappings: MappingService,
    pub(crate) controller: Arc<dyn ControllerClient>,
    pub(crate) cloud: Arc<dyn CloudClient>,
    pub(crate) circuits: DependencyCircuits,
    pub(crate) retry: RetryConfig,
    pub(crate) translator: EventTranslator,
    pub(crate) health: HealthMonitor,
    pub(crate) counters: Arc<BridgeCounters>,
    pub(crate) events: broadcast::Sender<BridgeEvent>,
    pub(crate) state: watch::Sender<ServiceState>,
    pub(crate) lock_id_prefix: String,
    pub(crate) default_site_id: Option<String>,
}

impl BridgeCore {
    pub(crate) fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    pub(crate) fn stats(&self) -> BridgeStats {
        BridgeStats {
            state: self.state(),
            started_at: *self.counters.started_at.lock(),
            active_mappings: self.mappings.active_count(),
            unlocks_processed: self.counters.unlocks_processed.load(Ordering::Relaxed),
            events_forwarded: self.counters.events_forwarded.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            last_error: self.counters.last_error.lock().clone(),
        }
    }

    pub(crate) fn health_report(&self) -> HealthReport {
        HealthReport {
            overall: self.health.overall(),
            components: self.health.all_components(),
            circuits: self.circuits.stats(),
            translator: self.translator.stats(),
            stats: self.stats(),
        }
    }
}

/// Background listeners spawned on start.
struct Listeners {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Door-access bridge between a local controller and a cloud service.
///
/// # Thread Safety
///
/// `Send + Sync`; every operation takes `&self`, so the service can be shared
/// behind an `Arc` between the lifecycle owner and HTTP handlers.
pub struct BridgeService {
    config: BridgeConfig,
    core: Arc<BridgeCore>,
    verifier: Arc<WebhookVerifier>,
    startup_retry: RetryConfig,
    initialized: AtomicBool,
    /// Serializes start / stop / initialize
    lifecycle: tokio::sync::Mutex<()>,
    listeners: Mutex<Option<Listeners>>,
}

impl BridgeService {
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        self.core.state()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.core.state.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.core.events.subscribe()
    }

    /// Snapshot of counters; never a live reference.
    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        self.core.stats()
    }

    #[must_use]
    pub fn health_report(&self) -> HealthReport {
        self.core.health_report()
    }

    #[must_use]
    pub fn mappings(&self) -> &MappingService {
        &self.core.mappings
    }

    #[must_use]
    pub fn translator(&self) -> &EventTranslator {
        &self.core.translator
    }

    #[must_use]
    pub fn health(&self) -> &HealthMonitor {
        &self.core.health
    }

    #[must_use]
    pub fn circuits(&self) -> &DependencyCircuits {
        &self.core.circuits
    }

    /// Router serving `POST /webhook/{provider}` and `GET /health`.
    pub fn webhook_router(&self) -> axum::Router {
        webhook::router(self.core.clone(), Arc::clone(&self.verifier))
    }
}
