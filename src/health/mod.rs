// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic liveness classification per named component.
//!
//! Independent of the circuit breakers: a breaker answers "may we call this
//! dependency right now", a probe answers "is it reachable". Both can
//! disagree, and both are reported.
//!
//! # Status derivation
//!
//! | Probe result             | consecutive failures | status                                   |
//! |--------------------------|----------------------|------------------------------------------|
//! | Healthy                  | reset to 0           | Healthy                                  |
//! | Degraded                 | unchanged            | Degraded                                 |
//! | Unhealthy / error / timeout | +1                | Unhealthy at `failure_threshold`, else Degraded |
//!
//! A [`HealthEvent::StatusChanged`] is broadcast only when the status changes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge encoding (0 = healthy, 1 = degraded, 2 = unhealthy)
    #[must_use]
    pub fn as_gauge(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// What a probe reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub status: HealthStatus,
    pub message: Option<String>,
    pub details: Option<Value>,
}

impl ProbeReport {
    pub fn healthy() -> Self {
        Self { status: HealthStatus::Healthy, message: None, details: None }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Degraded, message: Some(message.into()), details: None }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Unhealthy, message: Some(message.into()), details: None }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("timeout")]
    Timeout,
    #[error("{0}")]
    Failed(String),
    #[error("probe panicked")]
    Panicked,
}

/// A liveness check for one component.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<ProbeReport, ProbeError>;
}

#[async_trait]
impl<F, Fut> HealthProbe for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProbeReport, ProbeError>> + Send + 'static,
{
    async fn check(&self) -> Result<ProbeReport, ProbeError> {
        (self)().await
    }
}

/// Health record for one registered component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub message: Option<String>,
    pub details: Option<Value>,
}

impl ComponentHealth {
    fn new(name: String) -> Self {
        Self {
            name,
            status: HealthStatus::Healthy,
            last_check: None,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
            message: None,
            details: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    StatusChanged {
        component: String,
        previous: HealthStatus,
        current: HealthStatus,
        health: ComponentHealth,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    pub check_interval: Duration,
    /// Hard limit per probe; exceeding it counts as a failure
    pub timeout: Duration,
    /// Consecutive failures before a component is Unhealthy
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

struct Registered {
    probe: Arc<dyn HealthProbe>,
    health: ComponentHealth,
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    config: HealthConfig,
    components: RwLock<BTreeMap<String, Registered>>,
    events: broadcast::Sender<HealthEvent>,
    /// Prevents overlapping rounds
    checking: tokio::sync::Mutex<()>,
    worker: Mutex<Option<Worker>>,
}

impl Inner {
    async fn run_round(&self) -> HealthStatus {
        let _guard = self.checking.lock().await;

        let probes: Vec<(String, Arc<dyn HealthProbe>)> = self
            .components
            .read()
            .iter()
            .map(|(name, reg)| (name.clone(), Arc::clone(&reg.probe)))
            .collect();

        let timeout = self.config.timeout;
        let running: Vec<_> = probes
            .into_iter()
            .map(|(name, probe)| {
                let handle = tokio::spawn(async move { tokio::time::timeout(timeout, probe.check()).await });
                (name, handle)
            })
            .collect();

        for (name, handle) in running {
            let result = match handle.await {
                Ok(Ok(result)) => result,
                Ok(Err(_elapsed)) => Err(ProbeError::Timeout),
                Err(_) => Err(ProbeError::Panicked),
            };
            self.apply(&name, result);
        }

        self.overall()
    }

    fn apply(&self, name: &str, result: Result<ProbeReport, ProbeError>) {
        let now = Utc::now();
        let threshold = self.config.failure_threshold.max(1);

        let changed = {
            let mut components = self.components.write();
            // Unregistered while its probe was running
            let Some(reg) = components.get_mut(name) else {
                return;
            };
            let health = &mut reg.health;
            let previous = health.status;
            health.last_check = Some(now);

            let outcome = match result {
                Ok(report) if report.status == HealthStatus::Healthy => {
                    health.consecutive_failures = 0;
                    health.status = HealthStatus::Healthy;
                    health.last_success = Some(now);
                    health.message = report.message;
                    health.details = report.details;
                    "healthy"
                }
                Ok(report) if report.status == HealthStatus::Degraded => {
                    health.status = HealthStatus::Degraded;
                    health.message = report.message;
                    health.details = report.details;
                    "degraded"
                }
                other => {
                    let (message, details) = match other {
                        Ok(report) => (report.message, report.details),
                        Err(e) => (Some(e.to_string()), None),
                    };
                    health.consecutive_failures += 1;
                    health.last_failure = Some(now);
                    health.status = if health.consecutive_failures >= threshold {
                        HealthStatus::Unhealthy
                    } else {
                        HealthStatus::Degraded
                    };
                    health.message = message;
                    health.details = details;
                    "failure"
                }
            };

            crate::metrics::record_health_probe(name, outcome);
            crate::metrics::set_component_health(name, health.status.as_gauge());
            debug!(component = %name, status = %health.status, failures = health.consecutive_failures, "Health probe completed");

            (previous != health.status).then(|| (previous, health.clone()))
        };

        if let Some((previous, health)) = changed {
            if health.status > previous {
                warn!(
                    component = %name,
                    previous = %previous,
                    current = %health.status,
                    message = health.message.as_deref().unwrap_or(""),
                    "Component health worsened"
                );
            } else {
                info!(component = %name, previous = %previous, current = %health.status, "Component health improved");
            }
            let _ = self.events.send(HealthEvent::StatusChanged {
                component: name.to_string(),
                previous,
                current: health.status,
                health,
            });
        }
    }

    fn overall(&self) -> HealthStatus {
        self.components
            .read()
            .values()
            .map(|reg| reg.health.status)
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }
}

/// Runs registered probes on an interval and tracks per-component status.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                config,
                components: RwLock::new(BTreeMap::new()),
                events,
                checking: tokio::sync::Mutex::new(()),
                worker: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.inner.config
    }

    /// Register (or replace) the probe for `name`.
    ///
    /// Components start out Healthy until a probe says otherwise.
    pub fn register_component(&self, name: impl Into<String>, probe: impl HealthProbe + 'static) {
        self.register_probe(name, Arc::new(probe));
    }

    pub fn register_probe(&self, name: impl Into<String>, probe: Arc<dyn HealthProbe>) {
        let name = name.into();
        debug!(component = %name, "Health probe registered");
        self.inner.components.write().insert(
            name.clone(),
            Registered {
                probe,
                health: ComponentHealth::new(name),
            },
        );
    }

    pub fn unregister_component(&self, name: &str) -> bool {
        self.inner.components.write().remove(name).is_some()
    }

    /// Run one round of every probe now and return the overall status.
    pub async fn check_now(&self) -> HealthStatus {
        self.inner.run_round().await
    }

    /// Start periodic checks. The first round runs immediately.
    pub fn start(&self) {
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let period = self.inner.config.check_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.run_round().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        *worker = Some(Worker { shutdown, handle });
        info!(
            interval_secs = period.as_secs(),
            components = self.inner.components.read().len(),
            "Health monitor started"
        );
    }

    pub async fn stop(&self) {
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(true);
            if let Err(e) = worker.handle.await {
                warn!(error = %e, "Health monitor task ended abnormally");
            }
            info!("Health monitor stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.worker.lock().is_some()
    }

    /// Worst status across all components. Healthy when nothing is registered.
    #[must_use]
    pub fn overall(&self) -> HealthStatus {
        self.inner.overall()
    }

    #[must_use]
    pub fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.inner.components.read().get(name).map(|reg| reg.health.clone())
    }

    /// All component records, ordered by name.
    #[must_use]
    pub fn all_components(&self) -> Vec<ComponentHealth> {
        self.inner
            .components
            .read()
            .values()
            .map(|reg| reg.health.clone())
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.inner.events.subscribe()
    }
}
