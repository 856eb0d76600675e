// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker guarding one remote dependency.
//!
//! Provides protection against hammering a collaborator (the door controller
//! or the cloud service) while it is unreachable. Wraps async operations and
//! counts outcomes to "trip" the breaker when the threshold is reached.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Dependency unhealthy, requests fail-fast without attempting
//! - HalfOpen: Testing if dependency recovered, requests pass through
//!
//! Open → HalfOpen is driven by a spawned timer, not by the next call.
//! The breaker never inspects error types: any `Err` counts as a failure.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected)
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Number of failures in Closed state to trip the circuit
    pub failure_threshold: u32,
    /// Number of consecutive successes in half-open to close circuit
    pub success_threshold: u32,
    /// How long to stay open before attempting recovery (half-open)
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    /// Aggressive config for critical paths (trips faster, recovers cautiously)
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(120),
        }
    }

    /// Lenient config for less critical paths (tolerates more failures)
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(30),
        }
    }

    /// Fast recovery for tests
    #[must_use]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// Transition notification emitted by a breaker.
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitEvent {
    Opened { circuit: String, at: DateTime<Utc>, failures: u32 },
    HalfOpened { circuit: String, at: DateTime<Utc> },
    Closed { circuit: String, at: DateTime<Utc> },
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub total_requests: u64,
    pub rejections: u64,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    /// Bumped on every transition into Open; a timer only fires for its own generation.
    generation: u64,
}

struct Shared {
    name: String,
    config: CircuitConfig,
    core: Mutex<BreakerCore>,
    events: broadcast::Sender<CircuitEvent>,

    // Metrics
    calls_total: AtomicU64,
    call_successes: AtomicU64,
    call_failures: AtomicU64,
    rejections: AtomicU64,
}

/// A named circuit breaker with metrics tracking.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                core: Mutex::new(BreakerCore {
                    state: CircuitState::Closed,
                    failures: 0,
                    successes: 0,
                    opened_at: None,
                    last_failure: None,
                    last_success: None,
                    generation: 0,
                }),
                events,
                calls_total: AtomicU64::new(0),
                call_successes: AtomicU64::new(0),
                call_failures: AtomicU64::new(0),
                rejections: AtomicU64::new(0),
            }),
        }
    }

    /// Create with default config
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitConfig::default())
    }

    /// Get the circuit breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.shared.config
    }

    /// Get current circuit state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.shared.core.lock().state
    }

    /// Subscribe to open / half-open / close notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.shared.events.subscribe()
    }

    /// Execute an async operation through the circuit breaker
    ///
    /// Takes a closure that returns a Future, so a rejected call never
    /// constructs (let alone polls) the wrapped operation.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.shared.calls_total.fetch_add(1, Ordering::Relaxed);

        if self.state() == CircuitState::Open {
            self.shared.rejections.fetch_add(1, Ordering::Relaxed);
            warn!(circuit = %self.shared.name, "Circuit breaker rejected call (open)");
            crate::metrics::record_circuit_call(&self.shared.name, "rejected");
            return Err(CircuitError::Rejected);
        }

        match f().await {
            Ok(result) => {
                self.shared.call_successes.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.shared.name, "Circuit call succeeded");
                crate::metrics::record_circuit_call(&self.shared.name, "success");
                self.on_success();
                Ok(result)
            }
            Err(e) => {
                self.shared.call_failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.shared.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.shared.name, "failure");
                self.on_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    fn on_success(&self) {
        let mut core = self.shared.core.lock();
        core.last_success = Some(Utc::now());

        let state = core.state;
        match state {
            CircuitState::Closed => core.failures = 0,
            CircuitState::HalfOpen => {
                core.successes += 1;
                if core.successes >= self.shared.config.success_threshold {
                    core.state = CircuitState::Closed;
                    core.failures = 0;
                    core.successes = 0;
                    core.opened_at = None;
                    drop(core);
                    info!(circuit = %self.shared.name, "Circuit breaker closed after successful recovery");
                    self.publish_state(CircuitState::Closed);
                    let _ = self.shared.events.send(CircuitEvent::Closed {
                        circuit: self.shared.name.clone(),
                        at: Utc::now(),
                    });
                }
            }
            // A call admitted before the breaker opened; it does not close the circuit.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut core = self.shared.core.lock();
        core.last_failure = Some(Utc::now());

        let state = core.state;
        match state {
            CircuitState::Closed => {
                core.failures += 1;
                if core.failures >= self.shared.config.failure_threshold {
                    let failures = core.failures;
                    self.trip(&mut core);
                    drop(core);
                    warn!(
                        circuit = %self.shared.name,
                        failures,
                        "Circuit breaker opened due to failures"
                    );
                    self.after_trip(failures);
                }
            }
            CircuitState::HalfOpen => {
                core.failures += 1;
                let failures = core.failures;
                self.trip(&mut core);
                drop(core);
                warn!(circuit = %self.shared.name, "Circuit breaker reopened after failure in half-open state");
                self.after_trip(failures);
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, core: &mut BreakerCore) {
        core.state = CircuitState::Open;
        core.successes = 0;
        core.opened_at = Some(Utc::now());
        core.generation += 1;
        self.schedule_half_open(core.generation);
    }

    fn after_trip(&self, failures: u32) {
        self.publish_state(CircuitState::Open);
        let _ = self.shared.events.send(CircuitEvent::Opened {
            circuit: self.shared.name.clone(),
            at: Utc::now(),
            failures,
        });
    }

    fn schedule_half_open(&self, generation: u64) {
        let shared = Arc::clone(&self.shared);
        let timeout = shared.config.recovery_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let breaker = CircuitBreaker { shared };
            breaker.enter_half_open(generation);
        });
    }

    fn enter_half_open(&self, generation: u64) {
        let mut core = self.shared.core.lock();
        if core.state != CircuitState::Open || core.generation != generation {
            return;
        }
        core.state = CircuitState::HalfOpen;
        core.successes = 0;
        drop(core);

        info!(circuit = %self.shared.name, "Circuit breaker transitioning to half-open");
        self.publish_state(CircuitState::HalfOpen);
        let _ = self.shared.events.send(CircuitEvent::HalfOpened {
            circuit: self.shared.name.clone(),
            at: Utc::now(),
        });
    }

    fn publish_state(&self, state: CircuitState) {
        crate::metrics::set_circuit_state(&self.shared.name, state as u8);
    }

    /// Force the breaker closed and clear its counters (operator recovery).
    pub fn reset(&self) {
        let mut core = self.shared.core.lock();
        let was = core.state;
        core.state = CircuitState::Closed;
        core.failures = 0;
        core.successes = 0;
        core.opened_at = None;
        core.generation += 1;
        drop(core);

        if was != CircuitState::Closed {
            info!(circuit = %self.shared.name, from = %was, "Circuit breaker manually reset");
            self.publish_state(CircuitState::Closed);
            let _ = self.shared.events.send(CircuitEvent::Closed {
                circuit: self.shared.name.clone(),
                at: Utc::now(),
            });
        }
    }

    /// Snapshot of state and counters.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let core = self.shared.core.lock();
        CircuitBreakerStats {
            name: self.shared.name.clone(),
            state: core.state,
            failures: core.failures,
            successes: core.successes,
            total_requests: self.calls_total(),
            rejections: self.rejections(),
            opened_at: core.opened_at,
            last_failure: core.last_failure,
            last_success: core.last_success,
        }
    }

    /// Get total number of calls (including rejected ones)
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.shared.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.shared.call_successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls (operation errors)
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.shared.call_failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.shared.rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 - 1.0) over calls that reached the dependency
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let attempted = self.successes() + self.failures();
        if attempted == 0 {
            return 0.0;
        }
        self.failures() as f64 / attempted as f64
    }
}

/// Pre-configured circuit breakers for the two bridged dependencies
#[derive(Debug, Clone)]
pub struct DependencyCircuits {
    /// Guards unlock calls to the door controller
    pub controller: CircuitBreaker,
    /// Guards event/registration calls to the cloud service
    pub cloud: CircuitBreaker,
}

impl DependencyCircuits {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            controller: CircuitBreaker::new("controller", config.clone()),
            cloud: CircuitBreaker::new("cloud", config),
        }
    }

    /// Stats for all circuits
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        vec![self.controller.stats(), self.cloud.stats()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(failures: u32, successes: u32, timeout_ms: u64) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: failures,
            success_threshold: successes,
            recovery_timeout: Duration::from_millis(timeout_ms),
        }
    }

    async fn fail(cb: &CircuitBreaker) {
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;
    }

    async fn succeed(cb: &CircuitBreaker) {
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;
    }

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
        assert_eq!(cb.stats().failures, 1);
        assert!(cb.stats().last_failure.is_some());
    }

    #[tokio::test]
    async fn test_opens_after_exact_threshold_and_rejects_without_invoking() {
        let cb = CircuitBreaker::new("test", config(3, 1, 60_000));

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.stats().opened_at.is_some());

        let invoked = AtomicUsize::new(0);
        let result: Result<i32, CircuitError<&str>> = cb
            .call(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            })
            .await;

        assert!(matches!(result, Err(CircuitError::Rejected)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.rejections(), 1);
        assert_eq!(cb.calls_total(), 4);
    }

    #[tokio::test]
    async fn test_success_in_closed_resets_failure_count() {
        let cb = CircuitBreaker::new("test", config(3, 1, 60_000));

        fail(&cb).await;
        fail(&cb).await;
        succeed(&cb).await;
        fail(&cb).await;
        fail(&cb).await;

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().failures, 2);
    }

    #[tokio::test]
    async fn test_timer_moves_open_to_half_open() {
        let cb = CircuitBreaker::new("test", config(1, 1, 40));

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        // No calls in between: the timer alone performs the transition
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_closes_after_success_threshold() {
        let cb = CircuitBreaker::new("test", config(1, 2, 30));

        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);

        let stats = cb.stats();
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.successes, 0);
        assert!(stats.opened_at.is_none());
    }

    #[tokio::test]
    async fn test_single_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("test", config(2, 3, 30));

        fail(&cb).await;
        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        // And a fresh timer brings it back
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_emits_transition_events() {
        let cb = CircuitBreaker::new("controller", config(1, 1, 30));
        let mut rx = cb.subscribe();

        fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        succeed(&cb).await;

        assert!(matches!(rx.recv().await.unwrap(), CircuitEvent::Opened { failures: 1, .. }));
        assert!(matches!(rx.recv().await.unwrap(), CircuitEvent::HalfOpened { .. }));
        match rx.recv().await.unwrap() {
            CircuitEvent::Closed { circuit, .. } => assert_eq!(circuit, "controller"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_cancels_pending_timer() {
        let cb = CircuitBreaker::new("test", config(1, 1, 30));

        fail(&cb).await;
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failure_rate_calculation() {
        let cb = CircuitBreaker::new("test", config(100, 1, 60_000));

        succeed(&cb).await;
        fail(&cb).await;
        succeed(&cb).await;
        fail(&cb).await;

        assert!((cb.failure_rate() - 0.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_dependency_circuits_names() {
        let circuits = DependencyCircuits::new(CircuitConfig::default());

        assert_eq!(circuits.controller.name(), "controller");
        assert_eq!(circuits.cloud.name(), "cloud");
        assert_eq!(circuits.stats().len(), 2);
    }

    #[test]
    fn test_circuit_config_presets() {
        let default = CircuitConfig::default();
        let aggressive = CircuitConfig::aggressive();
        let lenient = CircuitConfig::lenient();

        // Aggressive trips faster
        assert!(aggressive.failure_threshold < default.failure_threshold);
        // Lenient tolerates more
        assert!(lenient.failure_threshold > default.failure_threshold);
        // Aggressive waits longer to recover
        assert!(aggressive.recovery_timeout > lenient.recovery_timeout);
    }
}
