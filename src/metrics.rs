// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for door-bridge.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `door_bridge_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `dependency`: controller, cloud
//! - `source`: command, webhook, manual
//! - `outcome`: success, failure, rejected, not_mapped, disabled

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record one unlock attempt and how it ended
pub fn record_unlock(source: &str, outcome: &str) {
    counter!(
        "door_bridge_unlocks_total",
        "source" => source.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record latency of a guarded collaborator call
pub fn record_latency(dependency: &str, operation: &str, duration: Duration) {
    histogram!(
        "door_bridge_operation_seconds",
        "dependency" => dependency.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an event-pipeline outcome (queued, duplicate, delivered, failed, dropped, evicted)
pub fn record_event(status: &str, count: usize) {
    counter!(
        "door_bridge_events_total",
        "status" => status.to_string()
    )
    .increment(count as u64);
}

/// Set current translator queue depth
pub fn set_event_queue_depth(depth: usize) {
    gauge!("door_bridge_event_queue_depth").set(depth as f64);
}

/// Record a retry wait
pub fn record_retry(operation: &str) {
    counter!(
        "door_bridge_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record circuit breaker state change (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "door_bridge_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record circuit breaker call
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "door_bridge_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set component health (0 = healthy, 1 = degraded, 2 = unhealthy)
pub fn set_component_health(component: &str, status: u8) {
    gauge!(
        "door_bridge_component_health",
        "component" => component.to_string()
    )
    .set(status as f64);
}

/// Record a single probe run
pub fn record_health_probe(component: &str, outcome: &str) {
    counter!(
        "door_bridge_health_probes_total",
        "component" => component.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a mapping store write
pub fn record_mapping_save(duration: Duration, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("door_bridge_mapping_saves_total", "status" => status).increment(1);
    histogram!("door_bridge_mapping_save_seconds").record(duration.as_secs_f64());
}

/// Set number of enabled mappings
pub fn set_active_mappings(count: usize) {
    gauge!("door_bridge_active_mappings").set(count as f64);
}

/// Record the outcome of a door synchronization pass
pub fn record_door_sync(synced: usize, failed: usize) {
    counter!("door_bridge_doors_synced_total").increment(synced as u64);
    counter!("door_bridge_doors_sync_failed_total").increment(failed as u64);
}

/// Record an inbound webhook
pub fn record_webhook(provider: &str, outcome: &str) {
    counter!(
        "door_bridge_webhooks_total",
        "provider" => provider.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a lifecycle transition
pub fn set_service_state(state: &str) {
    counter!(
        "door_bridge_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record a lifecycle phase duration
pub fn record_lifecycle_phase(phase: &str, duration: Duration) {
    histogram!(
        "door_bridge_lifecycle_phase_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an error surfaced at the bridge boundary
pub fn record_error(dependency: &str, operation: &str) {
    counter!(
        "door_bridge_errors_total",
        "dependency" => dependency.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Helper to time an operation and record latency on drop
pub struct LatencyTimer {
    dependency: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(dependency: &'static str, operation: &'static str) -> Self {
        Self {
            dependency,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.dependency, self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These verify the API doesn't panic without an installed recorder.
    // The demo installs metrics-util's DebuggingRecorder for real values.

    #[test]
    fn test_unlock_and_event_counters() {
        record_unlock("command", "success");
        record_unlock("webhook", "not_mapped");
        record_event("queued", 1);
        record_event("evicted", 100);
        set_event_queue_depth(42);
    }

    #[test]
    fn test_circuit_and_health_metrics() {
        set_circuit_state("controller", 0);
        set_circuit_state("cloud", 2);
        record_circuit_call("controller", "success");
        record_circuit_call("cloud", "rejected");
        set_component_health("controller", 1);
        record_health_probe("cloud", "timeout");
    }

    #[test]
    fn test_lifecycle_metrics() {
        set_service_state("Running");
        record_lifecycle_phase("door_sync", Duration::from_millis(12));
        record_door_sync(3, 0);
        record_mapping_save(Duration::from_millis(2), true);
        set_active_mappings(3);
        record_webhook("unifi", "unauthorized");
        record_error("controller", "unlock");
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("controller", "unlock");
            std::thread::sleep(Duration::from_millis(1));
        }
        // Timer recorded on drop
    }
}
