// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the door bridge.
//!
//! # Example
//!
//! ```
//! use door_bridge::BridgeConfig;
//!
//! // Minimal config (uses defaults, verification needs a secret)
//! let config = BridgeConfig {
//!     webhook_secret: Some("whsec_123".into()),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! assert_eq!(config.circuit_failure_threshold, 5);
//!
//! // Typically deserialized from the operator's config file
//! let config: BridgeConfig = serde_json::from_str(r#"{
//!     "mappings_path": "/var/lib/door-bridge/mappings.json",
//!     "webhook_skip_verification": true,
//!     "health_check_interval_ms": 10000
//! }"#).unwrap();
//! assert_eq!(config.health_config().check_interval.as_secs(), 10);
//! ```

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::events::TranslatorConfig;
use crate::health::HealthConfig;
use crate::mapping::MappingStoreConfig;
use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resilience::retry::RetryConfig;
use crate::webhook::WebhookConfig;

/// Configuration for the bridge service.
///
/// All fields have sensible defaults. Production deployments must at least
/// set `webhook_secret` (or explicitly skip verification).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BridgeConfig {
    /// Mapping store file
    #[serde(default = "default_mappings_path")]
    pub mappings_path: PathBuf,

    /// Quiet period before mapping changes are written
    #[serde(default = "default_save_debounce_ms")]
    pub save_debounce_ms: u64,

    /// Cloud lock id for newly discovered doors is `lock_id_prefix + door id`
    #[serde(default = "default_lock_id_prefix")]
    pub lock_id_prefix: String,

    /// Site stamped on mappings created during sync
    #[serde(default)]
    pub default_site_id: Option<String>,

    /// Per-operation retry (unlock, registration, discovery)
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_factor")]
    pub retry_factor: f64,
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,

    /// Authentication attempts during start
    #[serde(default = "default_startup_retry_attempts")]
    pub startup_retry_attempts: usize,

    /// Circuit breakers (one per dependency)
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_success_threshold")]
    pub circuit_success_threshold: u32,
    #[serde(default = "default_circuit_timeout_ms")]
    pub circuit_timeout_ms: u64,

    /// Health monitor
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_health_failure_threshold")]
    pub health_failure_threshold: u32,

    /// Event translator
    #[serde(default = "default_event_dedup_window_ms")]
    pub event_dedup_window_ms: u64,
    #[serde(default = "default_event_max_queue_size")]
    pub event_max_queue_size: usize,
    #[serde(default = "default_event_processing_delay_ms")]
    pub event_processing_delay_ms: u64,
    #[serde(default = "default_event_batch_size")]
    pub event_batch_size: usize,
    #[serde(default = "default_event_max_attempts")]
    pub event_max_attempts: u32,

    /// Shared secret for inbound webhook signatures
    #[serde(default)]
    pub webhook_secret: Option<String>,

    /// Accept unsigned webhooks (logged on every request)
    #[serde(default)]
    pub webhook_skip_verification: bool,
}

fn default_mappings_path() -> PathBuf { PathBuf::from("./door_mappings.json") }
fn default_save_debounce_ms() -> u64 { 5_000 }
fn default_lock_id_prefix() -> String { "door-".to_string() }
fn default_retry_max_attempts() -> usize { 3 }
fn default_retry_initial_delay_ms() -> u64 { 100 }
fn default_retry_max_delay_ms() -> u64 { 2_000 }
fn default_retry_factor() -> f64 { 2.0 }
fn default_retry_jitter() -> f64 { 0.25 }
fn default_startup_retry_attempts() -> usize { 5 }
fn default_circuit_failure_threshold() -> u32 { 5 }
fn default_circuit_success_threshold() -> u32 { 2 }
fn default_circuit_timeout_ms() -> u64 { 60_000 }
fn default_health_check_interval_ms() -> u64 { 30_000 }
fn default_health_timeout_ms() -> u64 { 5_000 }
fn default_health_failure_threshold() -> u32 { 3 }
fn default_event_dedup_window_ms() -> u64 { 5_000 }
fn default_event_max_queue_size() -> usize { 1_000 }
fn default_event_processing_delay_ms() -> u64 { 1_000 }
fn default_event_batch_size() -> usize { 10 }
fn default_event_max_attempts() -> u32 { 3 }

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mappings_path: default_mappings_path(),
            save_debounce_ms: default_save_debounce_ms(),
            lock_id_prefix: default_lock_id_prefix(),
            default_site_id: None,
            retry_max_attempts: default_retry_max_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_factor: default_retry_factor(),
            retry_jitter: default_retry_jitter(),
            startup_retry_attempts: default_startup_retry_attempts(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_success_threshold: default_circuit_success_threshold(),
            circuit_timeout_ms: default_circuit_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_timeout_ms: default_health_timeout_ms(),
            health_failure_threshold: default_health_failure_threshold(),
            event_dedup_window_ms: default_event_dedup_window_ms(),
            event_max_queue_size: default_event_max_queue_size(),
            event_processing_delay_ms: default_event_processing_delay_ms(),
            event_batch_size: default_event_batch_size(),
            event_max_attempts: default_event_max_attempts(),
            webhook_secret: None,
            webhook_skip_verification: false,
        }
    }
}

impl BridgeConfig {
    /// Reject configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.mappings_path.as_os_str().is_empty() {
            return Err("mappings_path must not be empty".into());
        }
        if self.retry_max_attempts == 0 || self.startup_retry_attempts == 0 {
            return Err("retry attempts must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(format!("retry_jitter must be within [0, 1], got {}", self.retry_jitter));
        }
        if !self.retry_factor.is_finite() || self.retry_factor < 1.0 {
            return Err(format!("retry_factor must be >= 1, got {}", self.retry_factor));
        }
        if self.circuit_failure_threshold == 0 || self.circuit_success_threshold == 0 {
            return Err("circuit thresholds must be at least 1".into());
        }
        if self.health_failure_threshold == 0 {
            return Err("health_failure_threshold must be at least 1".into());
        }
        if self.health_check_interval_ms == 0 || self.event_processing_delay_ms == 0 {
            return Err("timer intervals must be non-zero".into());
        }
        if self.event_batch_size == 0 || self.event_max_queue_size == 0 || self.event_max_attempts == 0 {
            return Err("event batch size, queue size and attempts must be at least 1".into());
        }
        let has_secret = self.webhook_secret.as_deref().is_some_and(|s| !s.is_empty());
        if !has_secret && !self.webhook_skip_verification {
            return Err("webhook_secret is required unless webhook_skip_verification is set".into());
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            factor: self.retry_factor,
            jitter: self.retry_jitter,
        }
    }

    #[must_use]
    pub fn startup_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.startup_retry_attempts,
            jitter: self.retry_jitter,
            ..RetryConfig::startup()
        }
    }

    #[must_use]
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            success_threshold: self.circuit_success_threshold,
            recovery_timeout: Duration::from_millis(self.circuit_timeout_ms),
        }
    }

    #[must_use]
    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            check_interval: Duration::from_millis(self.health_check_interval_ms),
            timeout: Duration::from_millis(self.health_timeout_ms),
            failure_threshold: self.health_failure_threshold,
        }
    }

    #[must_use]
    pub fn translator_config(&self) -> TranslatorConfig {
        TranslatorConfig {
            dedup_window: Duration::from_millis(self.event_dedup_window_ms),
            max_queue_size: self.event_max_queue_size,
            processing_delay: Duration::from_millis(self.event_processing_delay_ms),
            batch_size: self.event_batch_size,
            max_attempts: self.event_max_attempts,
        }
    }

    #[must_use]
    pub fn mapping_store_config(&self) -> MappingStoreConfig {
        MappingStoreConfig {
            path: self.mappings_path.clone(),
            save_debounce: Duration::from_millis(self.save_debounce_ms),
        }
    }

    #[must_use]
    pub fn webhook_config(&self) -> WebhookConfig {
        WebhookConfig {
            secret: self.webhook_secret.clone(),
            skip_verification: self.webhook_skip_verification,
        }
    }
}
