// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the bridge service.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::clients::ClientError;
use crate::events::{CloudEventType, TranslatorStats};
use crate::health::{ComponentHealth, HealthStatus};
use crate::mapping::MappingError;
use crate::resilience::circuit_breaker::CircuitBreakerStats;

/// Service lifecycle state.
///
/// ```text
/// Stopped → Starting → Running → Stopping → Stopped
///     └───────────┴─────────┴──────────┴──► Error
/// ```
///
/// Use [`super::BridgeService::state()`] to check the current state or
/// [`super::BridgeService::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Not running (initial state)
    Stopped,
    /// Authenticating clients and syncing doors
    Starting,
    /// Routing unlocks and events
    Running,
    /// Tearing down
    Stopping,
    /// Start failed; call `start()` again to retry
    Error,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Where an unlock request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnlockSource {
    /// Pushed by the cloud client
    Command,
    /// Inbound signed webhook
    Webhook,
    /// Operator call to `unlock_door`
    Manual,
}

impl UnlockSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Webhook => "webhook",
            Self::Manual => "manual",
        }
    }
}

/// A completed unlock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockedDoor {
    pub lock_id: String,
    pub door_id: String,
    pub door_name: String,
    pub source: UnlockSource,
    pub at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnlockError {
    #[error("lock '{0}' is not mapped to a door")]
    NotMapped(String),
    #[error("mapping for lock '{0}' is disabled")]
    Disabled(String),
    #[error("controller circuit open, unlock rejected")]
    CircuitOpen,
    #[error("unlock failed: {0}")]
    Failed(#[source] ClientError),
}

impl UnlockError {
    /// True when no mapping allows this lock to be unlocked.
    #[must_use]
    pub fn is_unroutable(&self) -> bool {
        matches!(self, Self::NotMapped(_) | Self::Disabled(_))
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ServiceState,
    },
    #[error("{dependency} client error: {source}")]
    Client {
        dependency: &'static str,
        #[source]
        source: ClientError,
    },
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// One door that could not be fully synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedDoor {
    pub door_id: String,
    pub name: String,
    pub reason: String,
    /// The mapping exists locally even though the cloud side failed
    pub mapped_locally: bool,
}

/// Outcome of one door synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub total: usize,
    pub synced: usize,
    pub failed: usize,
    pub active_mappings: usize,
    pub failed_doors: Vec<FailedDoor>,
}

/// Snapshot of bridge counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStats {
    pub state: ServiceState,
    pub started_at: Option<DateTime<Utc>>,
    pub active_mappings: usize,
    pub unlocks_processed: u64,
    pub events_forwarded: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

/// Everything an operator dashboard needs in one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub circuits: Vec<CircuitBreakerStats>,
    pub translator: TranslatorStats,
    pub stats: BridgeStats,
}

/// Notifications published by the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    StateChanged {
        previous: ServiceState,
        current: ServiceState,
    },
    DoorsSynced(SyncSummary),
    DoorUnlocked(UnlockedDoor),
    EventForwarded {
        lock_id: String,
        event_type: CloudEventType,
    },
    /// A monitored component changed health status
    DependencyHealth {
        component: String,
        previous: HealthStatus,
        current: HealthStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_matches_wire() {
        for state in [
            ServiceState::Stopped,
            ServiceState::Starting,
            ServiceState::Running,
            ServiceState::Stopping,
            ServiceState::Error,
        ] {
            assert_eq!(serde_json::to_value(state).unwrap(), state.to_string());
        }
    }

    #[test]
    fn test_sync_summary_wire_format() {
        let summary = SyncSummary {
            total: 2,
            synced: 1,
            failed: 1,
            active_mappings: 2,
            failed_doors: vec![FailedDoor {
                door_id: "d2".into(),
                name: "Back".into(),
                reason: "request timed out".into(),
                mapped_locally: true,
            }],
        };

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["activeMappings"], 2);
        assert_eq!(json["failedDoors"][0]["doorId"], "d2");
        assert_eq!(json["failedDoors"][0]["mappedLocally"], true);
    }

    #[test]
    fn test_unroutable_errors() {
        assert!(UnlockError::NotMapped("L9".into()).is_unroutable());
        assert!(UnlockError::Disabled("L1".into()).is_unroutable());
        assert!(!UnlockError::CircuitOpen.is_unroutable());
    }
}
