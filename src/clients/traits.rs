// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Contracts for the two vendor collaborators.
//!
//! The bridge never speaks a wire protocol itself. A door controller adapter
//! and a cloud adapter implement these traits; everything else in the crate
//! is written against them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::events::TranslatedEvent;
use crate::mapping::DoorMapping;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("authentication failed: {0}")]
    Unauthorized(String),
    #[error("rate limited")]
    RateLimited,
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("client not connected")]
    NotConnected,
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    /// Transient errors are worth retrying and count towards circuit breaking.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout | Self::RateLimited | Self::Server { .. } | Self::NotConnected
        )
    }
}

/// A physical door as reported by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Door {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Door {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            floor: None,
            metadata: None,
        }
    }
}

/// Physical door-state event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorEventType {
    Unlocked,
    Locked,
    Opened,
    Closed,
    Forced,
    HeldOpen,
    AccessGranted,
    AccessDenied,
}

impl DoorEventType {
    pub const ALL: [DoorEventType; 8] = [
        Self::Unlocked,
        Self::Locked,
        Self::Opened,
        Self::Closed,
        Self::Forced,
        Self::HeldOpen,
        Self::AccessGranted,
        Self::AccessDenied,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unlocked => "unlocked",
            Self::Locked => "locked",
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::Forced => "forced",
            Self::HeldOpen => "held_open",
            Self::AccessGranted => "access_granted",
            Self::AccessDenied => "access_denied",
        }
    }
}

impl std::fmt::Display for DoorEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event surfaced by the controller for one of its doors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoorEvent {
    pub door_id: String,
    #[serde(rename = "type")]
    pub event_type: DoorEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl DoorEvent {
    pub fn new(door_id: impl Into<String>, event_type: DoorEventType) -> Self {
        Self {
            door_id: door_id.into(),
            event_type,
            timestamp: Utc::now(),
            data: None,
        }
    }

    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Unlock request surfaced by the cloud side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockCommand {
    pub lock_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl UnlockCommand {
    pub fn new(lock_id: impl Into<String>) -> Self {
        Self {
            lock_id: lock_id.into(),
            user_id: None,
            timestamp: Utc::now(),
        }
    }
}

/// The local door controller (LAN / REST).
#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn authenticate(&self) -> Result<(), ClientError>;

    async fn discover_doors(&self) -> Result<Vec<Door>, ClientError>;

    /// `Ok(false)` means the controller answered but refused the unlock.
    async fn unlock(&self, door_id: &str) -> Result<bool, ClientError>;

    /// Door-state event stream, if the controller supports push events.
    fn subscribe_events(&self) -> Option<broadcast::Receiver<DoorEvent>> {
        None
    }

    /// Cheap reachability check used by the health monitor.
    async fn ping(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn disconnect(&self) {}
}

/// The cloud mobile-credential service.
#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn authenticate(&self) -> Result<(), ClientError>;

    async fn register_door(&self, mapping: &DoorMapping) -> Result<bool, ClientError>;

    /// Begin cloud-side monitoring for a lock.
    async fn start_door(&self, lock_id: &str) -> Result<bool, ClientError>;

    async fn stop_door(&self, lock_id: &str) -> Result<bool, ClientError>;

    async fn send_door_event(&self, lock_id: &str, event: &TranslatedEvent) -> Result<bool, ClientError>;

    /// Inbound unlock commands pushed by the cloud service.
    fn subscribe_unlock_commands(&self) -> Option<broadcast::Receiver<UnlockCommand>> {
        None
    }

    async fn ping(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn disconnect(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ClientError::Timeout.is_transient());
        assert!(ClientError::Network("reset".into()).is_transient());
        assert!(ClientError::Server { status: 503, message: "busy".into() }.is_transient());
        assert!(ClientError::RateLimited.is_transient());
        assert!(!ClientError::Unauthorized("bad key".into()).is_transient());
        assert!(!ClientError::Rejected("door offline".into()).is_transient());
    }

    #[test]
    fn test_door_event_wire_format() {
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z").unwrap().with_timezone(&Utc);
        let event = DoorEvent::new("d1", DoorEventType::HeldOpen).at(ts);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["doorId"], "d1");
        assert_eq!(json["type"], "held_open");
        assert_eq!(json["timestamp"], "2026-01-02T03:04:05Z");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_event_type_display_matches_wire() {
        for t in DoorEventType::ALL {
            let wire = serde_json::to_value(t).unwrap();
            assert_eq!(wire, t.to_string());
        }
    }
}
