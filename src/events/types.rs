// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outbound event schema and the physical → cloud translation table.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::clients::{DoorEvent, DoorEventType};
use crate::mapping::DoorMapping;

/// Cloud-side event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloudEventType {
    #[serde(rename = "door.unlocked")]
    DoorUnlocked,
    #[serde(rename = "door.locked")]
    DoorLocked,
    #[serde(rename = "door.opened")]
    DoorOpened,
    #[serde(rename = "door.closed")]
    DoorClosed,
    #[serde(rename = "door.forced")]
    DoorForced,
    #[serde(rename = "door.held_open")]
    DoorHeldOpen,
    #[serde(rename = "access.granted")]
    AccessGranted,
    #[serde(rename = "access.denied")]
    AccessDenied,
}

impl From<DoorEventType> for CloudEventType {
    fn from(source: DoorEventType) -> Self {
        match source {
            DoorEventType::Unlocked => Self::DoorUnlocked,
            DoorEventType::Locked => Self::DoorLocked,
            DoorEventType::Opened => Self::DoorOpened,
            DoorEventType::Closed => Self::DoorClosed,
            DoorEventType::Forced => Self::DoorForced,
            DoorEventType::HeldOpen => Self::DoorHeldOpen,
            DoorEventType::AccessGranted => Self::AccessGranted,
            DoorEventType::AccessDenied => Self::AccessDenied,
        }
    }
}

/// Door-state flags derived from one physical event. Unset flags are unknown, not false.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoorState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_open: Option<bool>,
}

impl DoorState {
    #[must_use]
    pub fn for_event(event_type: DoorEventType) -> Self {
        let mut state = Self::default();
        match event_type {
            DoorEventType::Unlocked => state.locked = Some(false),
            DoorEventType::Locked => state.locked = Some(true),
            DoorEventType::Opened => state.opened = Some(true),
            DoorEventType::Closed => state.opened = Some(false),
            DoorEventType::Forced => {
                state.forced = Some(true);
                state.opened = Some(true);
            }
            DoorEventType::HeldOpen => {
                state.held_open = Some(true);
                state.opened = Some(true);
            }
            DoorEventType::AccessGranted | DoorEventType::AccessDenied => {}
        }
        state
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Event in the cloud service's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslatedEvent {
    pub lock_id: String,
    pub event_type: CloudEventType,
    /// RFC 3339 with millisecond precision
    pub timestamp: String,
    pub state: DoorState,
    #[serde(default)]
    pub metadata: Value,
}

impl TranslatedEvent {
    /// Pure translation of a physical event through its mapping.
    #[must_use]
    pub fn from_door_event(event: &DoorEvent, mapping: &DoorMapping) -> Self {
        let mut metadata = json!({
            "doorName": mapping.name,
            "controllerDoorId": mapping.controller_door_id,
            "sourceType": event.event_type.as_str(),
        });
        if let Some(site) = &mapping.site_id {
            metadata["siteId"] = json!(site);
        }
        if let Some(data) = &event.data {
            metadata["data"] = data.clone();
        }

        Self {
            lock_id: mapping.cloud_lock_id.clone(),
            event_type: event.event_type.into(),
            timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            state: DoorState::for_event(event.event_type),
            metadata,
        }
    }
}

/// Deduplication key: `lockId:eventType:timestampMillis`.
#[must_use]
pub fn event_id(lock_id: &str, event_type: DoorEventType, timestamp: &DateTime<Utc>) -> String {
    format!("{}:{}:{}", lock_id, event_type, timestamp.timestamp_millis())
}

/// An event waiting in the translator queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub id: String,
    pub event: TranslatedEvent,
    pub source: DoorEvent,
    pub mapping: DoorMapping,
    pub enqueued_at: DateTime<Utc>,
    /// Failed delivery attempts so far
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::NewMapping;

    fn mapping() -> DoorMapping {
        NewMapping::new("L1", "d1", "Front door").with_site("hq").into_mapping(Utc::now())
    }

    #[test]
    fn test_state_table() {
        let s = |t| DoorState::for_event(t);

        assert_eq!(s(DoorEventType::Unlocked).locked, Some(false));
        assert_eq!(s(DoorEventType::Locked).locked, Some(true));
        assert_eq!(s(DoorEventType::Opened).opened, Some(true));
        assert_eq!(s(DoorEventType::Closed).opened, Some(false));

        let forced = s(DoorEventType::Forced);
        assert_eq!((forced.forced, forced.opened), (Some(true), Some(true)));

        let held = s(DoorEventType::HeldOpen);
        assert_eq!((held.held_open, held.opened), (Some(true), Some(true)));

        assert!(s(DoorEventType::AccessGranted).is_empty());
        assert!(s(DoorEventType::AccessDenied).is_empty());
    }

    #[test]
    fn test_translation_wire_format() {
        let ts = DateTime::parse_from_rfc3339("2026-03-04T05:06:07.089Z").unwrap().with_timezone(&Utc);
        let source = DoorEvent::new("d1", DoorEventType::Forced).at(ts);

        let json = serde_json::to_value(TranslatedEvent::from_door_event(&source, &mapping())).unwrap();

        assert_eq!(json["lockId"], "L1");
        assert_eq!(json["eventType"], "door.forced");
        assert_eq!(json["timestamp"], "2026-03-04T05:06:07.089Z");
        assert_eq!(json["state"], json!({"forced": true, "opened": true}));
        assert_eq!(json["metadata"]["doorName"], "Front door");
        assert_eq!(json["metadata"]["siteId"], "hq");
    }

    #[test]
    fn test_access_events_carry_source_data_only_in_metadata() {
        let source = DoorEvent {
            data: Some(json!({"credential": "abc"})),
            ..DoorEvent::new("d1", DoorEventType::AccessDenied)
        };

        let event = TranslatedEvent::from_door_event(&source, &mapping());

        assert_eq!(event.event_type, CloudEventType::AccessDenied);
        assert!(event.state.is_empty());
        assert_eq!(event.metadata["data"]["credential"], "abc");
    }

    #[test]
    fn test_event_id_is_deterministic() {
        let ts = Utc::now();
        assert_eq!(
            event_id("L1", DoorEventType::Opened, &ts),
            event_id("L1", DoorEventType::Opened, &ts)
        );
        assert_ne!(
            event_id("L1", DoorEventType::Opened, &ts),
            event_id("L1", DoorEventType::Closed, &ts)
        );
    }
}
