// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Door mapping records and the errors/events around them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Association between one physical door and one cloud-side lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoorMapping {
    pub id: String,
    pub cloud_lock_id: String,
    pub controller_door_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl DoorMapping {
    pub(crate) fn validate(&self) -> Result<(), MappingError> {
        require("id", &self.id)?;
        require("cloudLockId", &self.cloud_lock_id)?;
        require("controllerDoorId", &self.controller_door_id)?;
        require("name", &self.name)?;
        Ok(())
    }
}

fn require(field: &str, value: &str) -> Result<(), MappingError> {
    if value.trim().is_empty() {
        return Err(MappingError::Validation(format!("{} is required", field)));
    }
    Ok(())
}

/// Input for [`super::MappingService::add_mapping`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMapping {
    /// Generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub cloud_lock_id: String,
    pub controller_door_id: String,
    #[serde(default)]
    pub site_id: Option<String>,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub metadata: Value,
}

impl NewMapping {
    pub fn new(
        cloud_lock_id: impl Into<String>,
        controller_door_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            cloud_lock_id: cloud_lock_id.into(),
            controller_door_id: controller_door_id.into(),
            site_id: None,
            name: name.into(),
            enabled: true,
            metadata: Value::Null,
        }
    }

    #[must_use]
    pub fn with_site(mut self, site_id: impl Into<String>) -> Self {
        self.site_id = Some(site_id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub(crate) fn into_mapping(self, now: DateTime<Utc>) -> DoorMapping {
        DoorMapping {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            cloud_lock_id: self.cloud_lock_id,
            controller_door_id: self.controller_door_id,
            site_id: self.site_id,
            name: self.name,
            enabled: self.enabled,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update. `id`, `cloudLockId` and `createdAt` cannot be changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingUpdate {
    #[serde(default)]
    pub controller_door_id: Option<String>,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl MappingUpdate {
    pub(crate) fn apply(self, mut mapping: DoorMapping, now: DateTime<Utc>) -> DoorMapping {
        if let Some(door) = self.controller_door_id {
            mapping.controller_door_id = door;
        }
        if let Some(site) = self.site_id {
            mapping.site_id = Some(site);
        }
        if let Some(name) = self.name {
            mapping.name = name;
        }
        if let Some(enabled) = self.enabled {
            mapping.enabled = enabled;
        }
        if let Some(metadata) = self.metadata {
            mapping.metadata = metadata;
        }
        mapping.updated_at = now;
        mapping
    }
}

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("invalid mapping: {0}")]
    Validation(String),
    #[error("cloud lock '{0}' is already mapped")]
    DuplicateCloudLock(String),
    #[error("controller door '{0}' is already mapped")]
    DuplicateControllerDoor(String),
    #[error("mapping '{0}' not found")]
    NotFound(String),
    #[error("mapping store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("mapping store is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Change notification from the mapping service.
#[derive(Debug, Clone, PartialEq)]
pub enum MappingEvent {
    Added(DoorMapping),
    Updated { previous: DoorMapping, current: DoorMapping },
    Removed(DoorMapping),
    Imported { count: usize },
    Cleared { count: usize },
}
