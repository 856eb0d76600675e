// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! JSON file backing the mapping service.
//!
//! Written as a bare array. Read as either an array or `{"mappings": [...]}`.
//! Writes go to a sibling temp file that is renamed over the target, so a
//! crash mid-write never leaves a truncated store behind.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::types::{DoorMapping, MappingError};

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredMappings {
    List(Vec<DoorMapping>),
    Wrapped { mappings: Vec<DoorMapping> },
}

#[derive(Debug, Clone)]
pub struct MappingFile {
    path: PathBuf,
}

impl MappingFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every stored mapping. A missing or empty file is an empty store.
    pub async fn load(&self) -> Result<Vec<DoorMapping>, MappingError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No mapping store on disk, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        let mappings = match serde_json::from_slice::<StoredMappings>(&bytes)? {
            StoredMappings::List(list) => list,
            StoredMappings::Wrapped { mappings } => mappings,
        };
        debug!(path = %self.path.display(), count = mappings.len(), "Mapping store read");
        Ok(mappings)
    }

    pub async fn save(&self, mappings: &[DoorMapping]) -> Result<(), MappingError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_vec_pretty(mappings)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), count = mappings.len(), bytes = json.len(), "Mapping store written");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(id: &str, lock: &str, door: &str) -> serde_json::Value {
        json!({
            "id": id,
            "cloudLockId": lock,
            "controllerDoorId": door,
            "name": format!("Door {}", door),
            "enabled": true,
            "metadata": {},
            "createdAt": "2026-01-01T00:00:00Z",
            "updatedAt": "2026-01-01T00:00:00Z"
        })
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_store() {
        let dir = tempdir().unwrap();
        let file = MappingFile::new(dir.path().join("nope.json"));

        assert!(file.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reads_bare_array() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json");
        std::fs::write(&path, json!([record("m1", "L1", "d1")]).to_string()).unwrap();

        let loaded = MappingFile::new(&path).load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].cloud_lock_id, "L1");
    }

    #[tokio::test]
    async fn test_reads_wrapped_object() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json");
        let doc = json!({"mappings": [record("m1", "L1", "d1"), record("m2", "L2", "d2")]});
        std::fs::write(&path, doc.to_string()).unwrap();

        let loaded = MappingFile::new(&path).load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].controller_door_id, "d2");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = MappingFile::new(&path).load().await.unwrap_err();
        assert!(matches!(err, MappingError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_save_creates_parent_and_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("m.json");
        let file = MappingFile::new(&path);
        let mapping: DoorMapping = serde_json::from_value(record("m1", "L1", "d1")).unwrap();

        file.save(&[mapping.clone()]).await.unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("nested").join("m.json.tmp").exists());
        assert_eq!(file.load().await.unwrap(), vec![mapping]);
    }
}
