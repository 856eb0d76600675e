// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory collaborators.
//!
//! Used by tests, the demo, and for dry runs without real hardware. Every call
//! is counted and failures can be scripted per operation.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

use super::traits::{ClientError, CloudClient, ControllerClient, Door, DoorEvent, UnlockCommand};
use crate::events::TranslatedEvent;
use crate::mapping::DoorMapping;

const CHANNEL_CAPACITY: usize = 256;

/// In-memory door controller.
pub struct MemoryController {
    doors: Mutex<Vec<Door>>,
    events: broadcast::Sender<DoorEvent>,
    unlocked: Mutex<Vec<String>>,
    unlock_calls: AtomicU64,
    auth_calls: AtomicU64,
    auth_failure: Mutex<Option<ClientError>>,
    discover_failure: Mutex<Option<ClientError>>,
    unlock_failure: Mutex<Option<ClientError>>,
    refuse_unlocks: Mutex<bool>,
    ping_failure: Mutex<Option<ClientError>>,
}

impl Default for MemoryController {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MemoryController {
    pub fn new(doors: Vec<Door>) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            doors: Mutex::new(doors),
            events,
            unlocked: Mutex::new(Vec::new()),
            unlock_calls: AtomicU64::new(0),
            auth_calls: AtomicU64::new(0),
            auth_failure: Mutex::new(None),
            discover_failure: Mutex::new(None),
            unlock_failure: Mutex::new(None),
            refuse_unlocks: Mutex::new(false),
            ping_failure: Mutex::new(None),
        }
    }

    /// Controller exposing doors `ids` named "Door <id>".
    pub fn with_door_ids(ids: &[&str]) -> Self {
        Self::new(ids.iter().map(|id| Door::new(*id, format!("Door {}", id))).collect())
    }

    pub fn add_door(&self, door: Door) {
        self.doors.lock().push(door);
    }

    /// Push a door event to every subscriber. Returns the number of receivers.
    pub fn emit(&self, event: DoorEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }

    pub fn fail_auth(&self, error: Option<ClientError>) {
        *self.auth_failure.lock() = error;
    }

    pub fn fail_discovery(&self, error: Option<ClientError>) {
        *self.discover_failure.lock() = error;
    }

    /// Every unlock returns this error until cleared with `None`.
    pub fn fail_unlocks(&self, error: Option<ClientError>) {
        *self.unlock_failure.lock() = error;
    }

    /// Unlocks answer `Ok(false)` while set.
    pub fn refuse_unlocks(&self, refuse: bool) {
        *self.refuse_unlocks.lock() = refuse;
    }

    pub fn fail_ping(&self, error: Option<ClientError>) {
        *self.ping_failure.lock() = error;
    }

    #[must_use]
    pub fn unlock_calls(&self) -> u64 {
        self.unlock_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn auth_calls(&self) -> u64 {
        self.auth_calls.load(Ordering::SeqCst)
    }

    /// Door ids successfully unlocked, in order.
    #[must_use]
    pub fn unlocked_doors(&self) -> Vec<String> {
        self.unlocked.lock().clone()
    }
}

#[async_trait]
impl ControllerClient for MemoryController {
    async fn authenticate(&self) -> Result<(), ClientError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        match self.auth_failure.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn discover_doors(&self) -> Result<Vec<Door>, ClientError> {
        if let Some(e) = self.discover_failure.lock().clone() {
            return Err(e);
        }
        Ok(self.doors.lock().clone())
    }

    async fn unlock(&self, door_id: &str) -> Result<bool, ClientError> {
        self.unlock_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.unlock_failure.lock().clone() {
            return Err(e);
        }
        if *self.refuse_unlocks.lock() {
            return Ok(false);
        }
        if !self.doors.lock().iter().any(|d| d.id == door_id) {
            return Err(ClientError::Rejected(format!("unknown door {}", door_id)));
        }
        self.unlocked.lock().push(door_id.to_string());
        Ok(true)
    }

    fn subscribe_events(&self) -> Option<broadcast::Receiver<DoorEvent>> {
        Some(self.events.subscribe())
    }

    async fn ping(&self) -> Result<(), ClientError> {
        match self.ping_failure.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// In-memory cloud service.
pub struct MemoryCloud {
    commands: broadcast::Sender<UnlockCommand>,
    registered: Mutex<Vec<String>>,
    monitored: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(String, TranslatedEvent)>>,
    send_calls: AtomicU64,
    auth_failure: Mutex<Option<ClientError>>,
    registration_failures: Mutex<HashMap<String, ClientError>>,
    send_failure: Mutex<Option<ClientError>>,
    ping_failure: Mutex<Option<ClientError>>,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        let (commands, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            commands,
            registered: Mutex::new(Vec::new()),
            monitored: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            send_calls: AtomicU64::new(0),
            auth_failure: Mutex::new(None),
            registration_failures: Mutex::new(HashMap::new()),
            send_failure: Mutex::new(None),
            ping_failure: Mutex::new(None),
        }
    }

    /// Push an unlock command to every subscriber. Returns the number of receivers.
    pub fn push_unlock(&self, command: UnlockCommand) -> usize {
        self.commands.send(command).unwrap_or(0)
    }

    pub fn fail_auth(&self, error: Option<ClientError>) {
        *self.auth_failure.lock() = error;
    }

    /// Registration of this lock id fails with `error`.
    pub fn fail_registration(&self, lock_id: impl Into<String>, error: ClientError) {
        self.registration_failures.lock().insert(lock_id.into(), error);
    }

    pub fn fail_sends(&self, error: Option<ClientError>) {
        *self.send_failure.lock() = error;
    }

    pub fn fail_ping(&self, error: Option<ClientError>) {
        *self.ping_failure.lock() = error;
    }

    #[must_use]
    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().clone()
    }

    #[must_use]
    pub fn is_monitoring(&self, lock_id: &str) -> bool {
        self.monitored.lock().contains(lock_id)
    }

    /// Events delivered so far, in delivery order.
    #[must_use]
    pub fn sent_events(&self) -> Vec<(String, TranslatedEvent)> {
        self.sent.lock().clone()
    }

    #[must_use]
    pub fn send_calls(&self) -> u64 {
        self.send_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudClient for MemoryCloud {
    async fn authenticate(&self) -> Result<(), ClientError> {
        match self.auth_failure.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn register_door(&self, mapping: &DoorMapping) -> Result<bool, ClientError> {
        if let Some(e) = self.registration_failures.lock().get(&mapping.cloud_lock_id) {
            return Err(e.clone());
        }
        self.registered.lock().push(mapping.cloud_lock_id.clone());
        Ok(true)
    }

    async fn start_door(&self, lock_id: &str) -> Result<bool, ClientError> {
        Ok(self.monitored.lock().insert(lock_id.to_string()))
    }

    async fn stop_door(&self, lock_id: &str) -> Result<bool, ClientError> {
        Ok(self.monitored.lock().remove(lock_id))
    }

    async fn send_door_event(&self, lock_id: &str, event: &TranslatedEvent) -> Result<bool, ClientError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.send_failure.lock().clone() {
            return Err(e);
        }
        self.sent.lock().push((lock_id.to_string(), event.clone()));
        Ok(true)
    }

    fn subscribe_unlock_commands(&self) -> Option<broadcast::Receiver<UnlockCommand>> {
        Some(self.commands.subscribe())
    }

    async fn ping(&self) -> Result<(), ClientError> {
        match self.ping_failure.lock().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_controller_unlocks_known_doors() {
        let controller = MemoryController::with_door_ids(&["d1", "d2"]);

        assert!(controller.unlock("d1").await.unwrap());
        assert!(controller.unlock("d9").await.is_err());
        assert_eq!(controller.unlock_calls(), 2);
        assert_eq!(controller.unlocked_doors(), vec!["d1".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_controller_scripted_failures() {
        let controller = MemoryController::with_door_ids(&["d1"]);

        controller.fail_unlocks(Some(ClientError::Timeout));
        assert_eq!(controller.unlock("d1").await, Err(ClientError::Timeout));

        controller.fail_unlocks(None);
        controller.refuse_unlocks(true);
        assert_eq!(controller.unlock("d1").await, Ok(false));
    }

    #[tokio::test]
    async fn test_memory_controller_emits_to_subscribers() {
        let controller = MemoryController::default();
        let mut rx = controller.subscribe_events().unwrap();

        let delivered = controller.emit(DoorEvent::new("d1", crate::clients::DoorEventType::Opened));
        assert_eq!(delivered, 1);
        assert_eq!(rx.recv().await.unwrap().door_id, "d1");
    }

    #[tokio::test]
    async fn test_memory_cloud_monitoring_toggles() {
        let cloud = MemoryCloud::new();

        assert!(cloud.start_door("L1").await.unwrap());
        assert!(cloud.is_monitoring("L1"));
        assert!(cloud.stop_door("L1").await.unwrap());
        assert!(!cloud.is_monitoring("L1"));
    }
}
