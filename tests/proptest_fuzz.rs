//! Property-based tests (fuzzing) for bridge input handling.
//!
//! Uses proptest to generate random/malformed inputs and verify the bridge
//! never panics, rejects tampered webhooks, and keeps mapping uniqueness.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use serde_json::Value;

use door_bridge::clients::{DoorEvent, DoorEventType};
use door_bridge::events::{EventSink, EventTranslator, QueuedEvent, SinkError, TranslatorConfig};
use door_bridge::mapping::{DoorMapping, MappingError, MappingService, MappingStoreConfig, NewMapping};
use door_bridge::webhook::{compute_signature, SignatureError, WebhookConfig, WebhookVerifier};
use door_bridge::RetryConfig;

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(4, 64, 10, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
            prop::collection::hash_map(".*", inner, 0..10)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn door_event_type_strategy() -> impl Strategy<Value = DoorEventType> {
    prop::sample::select(DoorEventType::ALL.to_vec())
}

fn verifier(secret: &str) -> WebhookVerifier {
    WebhookVerifier::new(WebhookConfig {
        secret: Some(secret.to_string()),
        skip_verification: false,
    })
}

fn scratch_store() -> (tempfile::TempDir, MappingService) {
    let dir = tempfile::TempDir::new().unwrap();
    let service = MappingService::new(MappingStoreConfig::new(dir.path().join("mappings.json")));
    (dir, service)
}

struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn deliver(&self, _item: &QueuedEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

fn sample_mapping() -> DoorMapping {
    let (_dir, service) = scratch_store();
    service.add_mapping(NewMapping::new("lock-1", "door-1", "Front")).unwrap()
}

// =============================================================================
// Webhook Signature Fuzz Tests
// =============================================================================

proptest! {
    /// Verification never panics on arbitrary bodies and header values
    #[test]
    fn fuzz_verify_arbitrary_input(
        body in prop::collection::vec(any::<u8>(), 0..2000),
        signature in prop::option::of(".*"),
    ) {
        let result = verifier("whsec_fuzz").verify(&body, signature.as_deref());
        let _ = result;
    }

    /// A correct signature always verifies, with or without the prefix
    #[test]
    fn prop_valid_signature_verifies(
        secret in "[a-zA-Z0-9_]{1,64}",
        body in prop::collection::vec(any::<u8>(), 0..2000),
        prefixed in any::<bool>(),
    ) {
        let signature = compute_signature(&secret, &body).unwrap();
        let header = if prefixed { format!("sha256={}", signature) } else { signature };
        prop_assert!(verifier(&secret).verify(&body, Some(&header)).is_ok());
    }

    /// Flipping any bit of the body invalidates the signature
    #[test]
    fn prop_tampered_body_rejected(
        body in prop::collection::vec(any::<u8>(), 1..2000),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let signature = compute_signature("whsec_fuzz", &body).unwrap();
        let mut tampered = body.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= flip;

        let result = verifier("whsec_fuzz").verify(&tampered, Some(&signature));
        prop_assert_eq!(result, Err(SignatureError::Mismatch));
    }

    /// Changing any single byte of the signature header invalidates it
    #[test]
    fn prop_tampered_signature_rejected(
        body in prop::collection::vec(any::<u8>(), 0..500),
        index in any::<prop::sample::Index>(),
        replacement in any::<char>(),
    ) {
        let signature = compute_signature("whsec_fuzz", &body).unwrap();
        let i = index.index(signature.len());
        let original = signature.as_bytes()[i] as char;
        prop_assume!(replacement != original);

        let mut tampered = signature.clone();
        tampered.replace_range(i..=i, &replacement.to_string());

        let result = verifier("whsec_fuzz").verify(&body, Some(&tampered));
        prop_assert_eq!(result, Err(SignatureError::Mismatch));
    }

    /// A signature made with another secret is rejected
    #[test]
    fn prop_wrong_secret_rejected(
        body in prop::collection::vec(any::<u8>(), 0..500),
        other in "[a-z]{1,32}",
    ) {
        prop_assume!(other != "whsec_fuzz");
        let signature = compute_signature(&other, &body).unwrap();
        prop_assert!(verifier("whsec_fuzz").verify(&body, Some(&signature)).is_err());
    }
}

// =============================================================================
// Mapping Fuzz Tests
// =============================================================================

proptest! {
    /// Stored mapping deserialization never panics
    #[test]
    fn fuzz_mapping_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let serialized = serde_json::to_vec(&json).unwrap();
        let result: Result<DoorMapping, _> = serde_json::from_slice(&serialized);
        let _ = result;
    }

    /// Cloud lock ids and controller door ids stay unique under any add sequence
    #[test]
    fn prop_mapping_ids_stay_unique(ops in prop::collection::vec((0u8..6, 0u8..6), 1..40)) {
        let (_dir, service) = scratch_store();
        let mut locks = HashSet::new();
        let mut doors = HashSet::new();

        for (lock, door) in ops {
            let lock_id = format!("lock-{}", lock);
            let door_id = format!("door-{}", door);
            let result = service.add_mapping(NewMapping::new(lock_id.clone(), door_id.clone(), "Door"));

            match result {
                Ok(_) => {
                    prop_assert!(locks.insert(lock_id));
                    prop_assert!(doors.insert(door_id));
                }
                Err(MappingError::DuplicateCloudLock(_)) => prop_assert!(locks.contains(&lock_id)),
                Err(MappingError::DuplicateControllerDoor(_)) => prop_assert!(doors.contains(&door_id)),
                Err(other) => prop_assert!(false, "unexpected error: {}", other),
            }
        }

        let listed = service.list();
        prop_assert_eq!(listed.len(), locks.len());
        let unique_locks: HashSet<_> = listed.iter().map(|m| m.cloud_lock_id.clone()).collect();
        let unique_doors: HashSet<_> = listed.iter().map(|m| m.controller_door_id.clone()).collect();
        prop_assert_eq!(unique_locks.len(), listed.len());
        prop_assert_eq!(unique_doors.len(), listed.len());
    }

    /// Blank required fields are always rejected
    #[test]
    fn prop_blank_fields_rejected(blank in "[ \t]{0,4}", which in 0usize..3) {
        let (_dir, service) = scratch_store();
        let mut new = NewMapping::new("lock-1", "door-1", "Front");
        match which {
            0 => new.cloud_lock_id = blank,
            1 => new.controller_door_id = blank,
            _ => new.name = blank,
        }
        let result = service.add_mapping(new);
        prop_assert!(matches!(result, Err(MappingError::Validation(_))));
        prop_assert!(service.is_empty());
    }
}

// =============================================================================
// Retry / Translator Properties
// =============================================================================

proptest! {
    /// Backoff never exceeds the cap and never shrinks between attempts
    #[test]
    fn prop_backoff_monotonic_and_capped(
        initial_ms in 1u64..1000,
        max_ms in 1u64..10_000,
        factor in 1.0f64..4.0,
        attempts in 1usize..64,
    ) {
        let config = RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            factor,
            jitter: 0.0,
        };

        let mut previous = Duration::ZERO;
        for attempt in 1..=attempts {
            let delay = config.base_delay(attempt);
            prop_assert!(delay <= config.max_delay);
            prop_assert!(delay >= previous);
            previous = delay;
        }
    }

    /// Jitter stays within the configured spread
    #[test]
    fn prop_jitter_within_spread(attempt in 1usize..10, jitter in 0.0f64..1.0) {
        let config = RetryConfig { jitter, ..RetryConfig::query() };
        let base = config.base_delay(attempt).as_secs_f64();
        let delay = config.jittered_delay(attempt).as_secs_f64();
        prop_assert!(delay >= base * (1.0 - jitter) - 1e-6);
        prop_assert!(delay <= base * (1.0 + jitter) + 1e-6);
    }

    /// An event is queued once per (lock, type, timestamp) within the window
    #[test]
    fn prop_translator_dedups_repeats(
        events in prop::collection::vec((door_event_type_strategy(), 0u32..5), 1..50),
    ) {
        let translator = EventTranslator::new(TranslatorConfig::default(), Arc::new(NullSink));
        let mapping = sample_mapping();
        let mut seen = HashSet::new();

        for (kind, second) in events {
            let ts = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, second).unwrap();
            let queued = translator.translate_and_queue(&DoorEvent::new("door-1", kind).at(ts), &mapping);
            prop_assert_eq!(queued, seen.insert((kind, second)));
        }

        prop_assert_eq!(translator.queue_len(), seen.len());
        prop_assert!(translator.queue_len() <= translator.config().max_queue_size);
    }
}
