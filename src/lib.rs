//! # Door Bridge
//!
//! Orchestration and resilience core for a door-access bridge between a local
//! door controller and a cloud smart-lock service.
//!
//! ## Architecture
//!
//! ```text
//!     Cloud service                                  Door controller
//!  ┌──────────────────┐                           ┌──────────────────┐
//!  │ unlock commands  │──┐                     ┌──│ door events      │
//!  │ signed webhooks  │  │                     │  │ door discovery   │
//!  └──────────────────┘  │                     │  └──────────────────┘
//!            ▲           ▼                     ▼            ▲
//!            │   ┌─────────────────────────────────────┐    │
//!            │   │            BridgeService            │    │
//!            │   │  • MappingService (lock ↔ door)     │    │
//!            │   │  • Retry + CircuitBreaker per dep   │────┘ unlock
//!            └───│  • EventTranslator (dedup, queue)   │
//!   translated   │  • HealthMonitor (probes)           │
//!     events     │  • Webhook router (HMAC-SHA256)     │
//!                └─────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use door_bridge::{BridgeConfig, BridgeService};
//! use door_bridge::clients::{MemoryCloud, MemoryController};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = BridgeConfig {
//!         webhook_secret: Some("whsec_123".into()),
//!         ..Default::default()
//!     };
//!
//!     let controller = Arc::new(MemoryController::with_door_ids(&["d1"]));
//!     let cloud = Arc::new(MemoryCloud::new());
//!     let bridge = BridgeService::new(config, controller, cloud).expect("invalid config");
//!
//!     bridge.start().await.expect("Failed to start");
//!
//!     // Serve signed webhooks next to the bridge
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let router = bridge.webhook_router();
//!     tokio::spawn(door_bridge::webhook::serve(listener, router, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }));
//!
//!     bridge.unlock_door("door-d1").await.expect("unlock failed");
//!     bridge.stop().await.expect("Failed to stop");
//! }
//! ```
//!
//! ## Modules
//!
//! - [`bridge`]: The main [`BridgeService`] orchestrating all components
//! - [`clients`]: Collaborator traits plus in-memory implementations
//! - [`mapping`]: Persisted door ↔ lock mappings
//! - [`events`]: Door event translation, dedup and delivery queue
//! - [`health`]: Periodic component probes
//! - [`resilience`]: Circuit breakers and retry logic
//! - [`webhook`]: Signature verification and HTTP surface

pub mod bridge;
pub mod clients;
pub mod config;
pub mod events;
pub mod health;
pub mod mapping;
pub mod metrics;
pub mod resilience;
pub mod webhook;

pub use bridge::{BridgeError, BridgeEvent, BridgeService, BridgeStats, HealthReport, ServiceState};
pub use clients::{ClientError, CloudClient, ControllerClient};
pub use config::BridgeConfig;
pub use events::{EventTranslator, TranslatedEvent};
pub use health::{HealthMonitor, HealthStatus};
pub use mapping::{DoorMapping, MappingService};
pub use metrics::LatencyTimer;
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
pub use resilience::retry::RetryConfig;
pub use webhook::WebhookVerifier;
