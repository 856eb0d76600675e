// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Door bridge walkthrough against in-memory collaborators.
//!
//! Demonstrates:
//! 1. Starting the bridge (authenticate, discover and map doors)
//! 2. A cloud unlock command reaching the controller
//! 3. A door event forwarded to the cloud
//! 4. A signed webhook unlock through the HTTP router
//! 5. The controller failing until its circuit breaker opens
//! 6. Health report and metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example bridge_demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tower::ServiceExt;

use door_bridge::clients::{ClientError, DoorEvent, DoorEventType, MemoryCloud, MemoryController, UnlockCommand};
use door_bridge::webhook::compute_signature;
use door_bridge::{BridgeConfig, BridgeService};

const SECRET: &str = "whsec_demo";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "door_bridge=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                door-bridge: Walkthrough                       ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::TempDir::new()?;
    let config = BridgeConfig {
        mappings_path: dir.path().join("door_mappings.json"),
        retry_max_attempts: 1,
        event_processing_delay_ms: 100,
        webhook_secret: Some(SECRET.into()),
        ..Default::default()
    };

    let controller = Arc::new(MemoryController::with_door_ids(&["lobby", "lab", "roof"]));
    let cloud = Arc::new(MemoryCloud::new());
    let bridge = BridgeService::new(config, controller.clone(), cloud.clone())?;

    bridge.start().await?;
    println!("✅ Bridge {} with {} mappings", bridge.state(), bridge.mappings().active_count());
    for mapping in bridge.mappings().list() {
        println!("   {} → {} ({})", mapping.cloud_lock_id, mapping.controller_door_id, mapping.name);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Cloud unlock command
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔓 Cloud asks to unlock door-lobby...");
    cloud.push_unlock(UnlockCommand::new("door-lobby"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("   Controller unlocked: {:?}", controller.unlocked_doors());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Door event forwarding
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🚪 Lab door opened...");
    controller.emit(DoorEvent::new("lab", DoorEventType::Opened));
    tokio::time::sleep(Duration::from_millis(300)).await;
    for (lock_id, event) in cloud.sent_events() {
        println!("   Cloud received {} for {} at {}", serde_json::to_string(&event.event_type)?, lock_id, event.timestamp);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Signed webhook
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📨 Signed webhook for door-roof...");
    let body = serde_json::to_vec(&json!({ "event": "door.unlock", "lock": { "id": "door-roof" } }))?;
    let signature = compute_signature(SECRET, &body).unwrap_or_default();
    let request = Request::builder()
        .method("POST")
        .uri("/webhook/demo")
        .header("x-demo-signature", signature)
        .body(Body::from(body))?;
    let response = bridge.webhook_router().oneshot(request).await?;
    println!("   Webhook answered {}", response.status());

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Controller outage
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n💥 Controller starts timing out...");
    controller.fail_unlocks(Some(ClientError::Timeout));
    for attempt in 1..=6 {
        match bridge.unlock_door("door-lobby").await {
            Ok(_) => println!("   attempt {}: unlocked", attempt),
            Err(e) => println!("   attempt {}: {}", attempt, e),
        }
    }
    println!("   Controller circuit: {}", bridge.circuits().controller.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Health and metrics
    // ─────────────────────────────────────────────────────────────────────────
    bridge.health().check_now().await;
    let report = bridge.health_report();
    println!("\n🩺 Overall health: {}", report.overall);
    for component in &report.components {
        println!("   {:<18} {}", component.name, component.status);
    }
    let stats = bridge.stats();
    println!(
        "   unlocks={} forwarded={} errors={}",
        stats.unlocks_processed, stats.events_forwarded, stats.errors
    );

    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    bridge.stop().await?;
    println!("   Bridge {}", bridge.state());

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        let rendered = match value {
            DebugValue::Counter(v) => format!("{}", v),
            DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                format!("count={} avg={:.4}", count, if count > 0 { sum / count as f64 } else { 0.0 })
            }
        };
        lines.push(format!("{}{} {}", key.name(), label_str, rendered));
    }

    lines.sort();
    println!("\n📊 Metrics:");
    for line in lines {
        println!("   {}", line);
    }
}
