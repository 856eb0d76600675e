// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deduplicating, bounded event queue drained on a timer.
//!
//! # Architecture
//!
//! ```text
//! DoorEvent ──► translate_and_queue ──► dedup window ──► VecDeque (bounded)
//!                                                            │
//!                                 every processing_delay     ▼
//!                                 ┌──────────── process_batch (≤ batch_size, FIFO)
//!                                 │                          │
//!                                 ▼                          ▼
//!                        EventSink::deliver ── Err ──► back of queue (attempts += 1)
//!                                                          │
//!                                              attempts ≥ max ──► dropped
//! ```
//!
//! Delivery failures are reported through the `Result` returned by the sink.
//! Retried items go to the back of the queue, so ordering is only FIFO within
//! a single tick.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::types::{event_id, QueuedEvent, TranslatedEvent};
use crate::clients::{ClientError, DoorEvent};
use crate::mapping::DoorMapping;

/// Expired dedup marks are swept every this many new marks.
const PRUNE_EVERY: u64 = 64;

/// Why a sink could not deliver an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("cloud circuit open")]
    CircuitOpen,
    #[error("cloud refused event")]
    Refused,
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("{0}")]
    Other(String),
}

/// Consumer of ready events. `Err` puts the event back in the queue.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &QueuedEvent) -> Result<(), SinkError>;
}

/// Configuration for [`EventTranslator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatorConfig {
    /// Repeats of the same `(lock, type, timestamp)` inside this window are dropped
    pub dedup_window: Duration,
    /// Queue capacity; the oldest 10% is evicted when full
    pub max_queue_size: usize,
    /// Interval between drain ticks
    pub processing_delay: Duration,
    /// Events drained per tick
    pub batch_size: usize,
    /// Delivery attempts before an event is dropped
    pub max_attempts: u32,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(5),
            max_queue_size: 1000,
            processing_delay: Duration::from_secs(1),
            batch_size: 10,
            max_attempts: 3,
        }
    }
}

/// Counters snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslatorStats {
    pub queued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub evicted: u64,
    pub duplicates: u64,
    pub queue_length: usize,
    pub running: bool,
}

/// Result of one drain tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub delivered: usize,
    pub requeued: usize,
    pub dropped: usize,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
    duplicates: AtomicU64,
}

struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    config: TranslatorConfig,
    sink: Arc<dyn EventSink>,
    queue: Mutex<VecDeque<QueuedEvent>>,
    processed: DashMap<String, Instant>,
    marks: AtomicU64,
    counters: Counters,
    /// One drain at a time, whether from the timer or a direct call.
    processing: tokio::sync::Mutex<()>,
    worker: Mutex<Option<Worker>>,
}

impl Inner {
    fn push(&self, event: QueuedEvent) {
        let max = self.config.max_queue_size.max(1);
        let depth = {
            let mut queue = self.queue.lock();
            if queue.len() >= max {
                let evict = (max / 10).max(1).min(queue.len());
                queue.drain(..evict);
                self.counters.evicted.fetch_add(evict as u64, Ordering::Relaxed);
                crate::metrics::record_event("evicted", evict);
                warn!(evicted = evict, max_queue_size = max, "Event queue full, evicted oldest events");
            }
            queue.push_back(event);
            queue.len()
        };
        crate::metrics::set_event_queue_depth(depth);
    }

    fn prune_processed(&self) {
        let window = self.config.dedup_window;
        self.processed.retain(|_, marked| marked.elapsed() < window);
    }

    async fn process_batch(&self) -> BatchOutcome {
        let _guard = self.processing.lock().await;
        self.prune_processed();

        let batch: Vec<QueuedEvent> = {
            let mut queue = self.queue.lock();
            let n = self.config.batch_size.max(1).min(queue.len());
            queue.drain(..n).collect()
        };

        let mut outcome = BatchOutcome::default();
        for mut item in batch {
            match self.sink.deliver(&item).await {
                Ok(()) => {
                    outcome.delivered += 1;
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(id = %item.id, lock = %item.event.lock_id, "Event delivered");
                }
                Err(e) => {
                    item.attempts += 1;
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    if item.attempts >= self.config.max_attempts {
                        outcome.dropped += 1;
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            id = %item.id,
                            lock = %item.event.lock_id,
                            attempts = item.attempts,
                            error = %e,
                            "Dropping event after repeated delivery failures"
                        );
                    } else {
                        outcome.requeued += 1;
                        debug!(id = %item.id, attempts = item.attempts, error = %e, "Event delivery failed, requeued");
                        self.push(item);
                    }
                }
            }
        }

        if outcome.delivered > 0 {
            crate::metrics::record_event("delivered", outcome.delivered);
        }
        if outcome.requeued > 0 {
            crate::metrics::record_event("failed", outcome.requeued);
        }
        if outcome.dropped > 0 {
            crate::metrics::record_event("dropped", outcome.dropped);
        }
        crate::metrics::set_event_queue_depth(self.queue.lock().len());
        outcome
    }
}

/// Physical → cloud event pipeline.
///
/// Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct EventTranslator {
    inner: Arc<Inner>,
}

impl EventTranslator {
    pub fn new(config: TranslatorConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                queue: Mutex::new(VecDeque::new()),
                processed: DashMap::new(),
                marks: AtomicU64::new(0),
                counters: Counters::default(),
                processing: tokio::sync::Mutex::new(()),
                worker: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &TranslatorConfig {
        &self.inner.config
    }

    /// Translate `event` through `mapping` and queue it.
    ///
    /// Returns `false` when the same event was already seen within the
    /// deduplication window.
    pub fn translate_and_queue(&self, event: &DoorEvent, mapping: &DoorMapping) -> bool {
        let id = event_id(&mapping.cloud_lock_id, event.event_type, &event.timestamp);
        let now = Instant::now();

        match self.inner.processed.entry(id.clone()) {
            Entry::Occupied(mut marked) => {
                if now.duration_since(*marked.get()) < self.inner.config.dedup_window {
                    self.inner.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_event("duplicate", 1);
                    debug!(id = %id, "Duplicate door event suppressed");
                    return false;
                }
                marked.insert(now);
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
            }
        }

        // Marks also accumulate while the drain timer is stopped
        if (self.inner.marks.fetch_add(1, Ordering::Relaxed) + 1) % PRUNE_EVERY == 0 {
            self.inner.prune_processed();
        }

        let queued = QueuedEvent {
            event: TranslatedEvent::from_door_event(event, mapping),
            source: event.clone(),
            mapping: mapping.clone(),
            enqueued_at: Utc::now(),
            attempts: 0,
            id,
        };
        debug!(id = %queued.id, lock = %queued.event.lock_id, "Door event queued");
        self.inner.push(queued);
        self.inner.counters.queued.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_event("queued", 1);
        true
    }

    /// Drain one batch now.
    pub async fn process_batch(&self) -> BatchOutcome {
        self.inner.process_batch().await
    }

    /// Start the drain timer. No-op if already running.
    pub fn start(&self) {
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            return;
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let delay = self.inner.config.processing_delay;

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + delay, delay);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        inner.process_batch().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        *worker = Some(Worker { shutdown, handle });
        info!(
            delay_ms = delay.as_millis() as u64,
            batch_size = self.inner.config.batch_size,
            "Event translator started"
        );
    }

    /// Stop the drain timer and forget processed ids.
    ///
    /// Queued events stay in memory and resume draining on the next start.
    pub async fn stop(&self) {
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(true);
            if let Err(e) = worker.handle.await {
                warn!(error = %e, "Event translator task ended abnormally");
            }
        }
        self.inner.processed.clear();
        info!(pending = self.queue_len(), "Event translator stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.worker.lock().is_some()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Fraction of queue capacity in use (0.0 to 1.0).
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.queue_len() as f64 / self.inner.config.max_queue_size.max(1) as f64
    }

    /// Discard every queued event. Returns how many were discarded.
    pub fn clear_queue(&self) -> usize {
        let cleared = {
            let mut queue = self.inner.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        crate::metrics::set_event_queue_depth(0);
        if cleared > 0 {
            warn!(cleared, "Event queue cleared");
        }
        cleared
    }

    #[must_use]
    pub fn stats(&self) -> TranslatorStats {
        let c = &self.inner.counters;
        TranslatorStats {
            queued: c.queued.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            queue_length: self.queue_len(),
            running: self.is_running(),
        }
    }
}
