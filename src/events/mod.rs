// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Physical door events on their way to the cloud service.

mod translator;
mod types;

pub use translator::{
    BatchOutcome, EventSink, EventTranslator, SinkError, TranslatorConfig, TranslatorStats,
};
pub use types::{event_id, CloudEventType, DoorState, QueuedEvent, TranslatedEvent};
