//! Unified event bus — traits for emitting analytics events and for pushing
//! trigger events back into the enrollment path.
//!
//! Modules accept an `Arc<dyn EventSink>` to emit events into the analytics
//! pipeline, and the delivery layer pushes engagement-derived trigger events
//! through an `Arc<dyn TriggerSink>` without depending on the journey crate.

use crate::types::{AnalyticsEvent, EventType, TriggerEvent};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Trait for emitting analytics events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AnalyticsEvent);
}

/// Trait for pushing trigger events into the enrollment path. Implemented by
/// the event ingress; the delivery layer uses it to surface engagement
/// callbacks (opens, clicks) as journey triggers.
pub trait TriggerSink: Send + Sync {
    fn push(&self, event: TriggerEvent);
}

/// No-op sink for tests and modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: AnalyticsEvent) {}
}

impl TriggerSink for NoOpSink {
    fn push(&self, _event: TriggerEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<AnalyticsEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: AnalyticsEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience builder for creating `AnalyticsEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    contact_id: Option<Uuid>,
    journey_id: Option<Uuid>,
    campaign_id: Option<Uuid>,
    enrollment_id: Option<Uuid>,
    detail: Option<String>,
) -> AnalyticsEvent {
    AnalyticsEvent {
        event_id: Uuid::new_v4(),
        event_type,
        contact_id,
        journey_id,
        campaign_id,
        enrollment_id,
        detail,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a no-op trigger sink.
pub fn noop_trigger_sink() -> Arc<dyn TriggerSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
