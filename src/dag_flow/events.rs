//! Event system for DAG Flow
//!
//! Provides typed event emission for runtime events

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::node::NodeType;

/// Runtime event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RuntimeEvent {
    StepStarted {
        step_id: String,
        node_type: NodeType,
    },
    StepCompleted {
        step_id: String,
        duration_ms: u64,
    },
    StepFailed {
        step_id: String,
        error: String,
    },
    StepSkipped {
        step_id: String,
    },
    CacheHit {
        step_id: String,
        cache_key: String,
    },
    NodesInjected {
        parent_id: String,
        node_ids: Vec<String>,
        replan: bool,
    },
}

/// Event envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeEventEnvelope {
    pub version: u32,
    pub sequence: u64,
    pub run_id: String,
    pub timestamp: u64,
    pub event: RuntimeEvent,
}

impl RuntimeEventEnvelope {
    pub fn new(run_id: &str, event: RuntimeEvent) -> Self {
        Self {
            version: 1,
            sequence: next_sequence(),
            run_id: run_id.to_string(),
            timestamp: now_ms(),
            event,
        }
    }
}

/// Event sink trait for emitting events
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: &RuntimeEventEnvelope);
}

/// A simple logging event sink
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, envelope: &RuntimeEventEnvelope) {
        tracing::debug!(run_id = %envelope.run_id, seq = envelope.sequence, "Event: {:?}", envelope.event);
    }
}

/// A buffering event sink that collects events
#[derive(Default)]
pub struct BufferingEventSink {
    events: Arc<RwLock<Vec<RuntimeEventEnvelope>>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<RuntimeEventEnvelope> {
        self.events.read().clone()
    }

    pub fn events_only(&self) -> Vec<RuntimeEvent> {
        self.events.read().iter().map(|e| e.event.clone()).collect()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, envelope: &RuntimeEventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

/// Global sequence counter for events
static EVENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub fn next_sequence() -> u64 {
    EVENT_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// Current timestamp in milliseconds
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffering_sink() {
        let sink = BufferingEventSink::new();
        sink.emit(&RuntimeEventEnvelope::new(
            "run",
            RuntimeEvent::StepSkipped { step_id: "a".into() },
        ));
        sink.emit(&RuntimeEventEnvelope::new(
            "run",
            RuntimeEvent::StepSkipped { step_id: "b".into() },
        ));
        let events = sink.get_events();
        assert_eq!(events.len(), 2);
        assert!(events[0].sequence < events[1].sequence);
        sink.clear();
        assert!(sink.events_only().is_empty());
    }
}
