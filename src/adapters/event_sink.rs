//! Event Sink Adapters
//!
//! Implements the `EventSink` port with various backends.

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::domain::events::TopologyEvent;
use crate::domain::ports::EventSink;

/// Logging-based event sink.
///
/// Writes topology events to the tracing system.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventSink {
    /// Whether to log events at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink that logs at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }
}

impl EventSink for LoggingEventSink {
    fn publish(&self, event: TopologyEvent) {
        let event_type = event.event_type();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        if self.info_level {
            info!(event_type = %event_type, event = %json, "Topology event");
        } else {
            debug!(event_type = %event_type, event = %json, "Topology event");
        }
    }
}

/// In-memory event collector for tests and the simulator report.
#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    events: RwLock<Vec<TopologyEvent>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TopologyEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Get events of a specific type.
    pub fn events_of_type(&self, event_type: &str) -> Vec<TopologyEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    pub fn count_by_type(&self, event_type: &str) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

impl EventSink for InMemoryEventSink {
    fn publish(&self, event: TopologyEvent) {
        self.events.write().push(event);
    }
}

/// Fans every event out to several sinks.
#[derive(Default)]
pub struct CompositeEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: std::sync::Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl std::fmt::Debug for CompositeEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventSink")
            .field("sink_count", &self.sinks.len())
            .finish()
    }
}

impl EventSink for CompositeEventSink {
    fn publish(&self, event: TopologyEvent) {
        for sink in &self.sinks {
            sink.publish(event.clone());
        }
    }
}
