//! Event Publisher Adapters
//!
//! Sinks for [`NamespaceEvent`]s: structured log lines, an in-memory
//! recorder for assertions, and a fan-out over several sinks.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn, Level};

use crate::domain::events::NamespaceEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

// =============================================================================
// Logging
// =============================================================================

/// Writes every event as one tracing line. Failure events always go out at
/// `WARN`, regardless of the configured level.
#[derive(Debug, Clone)]
pub struct LoggingEventPublisher {
    level: Level,
}

impl Default for LoggingEventPublisher {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routine events at `level`; anything below `INFO` logs at `DEBUG`.
    pub fn with_level(level: Level) -> Self {
        Self { level }
    }

    fn emit(&self, event: &NamespaceEvent) {
        let kind = event.event_type();
        let namespace = event.namespace();
        let detail = serde_json::to_string(event).unwrap_or_else(|_| format!("{:?}", event));

        if event.is_failure() {
            warn!(event = kind, namespace, %detail, "Namespace event");
        } else if self.level <= Level::INFO {
            info!(event = kind, namespace, %detail, "Namespace event");
        } else {
            debug!(event = kind, namespace, %detail, "Namespace event");
        }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: NamespaceEvent) -> Result<()> {
        self.emit(&event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<NamespaceEvent>) -> Result<()> {
        events.iter().for_each(|e| self.emit(e));
        Ok(())
    }
}

// =============================================================================
// Recorder
// =============================================================================

/// Keeps every event in arrival order; used by tests to assert on the
/// lifecycle a namespace went through.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: Mutex<Vec<NamespaceEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<NamespaceEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Event type names in arrival order.
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.event_type()).collect()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<NamespaceEvent> {
        self.matching(|e| e.event_type() == event_type)
    }

    pub fn events_for(&self, namespace: &str) -> Vec<NamespaceEvent> {
        self.matching(|e| e.namespace() == namespace)
    }

    fn matching(&self, predicate: impl Fn(&NamespaceEvent) -> bool) -> Vec<NamespaceEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: NamespaceEvent) -> Result<()> {
        self.events.lock().push(event);
        Ok(())
    }

    async fn publish_all(&self, mut events: Vec<NamespaceEvent>) -> Result<()> {
        self.events.lock().append(&mut events);
        Ok(())
    }
}

// =============================================================================
// Fan-out
// =============================================================================

/// Delivers each event to every sink. A failing sink does not stop delivery
/// to the others; the first error is returned once all were tried.
#[derive(Default, Clone)]
pub struct CompositeEventPublisher {
    sinks: Vec<Arc<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher(mut self, sink: Arc<dyn EventPublisher>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl std::fmt::Debug for CompositeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventPublisher")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for CompositeEventPublisher {
    async fn publish(&self, event: NamespaceEvent) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event.clone()).await {
                warn!(event = event.event_type(), "Event sink failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn publish_all(&self, events: Vec<NamespaceEvent>) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish_all(events.clone()).await {
                warn!(events = events.len(), "Event sink failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
