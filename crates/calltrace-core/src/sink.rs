//! Event sinks
//!
//! A sink is the collector boundary. `track` is fire-and-forget: it must
//! not block the caller and must not fail, so sinks that do I/O buffer
//! internally and surface problems through logs and `flush`.

use crate::events::TrackedEvent;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Sink error type
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Client error {status}: {body}")]
    Client { status: u16, body: String },

    #[error("Server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Sink is closed")]
    Closed,

    #[error("Sink configuration error: {0}")]
    Configuration(String),
}

impl SinkError {
    /// Whether a delivery that failed with this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Network(_) | SinkError::Server { .. })
    }
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Destination for tracked events
pub trait EventSink: Send + Sync {
    /// Sink name
    fn name(&self) -> &str;

    /// Hand an event to the sink
    fn track(&self, event: TrackedEvent);

    /// Push out anything buffered
    fn flush(&self) -> SinkResult<()> {
        Ok(())
    }
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn track(&self, event: TrackedEvent) {
        (**self).track(event)
    }

    fn flush(&self) -> SinkResult<()> {
        (**self).flush()
    }
}

// =============================================================================
// MEMORY
// =============================================================================

/// Keeps every event in memory
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<TrackedEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TrackedEvent> {
        self.events.lock().clone()
    }

    /// Event names in arrival order
    pub fn names(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.name.clone()).collect()
    }

    /// Events with the given name
    pub fn named(&self, name: &str) -> Vec<TrackedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
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
}

impl EventSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn track(&self, event: TrackedEvent) {
        self.events.lock().push(event);
    }
}

// =============================================================================
// LOG
// =============================================================================

/// Writes every event to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn track(&self, event: TrackedEvent) {
        let attributes = serde_json::to_string(&event.attributes).unwrap_or_default();
        info!(event = %event.name, %attributes, "tracked");
    }
}

// =============================================================================
// FANOUT
// =============================================================================

/// Delivers every event to each inner sink
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn name(&self) -> &str {
        "fanout"
    }

    fn track(&self, event: TrackedEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.track(event.clone());
            }
            last.track(event);
        }
    }

    /// Flushes every sink; returns the first error
    fn flush(&self) -> SinkResult<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.flush() {
                warn!("Flush of sink {} failed: {}", sink.name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingFlush;

    impl EventSink for FailingFlush {
        fn name(&self) -> &str {
            "failing"
        }

        fn track(&self, _event: TrackedEvent) {}

        fn flush(&self) -> SinkResult<()> {
            Err(SinkError::Closed)
        }
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        sink.track(TrackedEvent::new("a"));
        sink.track(TrackedEvent::new("b"));
        sink.track(TrackedEvent::new("a"));

        assert_eq!(sink.names(), vec!["a", "b", "a"]);
        assert_eq!(sink.named("a").len(), 2);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_fanout_delivers_to_all() {
        let first = Arc::new(MemorySink::new());
        let second = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new()
            .with(first.clone())
            .with(second.clone())
            .with(Arc::new(LogSink));

        fanout.track(TrackedEvent::new("x").with("k", 1));
        assert_eq!(first.len(), 1);
        assert_eq!(second.events()[0].attr("k"), Some(&serde_json::json!(1)));
        assert!(fanout.flush().is_ok());
    }

    #[test]
    fn test_fanout_flush_reports_failure() {
        let memory = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new()
            .with(Arc::new(FailingFlush))
            .with(memory.clone());
        assert!(matches!(fanout.flush(), Err(SinkError::Closed)));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(SinkError::Network("reset".into()).is_retryable());
        assert!(SinkError::Server {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!SinkError::Client {
            status: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(!SinkError::Closed.is_retryable());
    }
}
