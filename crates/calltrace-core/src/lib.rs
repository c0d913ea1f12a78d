//! Calltrace Core - request tracing for outbound API calls
//!
//! This crate provides the building blocks of the tracer:
//!
//! - **Identity**: session and trace ids, with optional persistence
//! - **Interceptor**: wraps a transport and reports each call's lifecycle
//! - **Classifier**: derives business events from the shape of a call
//! - **Serializer**: JSON rendering that survives cycles and deep nesting
//! - **Sinks**: destinations for tracked events

pub mod classify;
pub mod config;
pub mod endpoints;
pub mod events;
pub mod identity;
pub mod interceptor;
pub mod metrics;
pub mod request;
pub mod serialize;
pub mod sink;
pub mod storage;
pub mod tracker;
pub mod transport;
pub mod value;

// Re-export commonly used types
pub use classify::classify;
pub use config::{ConfigError, ConfigLoader, ConfigResult, TracerConfig};
pub use endpoints::EndpointFilter;
pub use events::{Attributes, BusinessEvent, BusinessEventType, TrackedEvent};
pub use identity::{IdentityInfo, IdentityStore};
pub use interceptor::{CallPhase, TraceInterceptor};
pub use metrics::InterceptorMetrics;
pub use request::{ApiRequest, ApiResponse, RequestBody};
pub use serialize::{serialize, serialize_with_depth};
pub use sink::{EventSink, FanoutSink, LogSink, MemorySink, SinkError, SinkResult};
pub use storage::{FileStorage, MemoryStorage, SessionStorage};
pub use tracker::{CallRecord, CallStatus, CallTracker};
pub use transport::{ErrorKind, Transport, TransportError, TransportResult};
pub use value::{ErrorValue, TraceValue};

/// Tracer version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
