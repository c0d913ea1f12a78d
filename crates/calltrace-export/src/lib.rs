//! Sinks and transports for calltrace that talk to the outside world

pub mod collector;
pub mod http;
pub mod jsonl;

pub use collector::{CollectorConfig, CollectorSink, CollectorStats};
pub use http::ReqwestTransport;
pub use jsonl::{JsonlSink, JsonlSinkConfig};
