//! Dynamic value graph for payloads and diagnostics
//!
//! Request bodies, response bodies and error details are carried as
//! [`TraceValue`]s. Composite values are shared handles, so a graph may
//! contain the same object more than once or even refer back to itself.
//! The safe serializer in [`crate::serialize`] is the only sanctioned way to
//! turn such a graph into text.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared, mutable array
pub type SharedArray = Arc<RwLock<Vec<TraceValue>>>;

/// Shared, mutable object (keys are kept sorted)
pub type SharedObject = Arc<RwLock<BTreeMap<String, TraceValue>>>;

/// A node in a payload graph
#[derive(Debug, Clone, Default)]
pub enum TraceValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Point in time, rendered as RFC 3339
    Date(DateTime<Utc>),
    /// Captured error
    Error(ErrorValue),
    /// Opaque callable, rendered as a marker
    Function(String),
    Array(SharedArray),
    Object(SharedObject),
}

/// Error details captured into a value graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Capture a Rust error; the source chain becomes the stack
    pub fn from_error(name: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {}", cause));
            source = cause.source();
        }

        Self {
            name: name.into(),
            message: err.to_string(),
            stack: if chain.is_empty() {
                None
            } else {
                Some(chain.join("\n"))
            },
        }
    }
}

impl TraceValue {
    /// Create an empty shared object
    pub fn object() -> Self {
        TraceValue::Object(Arc::new(RwLock::new(BTreeMap::new())))
    }

    /// Create an empty shared array
    pub fn array() -> Self {
        TraceValue::Array(Arc::new(RwLock::new(Vec::new())))
    }

    pub fn string(value: impl Into<String>) -> Self {
        TraceValue::String(value.into())
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        TraceValue::Error(ErrorValue::new(name, message))
    }

    pub fn function(name: impl Into<String>) -> Self {
        TraceValue::Function(name.into())
    }

    /// Insert a field into an object. Returns false if this is not an object.
    pub fn insert(&self, key: impl Into<String>, value: TraceValue) -> bool {
        match self {
            TraceValue::Object(map) => {
                map.write().insert(key.into(), value);
                true
            }
            _ => false,
        }
    }

    /// Append to an array. Returns false if this is not an array.
    pub fn push(&self, value: TraceValue) -> bool {
        match self {
            TraceValue::Array(items) => {
                items.write().push(value);
                true
            }
            _ => false,
        }
    }

    /// Look up a field of an object
    pub fn get(&self, key: &str) -> Option<TraceValue> {
        match self {
            TraceValue::Object(map) => map.read().get(key).cloned(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TraceValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Identity of a composite value, used for cycle detection
    pub(crate) fn identity(&self) -> Option<usize> {
        match self {
            TraceValue::Array(items) => Some(Arc::as_ptr(items) as *const () as usize),
            TraceValue::Object(map) => Some(Arc::as_ptr(map) as *const () as usize),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for TraceValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => TraceValue::Null,
            serde_json::Value::Bool(b) => TraceValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    TraceValue::Int(i)
                } else {
                    TraceValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => TraceValue::String(s),
            serde_json::Value::Array(items) => TraceValue::Array(Arc::new(RwLock::new(
                items.into_iter().map(TraceValue::from).collect(),
            ))),
            serde_json::Value::Object(map) => TraceValue::Object(Arc::new(RwLock::new(
                map.into_iter()
                    .map(|(k, v)| (k, TraceValue::from(v)))
                    .collect(),
            ))),
        }
    }
}

impl From<&str> for TraceValue {
    fn from(value: &str) -> Self {
        TraceValue::String(value.to_string())
    }
}

impl From<String> for TraceValue {
    fn from(value: String) -> Self {
        TraceValue::String(value)
    }
}

impl From<bool> for TraceValue {
    fn from(value: bool) -> Self {
        TraceValue::Bool(value)
    }
}

impl From<i64> for TraceValue {
    fn from(value: i64) -> Self {
        TraceValue::Int(value)
    }
}

impl From<f64> for TraceValue {
    fn from(value: f64) -> Self {
        TraceValue::Float(value)
    }
}

impl From<DateTime<Utc>> for TraceValue {
    fn from(value: DateTime<Utc>) -> Self {
        TraceValue::Date(value)
    }
}

impl From<ErrorValue> for TraceValue {
    fn from(value: ErrorValue) -> Self {
        TraceValue::Error(value)
    }
}
