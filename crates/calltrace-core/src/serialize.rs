//! Cycle-safe serialization of value graphs
//!
//! Converts a [`TraceValue`] graph into JSON text. The traversal is bounded
//! by a maximum depth and remembers every composite it has entered, so it
//! terminates on self-referential input. It never fails: internal errors
//! produce a small fallback object instead.

use crate::value::{ErrorValue, TraceValue};
use chrono::SecondsFormat;
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Default traversal depth
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Substituted when the depth limit is exceeded
pub const MAX_DEPTH_MARKER: &str = "[Max Depth Reached]";

/// Substituted for a composite that was already visited
pub const CIRCULAR_MARKER: &str = "[Circular Reference]";

/// Substituted for callables
pub const FUNCTION_MARKER: &str = "[Function]";

/// Internal serialization failures (never surfaced to callers)
#[derive(Debug, Error)]
enum SerializeError {
    #[error("value is locked for writing")]
    Locked,

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize with the default depth limit
pub fn serialize(value: &TraceValue) -> String {
    serialize_with_depth(value, DEFAULT_MAX_DEPTH)
}

/// Serialize with an explicit depth limit
pub fn serialize_with_depth(value: &TraceValue, max_depth: usize) -> String {
    let result = to_json_value(value, max_depth)
        .and_then(|json| serde_json::to_string(&json).map_err(SerializeError::from));

    match result {
        Ok(text) => text,
        Err(e) => {
            debug!("Safe serialization fell back: {}", e);
            fallback(&e.to_string())
        }
    }
}

/// Convert to a JSON value using the same rules as [`serialize_with_depth`]
pub fn to_json(value: &TraceValue, max_depth: usize) -> Value {
    to_json_value(value, max_depth).unwrap_or_else(|e| {
        serde_json::json!({
            "error": "Serialization failed",
            "message": e.to_string(),
        })
    })
}

fn fallback(message: &str) -> String {
    // hand-built, cannot fail
    format!(
        r#"{{"error":"Serialization failed","message":{}}}"#,
        Value::String(message.to_string())
    )
}

fn to_json_value(value: &TraceValue, max_depth: usize) -> Result<Value, SerializeError> {
    let mut walker = Walker {
        max_depth,
        seen: HashSet::new(),
    };
    walker.walk(value, 0)
}

struct Walker {
    max_depth: usize,
    seen: HashSet<usize>,
}

impl Walker {
    fn walk(&mut self, value: &TraceValue, depth: usize) -> Result<Value, SerializeError> {
        if depth > self.max_depth {
            return Ok(Value::String(MAX_DEPTH_MARKER.to_string()));
        }

        match value {
            TraceValue::Null => Ok(Value::Null),
            TraceValue::Bool(b) => Ok(Value::Bool(*b)),
            TraceValue::Int(i) => Ok(Value::from(*i)),
            TraceValue::Float(f) => Ok(serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null)),
            TraceValue::String(s) => Ok(Value::String(s.clone())),
            TraceValue::Function(_) => Ok(Value::String(FUNCTION_MARKER.to_string())),
            TraceValue::Date(ts) => Ok(Value::String(
                ts.to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            TraceValue::Error(err) => Ok(error_object(err)),
            TraceValue::Array(items) => {
                if !self.enter(value) {
                    return Ok(Value::String(CIRCULAR_MARKER.to_string()));
                }
                let items = items.try_read().ok_or(SerializeError::Locked)?;
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    out.push(self.walk(item, depth + 1)?);
                }
                Ok(Value::Array(out))
            }
            TraceValue::Object(map) => {
                if !self.enter(value) {
                    return Ok(Value::String(CIRCULAR_MARKER.to_string()));
                }
                let map = map.try_read().ok_or(SerializeError::Locked)?;
                let mut out = Map::new();
                for (key, field) in map.iter() {
                    out.insert(key.clone(), self.walk(field, depth + 1)?);
                }
                Ok(Value::Object(out))
            }
        }
    }

    /// Record a composite; false if it was seen before
    fn enter(&mut self, value: &TraceValue) -> bool {
        match value.identity() {
            Some(id) => self.seen.insert(id),
            None => true,
        }
    }
}

fn error_object(err: &ErrorValue) -> Value {
    serde_json::json!({
        "name": err.name,
        "message": err.message,
        "stack": err.stack,
    })
}
