//! Event types handed to sinks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flat attribute map attached to every tracked event
pub type Attributes = BTreeMap<String, serde_json::Value>;

// Lifecycle event names
pub const API_CALL_START: &str = "api_call_start";
pub const API_CALL_SUCCESS: &str = "api_call_success";
pub const API_CALL_ERROR: &str = "api_call_error";
pub const API_CALL_COMPLETE: &str = "api_call_complete";
pub const NETWORK_ERROR: &str = "network_error";
pub const PERFORMANCE_METRIC: &str = "performance_metric";

/// An event as it reaches the collector boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEvent {
    pub name: String,
    pub attributes: Attributes,
    pub timestamp: DateTime<Utc>,
}

impl TrackedEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Attributes::new(),
            timestamp: Utc::now(),
        }
    }

    /// Add an attribute
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Add an attribute if present
    pub fn with_opt(self, key: &str, value: Option<impl Into<serde_json::Value>>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    pub fn attr(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

/// Domain-level event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessEventType {
    Search,
    ProductView,
    CartAdd,
    PurchaseComplete,
}

impl BusinessEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessEventType::Search => "search",
            BusinessEventType::ProductView => "product_view",
            BusinessEventType::CartAdd => "cart_add",
            BusinessEventType::PurchaseComplete => "purchase_complete",
        }
    }
}

impl std::fmt::Display for BusinessEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A business event derived from the shape of an API call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessEvent {
    pub event_type: BusinessEventType,
    pub data: Attributes,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl BusinessEvent {
    pub fn new(event_type: BusinessEventType, data: Attributes) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Flatten into a tracked event named after the event type
    pub fn into_tracked(self) -> TrackedEvent {
        let mut attributes = self.data;
        if let Some(session_id) = self.session_id {
            attributes.insert("session_id".to_string(), session_id.into());
        }
        TrackedEvent {
            name: self.event_type.as_str().to_string(),
            attributes,
            timestamp: self.timestamp,
        }
    }
}
