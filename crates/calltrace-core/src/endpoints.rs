//! Telemetry endpoint exclusion
//!
//! Calls to the collector's own endpoints must never be instrumented,
//! otherwise every telemetry call would emit another telemetry call.

use std::collections::BTreeMap;

/// Default telemetry endpoints by logical name
pub fn default_endpoints() -> BTreeMap<String, String> {
    let mut endpoints = BTreeMap::new();
    endpoints.insert("analytics".to_string(), "/api/analytics".to_string());
    endpoints.insert("performance".to_string(), "/api/performance".to_string());
    endpoints.insert("error".to_string(), "/api/errors".to_string());
    endpoints
}

/// Exclusion list of telemetry endpoints
#[derive(Debug, Clone)]
pub struct EndpointFilter {
    /// Logical name -> URL fragment
    endpoints: BTreeMap<String, String>,
}

impl EndpointFilter {
    pub fn new(endpoints: BTreeMap<String, String>) -> Self {
        let endpoints = endpoints
            .into_iter()
            .filter(|(_, fragment)| !fragment.trim().is_empty())
            .collect();
        Self { endpoints }
    }

    /// Filter that excludes nothing
    pub fn empty() -> Self {
        Self {
            endpoints: BTreeMap::new(),
        }
    }

    /// Add an endpoint
    pub fn exclude(mut self, name: impl Into<String>, fragment: impl Into<String>) -> Self {
        let fragment = fragment.into();
        if !fragment.trim().is_empty() {
            self.endpoints.insert(name.into(), fragment);
        }
        self
    }

    /// Logical name of the endpoint this URL targets, if excluded
    pub fn matching(&self, url: &str) -> Option<&str> {
        self.endpoints
            .iter()
            .find(|(_, fragment)| url.contains(fragment.as_str()))
            .map(|(name, _)| name.as_str())
    }

    /// Check if a call to this URL bypasses instrumentation
    pub fn is_excluded(&self, url: &str) -> bool {
        self.matching(url).is_some()
    }

    pub fn endpoints(&self) -> &BTreeMap<String, String> {
        &self.endpoints
    }
}

impl Default for EndpointFilter {
    fn default() -> Self {
        Self::new(default_endpoints())
    }
}
