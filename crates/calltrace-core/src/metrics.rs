//! Interceptor counters
//!
//! Lock-free counters updated on every call, renderable as JSON or in the
//! Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Counters for one interceptor
#[derive(Debug)]
pub struct InterceptorMetrics {
    start_time: Instant,
    pub calls_started: AtomicU64,
    pub calls_succeeded: AtomicU64,
    pub calls_failed: AtomicU64,
    pub calls_cancelled: AtomicU64,
    /// Calls to telemetry endpoints that skipped instrumentation
    pub calls_bypassed: AtomicU64,
    pub network_errors: AtomicU64,
    pub business_events: AtomicU64,
    pub request_bytes: AtomicU64,
    pub response_bytes: AtomicU64,
}

impl Default for InterceptorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptorMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            calls_started: AtomicU64::new(0),
            calls_succeeded: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            calls_cancelled: AtomicU64::new(0),
            calls_bypassed: AtomicU64::new(0),
            network_errors: AtomicU64::new(0),
            business_events: AtomicU64::new(0),
            request_bytes: AtomicU64::new(0),
            response_bytes: AtomicU64::new(0),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            calls_started: self.calls_started.load(Ordering::Relaxed),
            calls_succeeded: self.calls_succeeded.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            calls_cancelled: self.calls_cancelled.load(Ordering::Relaxed),
            calls_bypassed: self.calls_bypassed.load(Ordering::Relaxed),
            network_errors: self.network_errors.load(Ordering::Relaxed),
            business_events: self.business_events.load(Ordering::Relaxed),
            request_bytes: self.request_bytes.load(Ordering::Relaxed),
            response_bytes: self.response_bytes.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut output = String::new();

        output.push_str("# HELP calltrace_uptime_seconds Time since the interceptor was created\n");
        output.push_str("# TYPE calltrace_uptime_seconds gauge\n");
        output.push_str(&format!(
            "calltrace_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        output.push_str("# HELP calltrace_calls_total Instrumented calls by outcome\n");
        output.push_str("# TYPE calltrace_calls_total counter\n");
        for (outcome, value) in [
            ("started", s.calls_started),
            ("succeeded", s.calls_succeeded),
            ("failed", s.calls_failed),
            ("cancelled", s.calls_cancelled),
        ] {
            output.push_str(&format!(
                "calltrace_calls_total{{outcome=\"{}\"}} {}\n",
                outcome, value
            ));
        }
        output.push('\n');

        output.push_str(
            "# HELP calltrace_calls_bypassed_total Calls to telemetry endpoints left uninstrumented\n",
        );
        output.push_str("# TYPE calltrace_calls_bypassed_total counter\n");
        output.push_str(&format!(
            "calltrace_calls_bypassed_total {}\n\n",
            s.calls_bypassed
        ));

        output.push_str("# HELP calltrace_network_errors_total Calls that failed without a response\n");
        output.push_str("# TYPE calltrace_network_errors_total counter\n");
        output.push_str(&format!(
            "calltrace_network_errors_total {}\n\n",
            s.network_errors
        ));

        output.push_str("# HELP calltrace_business_events_total Business events emitted\n");
        output.push_str("# TYPE calltrace_business_events_total counter\n");
        output.push_str(&format!(
            "calltrace_business_events_total {}\n\n",
            s.business_events
        ));

        output.push_str("# HELP calltrace_payload_bytes_total Payload bytes by direction\n");
        output.push_str("# TYPE calltrace_payload_bytes_total counter\n");
        output.push_str(&format!(
            "calltrace_payload_bytes_total{{direction=\"request\"}} {}\n",
            s.request_bytes
        ));
        output.push_str(&format!(
            "calltrace_payload_bytes_total{{direction=\"response\"}} {}\n",
            s.response_bytes
        ));

        output
    }

    /// Export metrics as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let s = self.snapshot();
        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "calls": {
                "started": s.calls_started,
                "succeeded": s.calls_succeeded,
                "failed": s.calls_failed,
                "cancelled": s.calls_cancelled,
                "bypassed": s.calls_bypassed,
            },
            "network_errors": s.network_errors,
            "business_events": s.business_events,
            "bytes": {
                "request": s.request_bytes,
                "response": s.response_bytes,
            },
        })
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, value: usize) {
        counter.fetch_add(value as u64, Ordering::Relaxed);
    }
}

/// Plain copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub calls_started: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub calls_cancelled: u64,
    pub calls_bypassed: u64,
    pub network_errors: u64,
    pub business_events: u64,
    pub request_bytes: u64,
    pub response_bytes: u64,
}
