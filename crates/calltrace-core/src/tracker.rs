//! Call lifecycle tracking
//!
//! Every instrumented call is registered under a unique call id, settles
//! exactly once and is then released into a bounded history.

use crate::transport::ErrorKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tracing::debug;

/// Default number of released records kept for inspection
pub const DEFAULT_MAX_HISTORY: usize = 100;

/// Call status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    InFlight,
    Succeeded,
    Failed,
    Cancelled,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::InFlight => "in_flight",
            CallStatus::Succeeded => "succeeded",
            CallStatus::Failed => "failed",
            CallStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self, CallStatus::InFlight)
    }
}

/// Bookkeeping entry for one outbound call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_id: String,
    pub method: String,
    pub url: String,
    pub trace_id: String,
    pub started_at: DateTime<Utc>,
    pub request_size: usize,
    pub status: CallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// How a call settled
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Succeeded {
        http_status: u16,
        response_size: usize,
    },
    Failed {
        http_status: Option<u16>,
        kind: ErrorKind,
        message: String,
    },
    Cancelled,
}

struct Entry {
    record: CallRecord,
    start: Instant,
}

/// Tracks calls from registration to release
pub struct CallTracker {
    calls: Mutex<HashMap<String, Entry>>,
    history: Mutex<VecDeque<CallRecord>>,
    max_history: usize,
}

impl CallTracker {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_MAX_HISTORY)
    }

    pub fn with_history(max_history: usize) -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            max_history,
        }
    }

    /// Register a new call and start its clock
    pub fn register(
        &self,
        method: &str,
        url: &str,
        trace_id: &str,
        request_size: usize,
    ) -> CallRecord {
        let record = CallRecord {
            call_id: ulid::Ulid::new().to_string(),
            method: method.to_string(),
            url: url.to_string(),
            trace_id: trace_id.to_string(),
            started_at: Utc::now(),
            request_size,
            status: CallStatus::InFlight,
            http_status: None,
            duration_ms: None,
            response_size: None,
            error_kind: None,
            error_message: None,
        };

        self.calls.lock().insert(
            record.call_id.clone(),
            Entry {
                record: record.clone(),
                start: Instant::now(),
            },
        );
        record
    }

    /// Milliseconds since the call was registered
    pub fn elapsed_ms(&self, call_id: &str) -> Option<f64> {
        self.calls
            .lock()
            .get(call_id)
            .map(|e| e.start.elapsed().as_secs_f64() * 1000.0)
    }

    /// Settle a call. Only the first settlement counts; later ones return `None`.
    pub fn settle(&self, call_id: &str, outcome: CallOutcome) -> Option<CallRecord> {
        let mut calls = self.calls.lock();
        let entry = calls.get_mut(call_id)?;
        if entry.record.status.is_settled() {
            debug!("Ignoring second settlement of call {}", call_id);
            return None;
        }

        let record = &mut entry.record;
        record.duration_ms = Some(entry.start.elapsed().as_secs_f64() * 1000.0);
        match outcome {
            CallOutcome::Succeeded {
                http_status,
                response_size,
            } => {
                record.status = CallStatus::Succeeded;
                record.http_status = Some(http_status);
                record.response_size = Some(response_size);
            }
            CallOutcome::Failed {
                http_status,
                kind,
                message,
            } => {
                record.status = CallStatus::Failed;
                record.http_status = http_status;
                record.error_kind = Some(kind);
                record.error_message = Some(message);
            }
            CallOutcome::Cancelled => {
                record.status = CallStatus::Cancelled;
            }
        }

        Some(record.clone())
    }

    /// Release a call id, moving its record into history
    pub fn release(&self, call_id: &str) -> Option<CallRecord> {
        let entry = self.calls.lock().remove(call_id)?;

        let mut history = self.history.lock();
        history.push_back(entry.record.clone());
        while history.len() > self.max_history {
            history.pop_front();
        }

        Some(entry.record)
    }

    pub fn get(&self, call_id: &str) -> Option<CallRecord> {
        self.calls.lock().get(call_id).map(|e| e.record.clone())
    }

    /// Calls registered but not yet settled
    pub fn in_flight(&self) -> usize {
        self.calls
            .lock()
            .values()
            .filter(|e| !e.record.status.is_settled())
            .count()
    }

    /// Calls registered but not yet released
    pub fn tracked(&self) -> usize {
        self.calls.lock().len()
    }

    /// Recently released records, oldest first
    pub fn recent(&self) -> Vec<CallRecord> {
        self.history.lock().iter().cloned().collect()
    }
}

impl Default for CallTracker {
    fn default() -> Self {
        Self::new()
    }
}
