//! Transport boundary
//!
//! The interceptor does not know about any particular HTTP client. It
//! forwards requests through a [`Transport`]. Implementations reject
//! non-2xx responses with [`TransportError::Status`], the same contract
//! browser HTTP clients follow.

use crate::request::{ApiRequest, ApiResponse};
use async_trait::async_trait;
use http::Method;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a transport
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// No response was received
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with a non-success status
    #[error("Request failed with status {status}: {message}")]
    Status { status: u16, message: String },

    /// The transport gave up waiting
    #[error("Request timed out")]
    Timeout,

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        TransportError::Status {
            status,
            message: message.into(),
        }
    }

    /// HTTP status, if the server answered
    pub fn status_code(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Check if no response was received
    pub fn is_network_error(&self) -> bool {
        matches!(self.status_code(), None | Some(0))
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_status(self.status_code())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Failure class derived from the response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No status available
    Network,
    /// 4xx
    Client,
    /// 5xx
    Server,
    Unknown,
}

impl ErrorKind {
    pub fn from_status(status: Option<u16>) -> Self {
        match status {
            None | Some(0) => ErrorKind::Network,
            Some(400..=499) => ErrorKind::Client,
            Some(500..=599) => ErrorKind::Server,
            Some(_) => ErrorKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "NetworkError",
            ErrorKind::Client => "ClientError",
            ErrorKind::Server => "ServerError",
            ErrorKind::Unknown => "UnknownError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that can carry a request to a server
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name, for logs
    fn name(&self) -> &str;

    /// Send the request and wait for it to settle
    async fn send(&self, request: ApiRequest) -> TransportResult<ApiResponse>;
}

// =============================================================================
// SCRIPTED TRANSPORT
// =============================================================================

/// What a scripted route does
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Answer with a status and JSON body (non-2xx becomes an error)
    Respond { status: u16, body: serde_json::Value },
    /// Fail without a response
    Fail(TransportError),
    /// Never settle
    Hang,
}

#[derive(Debug, Clone)]
struct Route {
    method: Option<Method>,
    fragment: String,
    outcome: ScriptedOutcome,
}

/// In-process transport with canned answers
///
/// Routes are matched in insertion order by method and URL fragment.
/// Unmatched requests get `200 {}`. Every request that reaches the
/// transport is recorded.
pub struct ScriptedTransport {
    routes: Vec<Route>,
    latency: Duration,
    received: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            latency: Duration::ZERO,
            received: Mutex::new(Vec::new()),
        }
    }

    /// Delay every answer
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Add a route for any method
    pub fn route(mut self, fragment: impl Into<String>, outcome: ScriptedOutcome) -> Self {
        self.routes.push(Route {
            method: None,
            fragment: fragment.into(),
            outcome,
        });
        self
    }

    /// Add a route for one method
    pub fn route_method(
        mut self,
        method: Method,
        fragment: impl Into<String>,
        outcome: ScriptedOutcome,
    ) -> Self {
        self.routes.push(Route {
            method: Some(method),
            fragment: fragment.into(),
            outcome,
        });
        self
    }

    /// Requests seen so far
    pub fn received(&self) -> Vec<ApiRequest> {
        self.received.lock().clone()
    }

    fn outcome_for(&self, request: &ApiRequest) -> ScriptedOutcome {
        self.routes
            .iter()
            .find(|r| {
                r.method.as_ref().map_or(true, |m| *m == request.method)
                    && request.url.contains(&r.fragment)
            })
            .map(|r| r.outcome.clone())
            .unwrap_or(ScriptedOutcome::Respond {
                status: 200,
                body: serde_json::json!({}),
            })
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, request: ApiRequest) -> TransportResult<ApiResponse> {
        let outcome = self.outcome_for(&request);
        self.received.lock().push(request);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match outcome {
            ScriptedOutcome::Respond { status, body } if (200..300).contains(&status) => {
                Ok(ApiResponse::new(status).with_json(body))
            }
            ScriptedOutcome::Respond { status, body } => {
                let message = body
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| format!("HTTP {}", status));
                Err(TransportError::status(status, message))
            }
            ScriptedOutcome::Fail(err) => Err(err),
            ScriptedOutcome::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_from_status() {
        assert_eq!(ErrorKind::from_status(None), ErrorKind::Network);
        assert_eq!(ErrorKind::from_status(Some(0)), ErrorKind::Network);
        assert_eq!(ErrorKind::from_status(Some(404)), ErrorKind::Client);
        assert_eq!(ErrorKind::from_status(Some(503)), ErrorKind::Server);
        assert_eq!(ErrorKind::from_status(Some(302)), ErrorKind::Unknown);
    }

    #[test]
    fn test_is_network_error() {
        assert!(TransportError::Network("refused".into()).is_network_error());
        assert!(TransportError::Timeout.is_network_error());
        assert!(!TransportError::status(500, "boom").is_network_error());
        assert_eq!(TransportError::status(500, "boom").kind(), ErrorKind::Server);
    }

    #[tokio::test]
    async fn test_scripted_routes() {
        let transport = ScriptedTransport::new()
            .route_method(
                Method::POST,
                "/orders",
                ScriptedOutcome::Respond {
                    status: 201,
                    body: serde_json::json!({"id": "o-1"}),
                },
            )
            .route(
                "/missing",
                ScriptedOutcome::Respond {
                    status: 404,
                    body: serde_json::json!({"message": "not found"}),
                },
            );

        let ok = transport.send(ApiRequest::post("/orders")).await.unwrap();
        assert_eq!(ok.status, 201);

        let err = transport.send(ApiRequest::get("/missing")).await.unwrap_err();
        assert_eq!(err.status_code(), Some(404));
        assert!(err.to_string().contains("not found"));

        let fallback = transport.send(ApiRequest::get("/orders")).await.unwrap();
        assert_eq!(fallback.status, 200);
        assert_eq!(transport.received().len(), 3);
    }
}
