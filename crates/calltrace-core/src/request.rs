//! Outbound request and response descriptors

use crate::serialize::{serialize_with_depth, DEFAULT_MAX_DEPTH};
use crate::value::TraceValue;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, Method};

/// Size assumed for multipart bodies, whose encoded length is unknown up front
pub const MULTIPART_SIZE_ESTIMATE: usize = 1024;

/// Request payload, tagged by kind so each kind carries its own size rule
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Text(String),
    Binary(Vec<u8>),
    /// Encoded form data; `content_type` carries the boundary
    Multipart { content_type: String, bytes: Vec<u8> },
    /// JSON-like payload; may be a cyclic graph
    Structured(TraceValue),
}

impl RequestBody {
    pub fn multipart(content_type: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        RequestBody::Multipart {
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    /// Estimated payload size in bytes
    pub fn size(&self) -> usize {
        self.size_with_depth(DEFAULT_MAX_DEPTH)
    }

    /// Estimated payload size, serializing structured bodies to `max_depth`
    pub fn size_with_depth(&self, max_depth: usize) -> usize {
        match self {
            RequestBody::Empty => 0,
            RequestBody::Text(text) => text.len(),
            RequestBody::Binary(bytes) => bytes.len(),
            RequestBody::Multipart { .. } => MULTIPART_SIZE_ESTIMATE,
            RequestBody::Structured(value) => serialize_with_depth(value, max_depth).len(),
        }
    }

    /// Structured view of the body, used for business event payloads
    pub fn as_value(&self) -> Option<TraceValue> {
        match self {
            RequestBody::Structured(value) => Some(value.clone()),
            RequestBody::Text(text) => serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .map(TraceValue::from),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RequestBody::Empty)
    }
}

impl From<serde_json::Value> for RequestBody {
    fn from(value: serde_json::Value) -> Self {
        RequestBody::Structured(TraceValue::from(value))
    }
}

/// An outbound API call
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json(self, json: serde_json::Value) -> Self {
        self.with_body(RequestBody::from(json))
    }
}

/// A settled response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Option<TraceValue>,
}

impl ApiResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: TraceValue) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_json(self, json: serde_json::Value) -> Self {
        self.with_body(TraceValue::from(json))
    }

    /// Response payload size: `Content-Length` if usable, else the length of
    /// the serialized body, else 0
    pub fn size(&self) -> usize {
        self.size_with_depth(DEFAULT_MAX_DEPTH)
    }

    pub fn size_with_depth(&self, max_depth: usize) -> usize {
        if let Some(length) = self
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            return length;
        }

        self.body
            .as_ref()
            .map(|b| serialize_with_depth(b, max_depth).len())
            .unwrap_or(0)
    }
}
