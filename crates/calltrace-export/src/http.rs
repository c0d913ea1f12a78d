//! HTTP transport backed by reqwest

use async_trait::async_trait;
use calltrace_core::request::{ApiRequest, ApiResponse, RequestBody};
use calltrace_core::serialize::serialize;
use calltrace_core::transport::{Transport, TransportError, TransportResult};
use calltrace_core::value::TraceValue;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Sends requests over the network
///
/// Non-2xx answers are returned as [`TransportError::Status`]. The error
/// message is taken from a JSON `message` field when the body has one.
pub struct ReqwestTransport {
    client: Client,
    base_url: Option<Url>,
}

impl ReqwestTransport {
    /// Create a transport with its own client
    pub fn new(timeout: Duration) -> TransportResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .map_err(|e| {
                TransportError::InvalidRequest(format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self::with_client(client))
    }

    /// Use an existing client
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            base_url: None,
        }
    }

    /// Resolve relative request URLs against this base
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    fn resolve(&self, url: &str) -> TransportResult<Url> {
        match Url::parse(url) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base_url {
                Some(base) => base
                    .join(url)
                    .map_err(|e| TransportError::InvalidRequest(format!("{}: {}", url, e))),
                None => Err(TransportError::InvalidRequest(format!(
                    "Relative URL without a base: {}",
                    url
                ))),
            },
            Err(e) => Err(TransportError::InvalidRequest(format!("{}: {}", url, e))),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    fn name(&self) -> &str {
        "reqwest"
    }

    async fn send(&self, request: ApiRequest) -> TransportResult<ApiResponse> {
        let url = self.resolve(&request.url)?;
        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(request.headers);

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Text(text) => builder.body(text),
            RequestBody::Binary(bytes) => builder.body(bytes),
            RequestBody::Multipart {
                content_type,
                bytes,
            } => match HeaderValue::from_str(&content_type) {
                Ok(value) => builder.header(CONTENT_TYPE, value).body(bytes),
                Err(_) => {
                    debug!("Invalid multipart content type {:?}, sending body without it", content_type);
                    builder.body(bytes)
                }
            },
            RequestBody::Structured(value) => builder
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(serialize(&value)),
        };

        let response = builder.send().await.map_err(map_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let text = response.text().await.map_err(map_error)?;

        let body = if text.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str::<serde_json::Value>(&text)
                    .map(TraceValue::from)
                    .unwrap_or_else(|_| TraceValue::string(text.clone())),
            )
        };

        if !status.is_success() {
            let message = body
                .as_ref()
                .and_then(|b| b.get("message"))
                .and_then(|m| m.as_str().map(String::from))
                .or_else(|| status.canonical_reason().map(String::from))
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(TransportError::status(status.as_u16(), message));
        }

        Ok(ApiResponse {
            status: status.as_u16(),
            headers,
            body,
        })
    }
}

fn map_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else {
        TransportError::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Method;
    use wiremock::matchers::{body_bytes, body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport_for(server: &MockServer) -> ReqwestTransport {
        ReqwestTransport::new(Duration::from_secs(5))
            .unwrap()
            .with_base_url(Url::parse(&server.uri()).unwrap())
    }

    #[tokio::test]
    async fn test_success_with_json_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/products"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"items": [1, 2]})))
            .mount(&server)
            .await;

        let response = transport_for(&server)
            .send(ApiRequest::get("/api/products"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        let body = response.body.as_ref().unwrap();
        assert!(body.get("items").is_some());
        assert!(response.size() > 0);
    }

    #[tokio::test]
    async fn test_structured_body_and_headers_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/cart"))
            .and(header("x-trace-id", "trace-1-abc"))
            .and(header("content-type", "application/json"))
            .and(body_json(serde_json::json!({"sku": "X"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let mut request = ApiRequest::new(Method::POST, "/api/cart").with_json(serde_json::json!({"sku": "X"}));
        request
            .headers
            .insert("x-trace-id", HeaderValue::from_static("trace-1-abc"));

        let response = transport_for(&server).send(request).await.unwrap();
        assert_eq!(response.status, 201);
        assert!(response.body.is_none());
        server.verify().await;
    }

    #[tokio::test]
    async fn test_multipart_bytes_sent() {
        let server = MockServer::start().await;
        let content_type = "multipart/form-data; boundary=calltrace";
        let payload = b"--calltrace\r\nContent-Disposition: form-data; name=\"file\"\r\n\r\nhello\r\n--calltrace--\r\n".to_vec();
        Mock::given(method("POST"))
            .and(path("/api/upload"))
            .and(header("content-type", content_type))
            .and(body_bytes(payload.clone()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let request = ApiRequest::post("/api/upload").with_body(RequestBody::multipart(content_type, payload));
        let response = transport_for(&server).send(request).await.unwrap();
        assert_eq!(response.status, 200);
        server.verify().await;
    }

    #[tokio::test]
    async fn test_non_success_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/products/missing"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(serde_json::json!({"message": "Product not found"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/broken"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let transport = transport_for(&server);

        let err = transport
            .send(ApiRequest::get("/api/products/missing"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(404));
        assert!(err.to_string().contains("Product not found"));

        let err = transport.send(ApiRequest::get("/api/broken")).await.unwrap_err();
        assert_eq!(err.status_code(), Some(502));
        assert!(err.to_string().contains("Bad Gateway"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_millis(50))
            .unwrap()
            .with_base_url(Url::parse(&server.uri()).unwrap());
        let err = transport.send(ApiRequest::get("/slow")).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        assert!(err.is_network_error());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // grab a free port, then close it again
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = ReqwestTransport::new(Duration::from_secs(2)).unwrap();
        let err = transport
            .send(ApiRequest::get(format!("http://127.0.0.1:{}/api/products", port)))
            .await
            .unwrap_err();
        assert!(err.is_network_error());
    }

    #[tokio::test]
    async fn test_relative_url_without_base() {
        let transport = ReqwestTransport::new(Duration::from_secs(1)).unwrap();
        let err = transport.send(ApiRequest::get("/api/products")).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
    }
}
