//! Trace interceptor
//!
//! Wraps a [`Transport`] so every outbound call is tagged with trace headers
//! and reported to an [`EventSink`] from start to completion.
//!
//! A call moves through `Created -> Dispatched -> {Succeeded | Failed} ->
//! Completed`. If the `execute` future is dropped after dispatch the call is
//! marked `Cancelled` instead. Completion is driven by a drop guard, so
//! `api_call_complete` is emitted exactly once whichever way the call ends.

use crate::classify::classify;
use crate::config::TracerConfig;
use crate::endpoints::EndpointFilter;
use crate::events::{
    TrackedEvent, API_CALL_COMPLETE, API_CALL_ERROR, API_CALL_START, API_CALL_SUCCESS,
    NETWORK_ERROR, PERFORMANCE_METRIC,
};
use crate::identity::IdentityStore;
use crate::metrics::InterceptorMetrics;
use crate::request::{ApiRequest, ApiResponse};
use crate::serialize::DEFAULT_MAX_DEPTH;
use crate::sink::EventSink;
use crate::tracker::{CallOutcome, CallTracker};
use crate::transport::{Transport, TransportError, TransportResult};
use chrono::{SecondsFormat, Utc};
use http::header::{HeaderName, HeaderValue};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Header names injected into every instrumented request
pub mod headers {
    use http::header::HeaderName;

    pub const TRACE_ID: HeaderName = HeaderName::from_static("x-trace-id");
    pub const SESSION_ID: HeaderName = HeaderName::from_static("x-session-id");
    pub const CORRELATION_ID: HeaderName = HeaderName::from_static("x-correlation-id");
    pub const REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
    pub const USER_AGENT: HeaderName = HeaderName::from_static("x-user-agent");
    pub const TIMESTAMP: HeaderName = HeaderName::from_static("x-timestamp");
    pub const API_CALL_ID: HeaderName = HeaderName::from_static("x-api-call-id");
}

/// Value of the `metric` attribute on `performance_metric` events
pub const DURATION_METRIC: &str = "api_call_duration";

/// Where a call is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Created,
    Dispatched,
    Succeeded,
    Failed,
    Cancelled,
    Completed,
}

impl CallPhase {
    fn is_settled(&self) -> bool {
        matches!(
            self,
            CallPhase::Succeeded | CallPhase::Failed | CallPhase::Cancelled
        )
    }
}

/// Identity of one instrumented call, shared by all of its events
#[derive(Debug, Clone)]
struct CallContext {
    call_id: String,
    trace_id: String,
    session_id: String,
    method: String,
    url: String,
}

impl CallContext {
    fn event(&self, name: &str) -> TrackedEvent {
        TrackedEvent::new(name)
            .with("call_id", self.call_id.as_str())
            .with("trace_id", self.trace_id.as_str())
            .with("session_id", self.session_id.as_str())
            .with("method", self.method.as_str())
            .with("url", self.url.as_str())
    }
}

/// Emits `api_call_complete` and releases the call when dropped
struct CompletionGuard<'a> {
    interceptor: &'a TraceInterceptor,
    call: CallContext,
    phase: CallPhase,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        let interceptor = self.interceptor;
        let call_id = self.call.call_id.as_str();

        if !self.phase.is_settled() {
            interceptor
                .tracker
                .settle(call_id, CallOutcome::Cancelled);
            InterceptorMetrics::incr(&interceptor.metrics.calls_cancelled);
            debug!("Call {} to {} dropped before settling", call_id, self.call.url);
            self.phase = CallPhase::Cancelled;
        }

        let record = interceptor.tracker.get(call_id);
        let duration_ms = record
            .as_ref()
            .and_then(|r| r.duration_ms)
            .or_else(|| interceptor.tracker.elapsed_ms(call_id))
            .unwrap_or(0.0);
        let outcome = record
            .as_ref()
            .map(|r| r.status.as_str())
            .unwrap_or("cancelled");

        interceptor.emit(
            self.call
                .event(API_CALL_COMPLETE)
                .with("duration_ms", duration_ms)
                .with("outcome", outcome)
                .with_opt("status", record.as_ref().and_then(|r| r.http_status)),
        );
        self.phase = CallPhase::Completed;

        interceptor.tracker.release(call_id);
    }
}

/// Instruments outbound API calls
pub struct TraceInterceptor {
    transport: Arc<dyn Transport>,
    sink: Arc<dyn EventSink>,
    identity: Arc<IdentityStore>,
    tracker: Arc<CallTracker>,
    endpoints: EndpointFilter,
    metrics: Arc<InterceptorMetrics>,
    user_agent: String,
    max_depth: usize,
    enabled: bool,
}

impl TraceInterceptor {
    /// Create an interceptor with an ephemeral identity and default endpoints
    pub fn new(transport: Arc<dyn Transport>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            transport,
            sink,
            identity: Arc::new(IdentityStore::ephemeral()),
            tracker: Arc::new(CallTracker::new()),
            endpoints: EndpointFilter::default(),
            metrics: Arc::new(InterceptorMetrics::new()),
            user_agent: format!("calltrace/{}", crate::VERSION),
            max_depth: DEFAULT_MAX_DEPTH,
            enabled: true,
        }
    }

    /// Create an interceptor from loaded configuration
    pub fn from_config(
        config: &TracerConfig,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn EventSink>,
        identity: Arc<IdentityStore>,
    ) -> Self {
        Self::new(transport, sink)
            .with_identity(identity)
            .with_endpoints(EndpointFilter::new(config.endpoints.clone()))
            .with_user_agent(config.tracer.user_agent.clone())
            .with_max_depth(config.tracer.serializer_max_depth)
            .with_enabled(config.tracer.enabled)
    }

    pub fn with_identity(mut self, identity: Arc<IdentityStore>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_endpoints(mut self, endpoints: EndpointFilter) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<InterceptorMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn identity(&self) -> &Arc<IdentityStore> {
        &self.identity
    }

    pub fn tracker(&self) -> &Arc<CallTracker> {
        &self.tracker
    }

    pub fn metrics(&self) -> &Arc<InterceptorMetrics> {
        &self.metrics
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Send a request through the transport, instrumenting it unless it
    /// targets a telemetry endpoint. The transport's result is returned
    /// unchanged and the caller's request is never modified.
    pub async fn execute(&self, request: &ApiRequest) -> TransportResult<ApiResponse> {
        if !self.enabled {
            return self.transport.send(request.clone()).await;
        }

        if let Some(endpoint) = self.endpoints.matching(&request.url) {
            debug!(
                endpoint,
                url = %request.url,
                transport = self.transport.name(),
                "Telemetry endpoint, skipping instrumentation"
            );
            InterceptorMetrics::incr(&self.metrics.calls_bypassed);
            return self.transport.send(request.clone()).await;
        }

        let trace_id = self.identity.new_trace_id();
        let session_id = self.identity.session_id();

        let request_size = request.body.size_with_depth(self.max_depth);
        let record = self.tracker.register(
            request.method.as_str(),
            &request.url,
            &trace_id,
            request_size,
        );
        InterceptorMetrics::incr(&self.metrics.calls_started);
        InterceptorMetrics::add(&self.metrics.request_bytes, request_size);

        let mut guard = CompletionGuard {
            interceptor: self,
            call: CallContext {
                call_id: record.call_id,
                trace_id,
                session_id,
                method: request.method.to_string(),
                url: request.url.clone(),
            },
            phase: CallPhase::Created,
        };

        let outbound = self.with_trace_headers(request, &guard.call);
        self.emit(
            guard
                .call
                .event(API_CALL_START)
                .with("request_size", request_size),
        );

        guard.phase = CallPhase::Dispatched;
        trace!(
            "Dispatching call {} via {}",
            guard.call.call_id,
            self.transport.name()
        );
        let result = self.transport.send(outbound).await;

        match &result {
            Ok(response) => self.on_success(&mut guard, request, response),
            Err(error) => self.on_error(&mut guard, error),
        }

        result
    }

    fn on_success(&self, guard: &mut CompletionGuard<'_>, request: &ApiRequest, response: &ApiResponse) {
        let call = &guard.call;
        let response_size = response.size_with_depth(self.max_depth);
        let duration_ms = self
            .tracker
            .settle(
                &call.call_id,
                CallOutcome::Succeeded {
                    http_status: response.status,
                    response_size,
                },
            )
            .and_then(|r| r.duration_ms)
            .unwrap_or(0.0);

        InterceptorMetrics::incr(&self.metrics.calls_succeeded);
        InterceptorMetrics::add(&self.metrics.response_bytes, response_size);

        self.emit(
            call.event(API_CALL_SUCCESS)
                .with("status", response.status)
                .with("duration_ms", duration_ms)
                .with("response_size", response_size),
        );
        self.emit(
            call.event(PERFORMANCE_METRIC)
                .with("metric", DURATION_METRIC)
                .with("value", duration_ms)
                .with("unit", "ms"),
        );

        let body = request.body.as_value();
        if let Some(event) = classify(&request.method, &request.url, body.as_ref()) {
            trace!("Call {} classified as {}", call.call_id, event.event_type);
            InterceptorMetrics::incr(&self.metrics.business_events);
            self.emit(event.with_session(call.session_id.as_str()).into_tracked());
        }

        guard.phase = CallPhase::Succeeded;
    }

    fn on_error(&self, guard: &mut CompletionGuard<'_>, error: &TransportError) {
        let call = &guard.call;
        let status = error.status_code();
        let kind = error.kind();
        let message = match error {
            TransportError::Status { message, .. } => message.clone(),
            other => other.to_string(),
        };

        let duration_ms = self
            .tracker
            .settle(
                &call.call_id,
                CallOutcome::Failed {
                    http_status: status,
                    kind,
                    message: message.clone(),
                },
            )
            .and_then(|r| r.duration_ms)
            .unwrap_or(0.0);

        InterceptorMetrics::incr(&self.metrics.calls_failed);
        debug!("Call {} to {} failed: {}", call.call_id, call.url, error);

        self.emit(
            call.event(API_CALL_ERROR)
                .with_opt("status", status)
                .with("duration_ms", duration_ms)
                .with("error_kind", kind.as_str())
                .with("error_message", message.as_str()),
        );

        if error.is_network_error() {
            InterceptorMetrics::incr(&self.metrics.network_errors);
            self.emit(
                call.event(NETWORK_ERROR)
                    .with("error_message", message.as_str()),
            );
        }

        guard.phase = CallPhase::Failed;
    }

    /// Copy of the request carrying the trace headers
    fn with_trace_headers(&self, request: &ApiRequest, call: &CallContext) -> ApiRequest {
        let mut outbound = request.clone();
        let request_id = uuid::Uuid::new_v4().to_string();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let values: [(HeaderName, &str); 7] = [
            (headers::TRACE_ID, call.trace_id.as_str()),
            (headers::SESSION_ID, call.session_id.as_str()),
            (headers::CORRELATION_ID, call.trace_id.as_str()),
            (headers::REQUEST_ID, request_id.as_str()),
            (headers::USER_AGENT, self.user_agent.as_str()),
            (headers::TIMESTAMP, timestamp.as_str()),
            (headers::API_CALL_ID, call.call_id.as_str()),
        ];

        for (name, value) in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    outbound.headers.insert(name, value);
                }
                Err(e) => debug!("Skipping header {}: {}", name, e),
            }
        }

        outbound
    }

    fn emit(&self, event: TrackedEvent) {
        if event.name.is_empty() {
            warn!("Dropping event without a name");
            return;
        }
        self.sink.track(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BusinessEventType;
    use crate::sink::MemorySink;
    use crate::transport::ScriptedOutcome;
    use crate::transport::ScriptedTransport;
    use http::Method;
    use std::time::Duration;

    fn setup(transport: ScriptedTransport) -> (TraceInterceptor, Arc<MemorySink>, Arc<ScriptedTransport>) {
        let transport = Arc::new(transport);
        let sink = Arc::new(MemorySink::new());
        let interceptor = TraceInterceptor::new(transport.clone(), sink.clone());
        (interceptor, sink, transport)
    }

    fn respond(status: u16, body: serde_json::Value) -> ScriptedOutcome {
        ScriptedOutcome::Respond { status, body }
    }

    fn count(sink: &MemorySink, name: &str) -> usize {
        sink.named(name).len()
    }

    #[tokio::test]
    async fn test_successful_call_lifecycle() {
        let (interceptor, sink, _) = setup(
            ScriptedTransport::new().route("/api/products", respond(200, serde_json::json!([{"id": 1}]))),
        );

        let response = interceptor
            .execute(&ApiRequest::get("/api/products"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);

        assert_eq!(
            sink.names(),
            vec![
                API_CALL_START,
                API_CALL_SUCCESS,
                PERFORMANCE_METRIC,
                API_CALL_COMPLETE
            ]
        );

        let start = &sink.named(API_CALL_START)[0];
        assert_eq!(start.attr_str("method"), Some("GET"));
        assert_eq!(start.attr_str("url"), Some("/api/products"));
        assert_eq!(start.attr("request_size"), Some(&serde_json::json!(0)));

        let success = &sink.named(API_CALL_SUCCESS)[0];
        assert_eq!(success.attr("status"), Some(&serde_json::json!(200)));
        assert_eq!(
            success.attr("response_size"),
            Some(&serde_json::json!(r#"[{"id":1}]"#.len()))
        );

        let metric = &sink.named(PERFORMANCE_METRIC)[0];
        assert_eq!(metric.attr_str("metric"), Some(DURATION_METRIC));

        let complete = &sink.named(API_CALL_COMPLETE)[0];
        assert!(complete.attr("duration_ms").unwrap().as_f64().unwrap() >= 0.0);
        assert_eq!(complete.attr_str("outcome"), Some("succeeded"));

        // every event of the call shares its ids
        let call_id = start.attr_str("call_id").unwrap();
        for event in sink.events() {
            assert_eq!(event.attr_str("call_id"), Some(call_id));
            assert_eq!(event.attr_str("trace_id"), start.attr_str("trace_id"));
        }

        assert_eq!(interceptor.tracker().tracked(), 0);
        assert_eq!(interceptor.tracker().recent().len(), 1);
    }

    /// Records, at dispatch time, whether the start event for the call is
    /// already in the sink
    struct StartCheckingTransport {
        sink: Arc<MemorySink>,
        observed: parking_lot::Mutex<Vec<bool>>,
    }

    #[async_trait::async_trait]
    impl Transport for StartCheckingTransport {
        fn name(&self) -> &str {
            "start-checking"
        }

        async fn send(&self, request: ApiRequest) -> TransportResult<ApiResponse> {
            let call_id = request
                .headers
                .get(headers::API_CALL_ID)
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            let started = self
                .sink
                .named(API_CALL_START)
                .iter()
                .any(|e| e.attr_str("call_id") == call_id.as_deref());
            self.observed.lock().push(started);
            Ok(ApiResponse::new(200))
        }
    }

    #[tokio::test]
    async fn test_start_emitted_before_dispatch() {
        let sink = Arc::new(MemorySink::new());
        let transport = Arc::new(StartCheckingTransport {
            sink: sink.clone(),
            observed: parking_lot::Mutex::new(Vec::new()),
        });
        let interceptor = TraceInterceptor::new(transport.clone(), sink.clone());

        interceptor.execute(&ApiRequest::get("/api/products")).await.unwrap();
        interceptor.execute(&ApiRequest::get("/api/cart")).await.unwrap();

        assert_eq!(*transport.observed.lock(), vec![true, true]);
        assert_eq!(count(&sink, API_CALL_START), 2);
    }

    #[tokio::test]
    async fn test_telemetry_endpoint_bypass() {
        let (interceptor, sink, transport) = setup(ScriptedTransport::new());

        let request = ApiRequest::post("/api/analytics").with_json(serde_json::json!({"e": 1}));
        interceptor.execute(&request).await.unwrap();

        assert!(sink.is_empty());
        let received = transport.received();
        assert_eq!(received.len(), 1);
        assert!(received[0].headers.get(headers::TRACE_ID).is_none());
        assert_eq!(interceptor.metrics().snapshot().calls_bypassed, 1);
        assert_eq!(interceptor.metrics().snapshot().calls_started, 0);
    }

    #[tokio::test]
    async fn test_headers_injected_on_a_copy() {
        let (interceptor, sink, transport) = setup(ScriptedTransport::new());
        let interceptor = interceptor.with_user_agent("shop-web/2.1");

        let request = ApiRequest::get("/api/users/me");
        interceptor.execute(&request).await.unwrap();
        assert!(request.headers.is_empty());

        let sent = &transport.received()[0];
        let header = |name: &HeaderName| {
            sent.headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };

        let start = &sink.named(API_CALL_START)[0];
        assert_eq!(header(&headers::TRACE_ID).as_deref(), start.attr_str("trace_id"));
        assert_eq!(header(&headers::CORRELATION_ID), header(&headers::TRACE_ID));
        assert_eq!(header(&headers::SESSION_ID).as_deref(), start.attr_str("session_id"));
        assert_eq!(header(&headers::API_CALL_ID).as_deref(), start.attr_str("call_id"));
        assert_eq!(header(&headers::USER_AGENT).as_deref(), Some("shop-web/2.1"));

        let request_id = header(&headers::REQUEST_ID).unwrap();
        assert!(uuid::Uuid::parse_str(&request_id).is_ok());

        let timestamp = header(&headers::TIMESTAMP).unwrap();
        assert!(timestamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&timestamp).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_header_value_is_skipped() {
        let (interceptor, _sink, transport) = setup(ScriptedTransport::new());
        let interceptor = interceptor.with_user_agent("bad\nagent");

        interceptor.execute(&ApiRequest::get("/api/users/me")).await.unwrap();

        let sent = &transport.received()[0];
        assert!(sent.headers.get(headers::USER_AGENT).is_none());
        assert!(sent.headers.get(headers::TRACE_ID).is_some());
    }

    #[tokio::test]
    async fn test_client_error() {
        let (interceptor, sink, _) = setup(ScriptedTransport::new().route(
            "/api/products/missing",
            respond(404, serde_json::json!({"message": "Not found"})),
        ));

        let err = interceptor
            .execute(&ApiRequest::get("/api/products/missing"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(404));

        assert_eq!(
            sink.names(),
            vec![API_CALL_START, API_CALL_ERROR, API_CALL_COMPLETE]
        );
        let error = &sink.named(API_CALL_ERROR)[0];
        assert_eq!(error.attr("status"), Some(&serde_json::json!(404)));
        assert_eq!(error.attr_str("error_kind"), Some("ClientError"));
        assert_eq!(error.attr_str("error_message"), Some("Not found"));

        let complete = &sink.named(API_CALL_COMPLETE)[0];
        assert_eq!(complete.attr_str("outcome"), Some("failed"));
        assert_eq!(complete.attr("status"), Some(&serde_json::json!(404)));

        // failed calls are not classified
        assert_eq!(count(&sink, "product_view"), 0);
    }

    #[tokio::test]
    async fn test_server_error() {
        let (interceptor, sink, _) = setup(
            ScriptedTransport::new().route_method(Method::POST, "/cart", respond(500, serde_json::json!({}))),
        );

        let request = ApiRequest::post("/cart").with_json(serde_json::json!({"sku": "X"}));
        assert!(interceptor.execute(&request).await.is_err());

        let error = &sink.named(API_CALL_ERROR)[0];
        assert_eq!(error.attr_str("error_kind"), Some("ServerError"));
        assert_eq!(count(&sink, NETWORK_ERROR), 0);
        assert_eq!(count(&sink, "cart_add"), 0);
        assert_eq!(interceptor.metrics().snapshot().calls_failed, 1);
    }

    #[tokio::test]
    async fn test_network_failure() {
        let (interceptor, sink, _) = setup(ScriptedTransport::new().route(
            "/api/flaky",
            ScriptedOutcome::Fail(TransportError::Network("connection refused".into())),
        ));

        let err = interceptor
            .execute(&ApiRequest::get("/api/flaky"))
            .await
            .unwrap_err();
        assert!(err.is_network_error());

        assert_eq!(
            sink.names(),
            vec![API_CALL_START, API_CALL_ERROR, NETWORK_ERROR, API_CALL_COMPLETE]
        );
        let error = &sink.named(API_CALL_ERROR)[0];
        assert_eq!(error.attr_str("error_kind"), Some("NetworkError"));
        assert!(error.attr("status").is_none());
        assert_eq!(interceptor.metrics().snapshot().network_errors, 1);
    }

    #[tokio::test]
    async fn test_cancelled_call_completes_once() {
        let (interceptor, sink, _) = setup(ScriptedTransport::new().route("/api/slow", ScriptedOutcome::Hang));

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            interceptor.execute(&ApiRequest::get("/api/slow")),
        )
        .await;
        assert!(result.is_err());

        assert_eq!(sink.names(), vec![API_CALL_START, API_CALL_COMPLETE]);
        let complete = &sink.named(API_CALL_COMPLETE)[0];
        assert_eq!(complete.attr_str("outcome"), Some("cancelled"));
        assert!(complete.attr("status").is_none());

        assert_eq!(interceptor.tracker().tracked(), 0);
        assert_eq!(interceptor.metrics().snapshot().calls_cancelled, 1);
    }

    #[tokio::test]
    async fn test_business_events() {
        let (interceptor, sink, _) = setup(ScriptedTransport::new());

        interceptor
            .execute(&ApiRequest::get("/api/products/search?q=laptop"))
            .await
            .unwrap();
        interceptor
            .execute(&ApiRequest::get("/api/products/PROD-123"))
            .await
            .unwrap();
        interceptor
            .execute(&ApiRequest::post("/api/cart").with_json(serde_json::json!({"sku": "X"})))
            .await
            .unwrap();
        interceptor
            .execute(&ApiRequest::post("/api/orders").with_json(serde_json::json!({"total": 10})))
            .await
            .unwrap();

        let search = &sink.named("search")[0];
        assert_eq!(search.attr_str("query"), Some("laptop"));

        let view = &sink.named("product_view")[0];
        assert_eq!(view.attr_str("product_id"), Some("PROD-123"));
        assert_eq!(
            view.attr_str("session_id"),
            Some(interceptor.identity().session_id().as_str())
        );

        let cart = &sink.named(BusinessEventType::CartAdd.as_str())[0];
        assert_eq!(cart.attr_str("sku"), Some("X"));
        assert_eq!(count(&sink, "purchase_complete"), 1);
        assert_eq!(interceptor.metrics().snapshot().business_events, 4);

        // business event lands between success and completion
        let names = sink.names();
        let view_at = names.iter().position(|n| n == "product_view").unwrap();
        assert_eq!(names[view_at - 1], PERFORMANCE_METRIC);
        assert_eq!(names[view_at + 1], API_CALL_COMPLETE);
    }

    #[tokio::test]
    async fn test_trace_id_per_call_session_stable() {
        let (interceptor, sink, _) = setup(ScriptedTransport::new());

        interceptor.execute(&ApiRequest::get("/a")).await.unwrap();
        interceptor.execute(&ApiRequest::get("/b")).await.unwrap();

        let starts = sink.named(API_CALL_START);
        assert_ne!(starts[0].attr_str("trace_id"), starts[1].attr_str("trace_id"));
        assert_eq!(starts[0].attr_str("session_id"), starts[1].attr_str("session_id"));
        assert_eq!(
            interceptor.identity().current_trace_id().as_str(),
            starts[1].attr_str("trace_id").unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls() {
        let transport = ScriptedTransport::new()
            .with_latency(Duration::from_millis(5))
            .route("/fail", respond(503, serde_json::json!({})));
        let (interceptor, sink, _) = setup(transport);
        let interceptor = Arc::new(interceptor);

        let mut handles = Vec::new();
        for i in 0..20 {
            let interceptor = interceptor.clone();
            handles.push(tokio::spawn(async move {
                let url = if i % 4 == 0 {
                    format!("/fail/{}", i)
                } else {
                    format!("/ok/{}", i)
                };
                let _ = interceptor.execute(&ApiRequest::get(url)).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let completes = sink.named(API_CALL_COMPLETE);
        assert_eq!(completes.len(), 20);
        let mut call_ids: Vec<_> = completes
            .iter()
            .map(|e| e.attr_str("call_id").unwrap().to_string())
            .collect();
        call_ids.sort();
        call_ids.dedup();
        assert_eq!(call_ids.len(), 20);

        assert_eq!(count(&sink, API_CALL_ERROR), 5);
        assert_eq!(count(&sink, API_CALL_SUCCESS), 15);
        assert_eq!(interceptor.tracker().in_flight(), 0);
        assert_eq!(interceptor.tracker().tracked(), 0);
    }

    #[tokio::test]
    async fn test_shared_metrics() {
        let metrics = Arc::new(InterceptorMetrics::new());
        let (first, _, _) = setup(ScriptedTransport::new());
        let (second, _, _) = setup(ScriptedTransport::new());
        let first = first.with_metrics(metrics.clone());
        let second = second.with_metrics(metrics.clone());

        first.execute(&ApiRequest::get("/api/products")).await.unwrap();
        second.execute(&ApiRequest::get("/api/cart")).await.unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.calls_started, 2);
        assert_eq!(snapshot.calls_succeeded, 2);
        assert!(metrics
            .to_prometheus()
            .contains("calltrace_calls_total{outcome=\"started\"} 2"));
    }

    #[tokio::test]
    async fn test_disabled_passes_through() {
        let (interceptor, sink, transport) = setup(ScriptedTransport::new());
        let interceptor = interceptor.with_enabled(false);

        interceptor.execute(&ApiRequest::get("/api/products")).await.unwrap();
        assert!(sink.is_empty());
        assert!(transport.received()[0].headers.is_empty());
    }

    #[tokio::test]
    async fn test_from_config_endpoints() {
        let mut config = TracerConfig::default();
        config.endpoints.clear();
        config
            .endpoints
            .insert("collector".to_string(), "/v1/collect".to_string());

        let transport = Arc::new(ScriptedTransport::new());
        let sink = Arc::new(MemorySink::new());
        let interceptor = TraceInterceptor::from_config(
            &config,
            transport,
            sink.clone(),
            Arc::new(IdentityStore::ephemeral()),
        );

        interceptor.execute(&ApiRequest::post("/v1/collect")).await.unwrap();
        assert!(sink.is_empty());

        // analytics is no longer excluded
        interceptor.execute(&ApiRequest::post("/api/analytics")).await.unwrap();
        assert_eq!(count(&sink, API_CALL_COMPLETE), 1);
    }
}
