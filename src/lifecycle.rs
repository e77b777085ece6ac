//! Where traces begin: inbound requests and inbound messages.
//!
//! [`Tracer::begin`] opens a trace and hands back a [`TraceScope`]. The scope
//! finalizes the trace when it is dropped, so an early return, an error
//! branch or a cancelled future cannot leave an entry behind in the store.

use std::{fmt, future::Future, panic::Location, sync::Arc};

use serde_json::{json, Map, Value};
use tracing::Level;

use crate::{
    audit::{AuditRecord, AuditSink, AuditWriter, TracingAuditSink},
    config::TraceConfig,
    correlation::CorrelationExtractor,
    event::{EventSink, TraceEvent, TracingSink},
    response::{Language, MessageCatalog},
    store::{Checkpoint, FinalizedTrace, ResponseId, TraceStore},
};

/// Read access to the parts of an inbound request the tracer logs.
pub trait RequestHead {
    fn method(&self) -> &str;

    fn uri(&self) -> String;

    /// One pair per header value, so repeated headers appear repeatedly.
    fn headers(&self) -> Vec<(String, String)>;

    fn client_ip(&self) -> Option<String> {
        None
    }

    /// Response language from `Accept-Language`, English when absent.
    fn language(&self) -> Language {
        self.headers()
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("accept-language"))
            .map(|(_, value)| Language::from_accept_language(value))
            .unwrap_or_default()
    }
}

fn header_pairs(headers: &http::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn forwarded_for(headers: &http::HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .map(|ip| ip.trim().to_string())
}

impl<B> RequestHead for http::Request<B> {
    fn method(&self) -> &str {
        http::Request::method(self).as_str()
    }

    fn uri(&self) -> String {
        http::Request::uri(self).to_string()
    }

    fn headers(&self) -> Vec<(String, String)> {
        header_pairs(http::Request::headers(self))
    }

    fn client_ip(&self) -> Option<String> {
        forwarded_for(http::Request::headers(self))
    }
}

impl RequestHead for http::request::Parts {
    fn method(&self) -> &str {
        self.method.as_str()
    }

    fn uri(&self) -> String {
        self.uri.to_string()
    }

    fn headers(&self) -> Vec<(String, String)> {
        header_pairs(&self.headers)
    }

    fn client_ip(&self) -> Option<String> {
        forwarded_for(&self.headers)
    }
}

/// Groups header pairs into `{name: [values]}`.
pub(crate) fn headers_json(headers: &[(String, String)]) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        let values = map
            .entry(name.clone())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(values) = values {
            values.push(Value::String(value.clone()));
        }
    }
    Value::Object(map)
}

pub(crate) struct Inner {
    pub(crate) store: Arc<TraceStore>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) audit: AuditWriter,
    pub(crate) extractor: CorrelationExtractor,
    pub(crate) config: TraceConfig,
    pub(crate) catalog: MessageCatalog,
}

/// Entry point for tracing. Cheap to clone; clones share the store, sinks
/// and audit writer.
#[derive(Clone)]
pub struct Tracer {
    pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("config", &self.inner.config)
            .field("open_traces", &self.inner.store.len())
            .finish()
    }
}

#[derive(Default)]
pub struct TracerBuilder {
    store: Option<Arc<TraceStore>>,
    sink: Option<Arc<dyn EventSink>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    config: TraceConfig,
    catalog: MessageCatalog,
}

impl TracerBuilder {
    /// Defaults to [`TraceStore::global`].
    pub fn store(mut self, store: Arc<TraceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to [`TracingSink`].
    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Only used when `audit_logs` is enabled. Defaults to [`TracingAuditSink`].
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn config(mut self, config: TraceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn messages(mut self, catalog: MessageCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Starts the audit writer when audit logging is enabled, which needs a
    /// Tokio runtime.
    pub fn build(self) -> Tracer {
        let audit = if self.config.audit_logs {
            AuditWriter::spawn_bounded(
                self.audit_sink
                    .unwrap_or_else(|| Arc::new(TracingAuditSink)),
                self.config.audit_queue_capacity,
                self.config.audit_max_in_flight,
            )
        } else {
            AuditWriter::disabled()
        };

        Tracer {
            inner: Arc::new(Inner {
                store: self
                    .store
                    .unwrap_or_else(|| Arc::clone(TraceStore::global())),
                sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
                audit,
                extractor: CorrelationExtractor::new(self.config.request_id_alias.as_deref()),
                config: self.config,
                catalog: self.catalog,
            }),
        }
    }
}

impl Tracer {
    pub fn builder() -> TracerBuilder {
        TracerBuilder::default()
    }

    pub fn store(&self) -> &Arc<TraceStore> {
        &self.inner.store
    }

    pub fn audit(&self) -> &AuditWriter {
        &self.inner.audit
    }

    pub fn config(&self) -> &TraceConfig {
        &self.inner.config
    }

    /// Opens a trace. The returned scope finalizes it when dropped.
    pub fn begin(&self) -> TraceScope {
        TraceScope {
            id: self.inner.store.begin(),
            tracer: self.clone(),
        }
    }

    /// Runs `handler` for one pub/sub delivery inside its own trace.
    pub async fn trace_message<F, Fut, T>(&self, topic: &str, payload: &[u8], handler: F) -> T
    where
        F: FnOnce(ResponseId) -> Fut,
        Fut: Future<Output = T>,
    {
        let scope = self.begin();
        scope.enter_message(topic, payload);
        handler(scope.id()).await
    }

    pub(crate) fn emit(&self, event: TraceEvent) {
        self.inner.sink.emit(event);
    }

    pub(crate) fn audit_enabled(&self) -> bool {
        self.inner.audit.is_enabled()
    }
}

/// Ownership of one open trace.
#[derive(Debug)]
#[must_use = "the trace is finalized as soon as the scope is dropped"]
pub struct TraceScope {
    id: ResponseId,
    tracer: Tracer,
}

impl TraceScope {
    pub fn id(&self) -> ResponseId {
        self.id
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// First checkpoint of a request whose body was read successfully.
    #[track_caller]
    pub fn enter_request<H>(&self, head: &H, body: &[u8])
    where
        H: RequestHead + ?Sized,
    {
        let location = Location::caller();
        let store = self.tracer.store();
        let correlation_id = self.tracer.inner.extractor.extract(body);
        let _ = store.set_correlation_id(self.id, correlation_id.clone());

        let stage = store.current_stage(self.id).unwrap_or(Checkpoint::UNKNOWN);
        let headers = headers_json(&head.headers());
        let url = head.uri();
        let body = String::from_utf8_lossy(body);

        self.tracer.emit(
            TraceEvent::new(Level::DEBUG, self.id, "request received")
                .field("step", stage.step)
                .field("duration", stage.duration_ms())
                .field("total-duration", stage.total_ms())
                .field("client-ip", head.client_ip().unwrap_or_default())
                .field("http-method", head.method())
                .field("url", url.as_str())
                .field("header", headers.clone())
                .field("request-body", &*body)
                .field("request-id", correlation_id.as_str()),
        );

        if self.tracer.audit_enabled() {
            let data = json!({
                "url": format!("{}[{}]", head.method(), url),
                "request_body": body,
                "request_header": headers,
            });
            self.tracer.inner.audit.submit(
                AuditRecord::new(self.id, stage.step)
                    .request_id(correlation_id)
                    .code("0", "Success")
                    .function_name("mw.delivery")
                    .data(&data)
                    .duration(stage.duration_ms())
                    .location(location),
            );
        }
    }

    /// The request body could not be read. Logs the failure and finalizes
    /// the trace; the caller answers with a server error and skips the
    /// handler.
    pub fn abort_request<H>(self, head: &H, error: &dyn fmt::Display) -> Option<FinalizedTrace>
    where
        H: RequestHead + ?Sized,
    {
        let stage = self
            .tracer
            .store()
            .current_stage(self.id)
            .unwrap_or(Checkpoint::UNKNOWN);

        self.tracer.emit(
            TraceEvent::new(Level::WARN, self.id, "request body unreadable")
                .field("step", stage.step)
                .field("duration", stage.duration_ms())
                .field("total-duration", stage.total_ms())
                .field("client-ip", head.client_ip().unwrap_or_default())
                .field("http-method", head.method())
                .field("url", head.uri())
                .field("header", headers_json(&head.headers()))
                .field("error", error.to_string()),
        );

        self.tracer.store().finalize(self.id)
    }

    /// First checkpoint of a pub/sub delivery.
    #[track_caller]
    pub fn enter_message(&self, topic: &str, payload: &[u8]) {
        let location = Location::caller();
        let store = self.tracer.store();
        let correlation_id = self.tracer.inner.extractor.extract(payload);
        let _ = store.set_correlation_id(self.id, correlation_id.clone());

        let stage = store.current_stage(self.id).unwrap_or(Checkpoint::UNKNOWN);
        let payload = String::from_utf8_lossy(payload);

        self.tracer.emit(
            TraceEvent::new(Level::DEBUG, self.id, "message received")
                .field("step", stage.step)
                .field("duration", stage.duration_ms())
                .field("total-duration", stage.total_ms())
                .field("topic", topic)
                .field("payload", &*payload)
                .field("request-id", correlation_id.as_str()),
        );

        if self.tracer.audit_enabled() {
            let data = json!({ "topic": topic, "payload": payload });
            self.tracer.inner.audit.submit(
                AuditRecord::new(self.id, stage.step)
                    .request_id(correlation_id)
                    .code("0", "Success")
                    .function_name("mw.message")
                    .data(&data)
                    .duration(stage.duration_ms())
                    .location(location),
            );
        }
    }
}

impl Drop for TraceScope {
    fn drop(&mut self) {
        if let Some(closed) = self.tracer.store().finalize(self.id) {
            tracing::debug!(
                response_id = %self.id,
                step = closed.step,
                "trace closed on scope exit"
            );
        }
    }
}
