#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use request_trace::{
    audit::AuditError, AuditRecord, AuditSink, EventSink, MessageCatalog, OutboundRequest,
    OutboundResponse, ResponseId, TraceConfig, TraceEvent, TraceStore, Tracer, Transport,
    TransportError,
};

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, id: ResponseId) -> Vec<TraceEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.response_id == id)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: TraceEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[derive(Default)]
pub struct CountingAuditSink {
    calls: AtomicUsize,
    records: Mutex<Vec<AuditRecord>>,
    fail: bool,
}

impl CountingAuditSink {
    pub fn failing() -> Self {
        CountingAuditSink {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Records ordered by step.
    pub fn records(&self) -> Vec<AuditRecord> {
        let mut records = self.records.lock().unwrap().clone();
        records.sort_by_key(|r| r.step);
        records
    }
}

#[async_trait]
impl AuditSink for CountingAuditSink {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AuditError::Unavailable("connection refused".into()));
        }
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

/// Answers every request with the same result and remembers what was sent.
pub struct ScriptedTransport {
    result: Result<OutboundResponse, String>,
    sent: Mutex<Vec<OutboundRequest>>,
}

impl ScriptedTransport {
    pub fn replying(status: u16, body: &str) -> Self {
        ScriptedTransport {
            result: Ok(OutboundResponse {
                status,
                body: body.to_string(),
                headers: vec![("content-type".into(), "application/json".into())],
            }),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: &str) -> Self {
        ScriptedTransport {
            result: Err(error.to_string()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<OutboundRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<OutboundResponse, TransportError> {
        self.sent.lock().unwrap().push(request.clone());
        self.result.clone().map_err(TransportError::new)
    }
}

pub struct Harness {
    pub tracer: Tracer,
    pub store: Arc<TraceStore>,
    pub events: Arc<RecordingSink>,
    pub audit: Arc<CountingAuditSink>,
}

impl Harness {
    pub fn new(config: TraceConfig) -> Self {
        Self::with_audit_sink(config, CountingAuditSink::default())
    }

    pub fn with_audit_sink(config: TraceConfig, audit: CountingAuditSink) -> Self {
        let store = Arc::new(TraceStore::new());
        let events = Arc::new(RecordingSink::default());
        let audit = Arc::new(audit);

        let mut catalog = MessageCatalog::default();
        catalog
            .insert(request_trace::Language::En, "0", "Success")
            .insert(request_trace::Language::En, "99", "General error")
            .insert(request_trace::Language::Id, "0", "Sukses");

        let tracer = Tracer::builder()
            .store(store.clone())
            .sink(events.clone())
            .audit_sink(audit.clone())
            .config(config)
            .messages(catalog)
            .build();

        Harness {
            tracer,
            store,
            events,
            audit,
        }
    }
}

pub fn audit_on() -> TraceConfig {
    TraceConfig {
        audit_logs: true,
        ..TraceConfig::default()
    }
}

/// Milliseconds carried by a `"<n> ms"` field.
pub fn millis(event: &TraceEvent, field: &str) -> f64 {
    event
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(|v| v.strip_suffix(" ms"))
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| panic!("{field} missing or malformed"))
}
