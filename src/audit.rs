//! Durable, write-once records of traced stages.
//!
//! Records are handed to an [`AuditWriter`]. It queues them in a bounded
//! channel, and a background task hands each one to the [`AuditSink`] as its
//! own write, with a cap on how many writes are in flight. Submitting never
//! blocks and never fails: a full queue drops the record, and sink failures
//! are counted, exported as a metric and logged at `debug`. Neither reaches
//! the request path.

use std::{
    panic::Location,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::global;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    runtime::Handle,
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot, Semaphore,
    },
};

use crate::store::ResponseId;

/// One audited stage. `step` is the sort key for records of the same
/// response id, since writes may land out of order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub response_id: String,
    /// Correlation id extracted from the request payload, empty if none.
    pub request_id: String,
    pub step: u32,
    pub code: String,
    pub message: String,
    pub function_name: String,
    /// Serialized JSON snapshot of the stage.
    pub data: String,
    pub duration: String,
    /// Source location, `file:line`.
    pub tracer: String,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(response_id: ResponseId, step: u32) -> Self {
        AuditRecord {
            response_id: response_id.to_string(),
            request_id: String::new(),
            step,
            code: String::new(),
            message: String::new(),
            function_name: String::new(),
            data: String::new(),
            duration: String::new(),
            tracer: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn code(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.code = code.into();
        self.message = message.into();
        self
    }

    pub fn function_name(mut self, function_name: impl Into<String>) -> Self {
        self.function_name = function_name.into();
        self
    }

    pub fn data(mut self, data: &Value) -> Self {
        self.data = data.to_string();
        self
    }

    pub fn duration(mut self, duration: impl Into<String>) -> Self {
        self.duration = duration.into();
        self
    }

    pub fn location(mut self, location: &Location<'_>) -> Self {
        self.tracer = format!("{}:{}", location.file(), location.line());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
    #[error("failed to serialize audit record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only destination of audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// Writes every record as an `info` event on target `request_trace::audit`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        let json = serde_json::to_string(&record)?;
        tracing::info!(
            target: "request_trace::audit",
            response_id = %record.response_id,
            step = record.step,
            record = %json,
            "audit"
        );
        Ok(())
    }
}

/// Counters of an [`AuditWriter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditStats {
    pub submitted: u64,
    pub written: u64,
    pub failed: u64,
    /// Records rejected because the queue was full or the writer had stopped.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

enum Command {
    Write(AuditRecord),
    Flush(oneshot::Sender<()>),
}

/// Records waiting for the writer before new ones are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Sink writes running at the same time.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// Handle to the background audit writer. Clones share the same task.
#[derive(Clone, Default)]
pub struct AuditWriter {
    tx: Option<mpsc::Sender<Command>>,
    counters: Arc<Counters>,
}

impl AuditWriter {
    /// A writer that drops everything without touching any sink.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Starts the writer task on the current Tokio runtime with the default
    /// queue capacity and write concurrency.
    ///
    /// Outside a runtime the writer is created disabled and a warning is
    /// logged.
    pub fn spawn(sink: Arc<dyn AuditSink>) -> Self {
        Self::spawn_bounded(sink, DEFAULT_QUEUE_CAPACITY, DEFAULT_MAX_IN_FLIGHT)
    }

    /// Like [`AuditWriter::spawn`]. At most `queue_capacity` records wait for
    /// the writer and at most `max_in_flight` sink writes run concurrently.
    /// Both are raised to at least 1.
    pub fn spawn_bounded(
        sink: Arc<dyn AuditSink>,
        queue_capacity: usize,
        max_in_flight: usize,
    ) -> Self {
        let Ok(handle) = Handle::try_current() else {
            tracing::warn!("no tokio runtime available, audit logging disabled");
            return Self::disabled();
        };

        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let permits = u32::try_from(max_in_flight.max(1)).unwrap_or(u32::MAX);
        let counters = Arc::new(Counters::default());
        handle.spawn(run(rx, sink, Arc::clone(&counters), permits));

        AuditWriter {
            tx: Some(tx),
            counters,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queues a record. Returns immediately; the record is dropped when the
    /// queue is full.
    pub fn submit(&self, record: AuditRecord) {
        let Some(tx) = &self.tx else {
            return;
        };

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        if let Err(error) = tx.try_send(Command::Write(record)) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            let reason = match &error {
                TrySendError::Full(_) => "audit queue full",
                TrySendError::Closed(_) => "audit writer stopped",
            };
            if let Command::Write(record) = error.into_inner() {
                tracing::debug!(
                    response_id = %record.response_id,
                    step = record.step,
                    reason,
                    "audit record dropped"
                );
            }
        }
    }

    /// Resolves once every record submitted before this call went to the sink.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };

        let (done, wait) = oneshot::channel();
        if tx.send(Command::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    pub fn stats(&self) -> AuditStats {
        AuditStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn run(
    mut rx: mpsc::Receiver<Command>,
    sink: Arc<dyn AuditSink>,
    counters: Arc<Counters>,
    permits: u32,
) {
    let failures = global::meter("request_trace")
        .u64_counter("request_trace.audit.failures")
        .with_description("Audit records the sink failed to persist")
        .init();
    let in_flight = Arc::new(Semaphore::new(permits as usize));

    while let Some(command) = rx.recv().await {
        match command {
            Command::Write(record) => {
                let Ok(permit) = Arc::clone(&in_flight).acquire_owned().await else {
                    break;
                };
                let sink = Arc::clone(&sink);
                let counters = Arc::clone(&counters);
                let failures = failures.clone();

                tokio::spawn(async move {
                    let response_id = record.response_id.clone();
                    let step = record.step;
                    match sink.append(record).await {
                        Ok(()) => {
                            counters.written.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(error) => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            failures.add(1, &[]);
                            tracing::debug!(%response_id, step, %error, "audit write failed");
                        }
                    }
                    drop(permit);
                });
            }
            Command::Flush(done) => {
                // All permits free means every earlier write has returned.
                if let Ok(all) = in_flight.acquire_many(permits).await {
                    drop(all);
                }
                let _ = done.send(());
            }
        }
    }
}
