//! # Request trace
//! This crate keeps a per-request trace inside a service process: a step
//! counter, the time between steps and an application correlation id, keyed by
//! a [`ResponseId`] that is handed out when a request or message arrives and
//! removed when its response is built.
//!
//! ## Setup
//! Logging (and optionally OTLP export) can be set up using [`setup::setup`].
//! This should be the first call of any server binary. A [`Tracer`] is then
//! built once and shared:
//!
//! ```ignore
//! let tracer = Tracer::builder().config(TraceConfig::from_env()?).build();
//! ```
//!
//! ## Lifecycle
//! - A trace begins in [`Tracer::begin`], usually through one of the
//!   [`middleware`] adapters, or in [`Tracer::trace_message`] for pub/sub
//!   deliveries. The returned [`TraceScope`] finalizes the trace on drop.
//! - Outbound calls made on behalf of the request go through [`Tracer::call`],
//!   each one a new step.
//! - [`Tracer::finish`] logs the final step, writes the last audit record and
//!   removes the trace.
//!
//! Every stage emits a [`TraceEvent`] and, when audit logging is enabled,
//! queues an [`AuditRecord`]. Neither can change the outcome of the request.
//!
//! When using [`tower`] based http frameworks like [`axum`](https://docs.rs/axum/latest/axum), the middleware `middleware::tower::TraceLayer` can
//! be used (feature `tower`); for actix-web use `middleware::actix::TraceLayer`
//! (feature `actix`).

pub mod audit;
pub mod config;
pub mod correlation;
pub mod event;
pub mod lifecycle;
pub mod middleware;
pub mod outbound;
pub mod response;
pub mod setup;
pub mod store;

pub use audit::{AuditRecord, AuditSink, AuditStats, AuditWriter};
pub use config::{TelemetryConfig, TraceConfig};
pub use event::{EventSink, TraceEvent};
pub use lifecycle::{RequestHead, TraceScope, Tracer};
pub use outbound::{OutboundError, OutboundRequest, OutboundResponse, Transport, TransportError};
pub use response::{FinalResponse, Language, MessageCatalog, Outcome, ResponseShape};
pub use store::{Checkpoint, ResponseId, TraceError, TraceStore};
