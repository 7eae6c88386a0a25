//! Span collaborator invoked around every task execution.
//!
//! Telemetry sinks live outside this crate. The runtime only promises to
//! call `start_span` before a task body runs and `end_span` after it
//! returns; both are fire-and-forget.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque span handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(pub u64);

/// Receives task spans.
pub trait Tracer: Send + Sync {
    fn start_span(&self, name: &str, metadata: &BTreeMap<String, String>) -> SpanId;

    fn end_span(&self, span: SpanId, item_count: usize);
}

/// Default tracer: forwards spans to `tracing` events.
#[derive(Debug, Default)]
pub struct LogTracer {
    next_id: AtomicU64,
}

impl LogTracer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for LogTracer {
    fn start_span(&self, name: &str, metadata: &BTreeMap<String, String>) -> SpanId {
        let id = SpanId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(span = id.0, name, ?metadata, "span started");
        id
    }

    fn end_span(&self, span: SpanId, item_count: usize) {
        tracing::debug!(span = span.0, item_count, "span ended");
    }
}
