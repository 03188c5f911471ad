//! Span and metric recording interface.
//!
//! Exporters live outside the driver. Operations open a span through
//! [`RequestTracer`] and record their latency through a [`Meter`]; both
//! default to no-op implementations.

use std::sync::Arc;
use std::time::Instant;

use crate::transport::SpanContext;

/// Span attribute keys.
pub mod attrs {
    pub const SYSTEM: &str = "db.system";
    pub const OPERATION: &str = "db.operation";
    pub const STATEMENT: &str = "db.statement";
    pub const BUCKET: &str = "db.name";
    pub const SCOPE: &str = "db.scope";
    pub const SERVICE: &str = "db.nimbus.service";
    pub const SYSTEM_VALUE: &str = "nimbus";
}

/// Metric name for operation latency, in microseconds.
pub const OPERATION_METER: &str = "db.nimbus.operations";

/// One traced unit of work.
pub trait RequestSpan: Send + Sync {
    /// Attach an attribute
    fn set_attribute(&self, key: &str, value: &str);
    /// Finish the span
    fn end(&self);
    /// Identifiers handed to the transport for child spans
    fn context(&self) -> Option<SpanContext> {
        None
    }
}

/// Span factory.
pub trait RequestTracer: Send + Sync {
    /// Start a span named `name` under `parent`.
    fn request_span(&self, name: &str, parent: Option<Arc<dyn RequestSpan>>) -> Arc<dyn RequestSpan>;
}

/// Records values into a histogram.
pub trait ValueRecorder: Send + Sync {
    fn record_value(&self, value: u64);
}

/// Recorder factory.
pub trait Meter: Send + Sync {
    /// Recorder for `name` with the given tags.
    fn value_recorder(&self, name: &str, tags: &[(&str, &str)]) -> Arc<dyn ValueRecorder>;
}

/// Tracer that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

/// Span that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSpan;

impl RequestSpan for NoopSpan {
    fn set_attribute(&self, _key: &str, _value: &str) {}
    fn end(&self) {}
}

impl RequestTracer for NoopTracer {
    fn request_span(&self, _name: &str, _parent: Option<Arc<dyn RequestSpan>>) -> Arc<dyn RequestSpan> {
        Arc::new(NoopSpan)
    }
}

/// Meter that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMeter;

/// Recorder that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopValueRecorder;

impl ValueRecorder for NoopValueRecorder {
    fn record_value(&self, _value: u64) {}
}

impl Meter for NoopMeter {
    fn value_recorder(&self, _name: &str, _tags: &[(&str, &str)]) -> Arc<dyn ValueRecorder> {
        Arc::new(NoopValueRecorder)
    }
}

// ============================================================================
// OperationObserver - span + latency for one call
// ============================================================================

/// Span and latency recorder for one operation.
pub(crate) struct OperationObserver {
    span: Arc<dyn RequestSpan>,
    recorder: Arc<dyn ValueRecorder>,
    started: Instant,
}

impl OperationObserver {
    /// Open the span and start the clock.
    pub(crate) fn start(
        tracer: &dyn RequestTracer,
        meter: &dyn Meter,
        service: &str,
        operation: &str,
        parent: Option<Arc<dyn RequestSpan>>,
    ) -> Self {
        let span = tracer.request_span(operation, parent);
        span.set_attribute(attrs::SYSTEM, attrs::SYSTEM_VALUE);
        span.set_attribute(attrs::SERVICE, service);
        span.set_attribute(attrs::OPERATION, operation);

        let recorder = meter.value_recorder(
            OPERATION_METER,
            &[(attrs::SERVICE, service), (attrs::OPERATION, operation)],
        );

        Self {
            span,
            recorder,
            started: Instant::now(),
        }
    }

    pub(crate) fn set_statement(&self, statement: &str) {
        self.span.set_attribute(attrs::STATEMENT, statement);
    }

    pub(crate) fn set_keyspace(&self, bucket: Option<&str>, scope: Option<&str>) {
        if let Some(bucket) = bucket {
            self.span.set_attribute(attrs::BUCKET, bucket);
        }
        if let Some(scope) = scope {
            self.span.set_attribute(attrs::SCOPE, scope);
        }
    }

    pub(crate) fn span_context(&self) -> Option<SpanContext> {
        self.span.context()
    }

    /// Record latency and end the span.
    pub(crate) fn finish(self) {
        let micros = self.started.elapsed().as_micros() as u64;
        self.recorder.record_value(micros);
        self.span.end();
    }
}
