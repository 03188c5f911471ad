//! Transport collaborators.
//!
//! This layer describes the two wire transports the driver can sit on, as
//! narrow capability traits:
//!
//! ```text
//! driver providers
//!   ├── memd    (binary protocol agent, callback dispatch + chunked rows)
//!   ├── grpc    (server-streaming RPC clients)
//!   └── monitor (connection-pool diagnostics and probes)
//! ```
//!
//! Errors from either side are expressed as [`TransportError`], and retries
//! run inside the transport against a [`CoreRetryStrategy`].

pub mod error;
pub mod grpc;
pub mod memd;
pub mod monitor;
pub mod retry;

pub use error::{
    AnalyticsErrorDesc, AnalyticsErrorRecord, HttpErrorRecord, KeyValueErrorRecord,
    QueryErrorDesc, QueryErrorRecord, RetryInfo, SearchErrorRecord, ServerErrorKind,
    TimeoutErrorRecord, TransportError, TransportResult, ViewErrorDesc, ViewErrorRecord,
};
pub use grpc::{GrpcAnalyticsClient, GrpcQueryClient, GrpcSearchClient};
pub use memd::{
    MemdAgent, MemdAnalyticsRequest, MemdChunk, MemdQueryRequest, MemdSearchRequest,
    MemdStreamCallback, MemdStreamHandle, PendingOp,
};
pub use monitor::{
    ConnectionMonitor, CoreEndpointState, CoreServiceType, DiagnosticsSnapshot, EndpointProbe,
    EndpointSnapshot, ProbeOutcome,
};
pub use retry::{CoreRetryAction, CoreRetryReason, CoreRetryRequest, CoreRetryState, CoreRetryStrategy};

/// Identifiers of the span a transport request is nested under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
}
