//! Binary-protocol transport collaborator.
//!
//! The memd agent dispatches query-like requests over its HTTP side channels
//! and reports back through a one-shot callback. A successful dispatch hands
//! over a [`MemdStreamHandle`] that yields rows in chunks until the trailing
//! metadata arrives.

use std::time::Instant;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::error::TransportResult;
use super::retry::CoreRetryStrategy;
use super::SpanContext;

/// N1QL request handed to the memd agent.
#[derive(Clone)]
pub struct MemdQueryRequest {
    /// Serialized JSON body
    pub payload: Bytes,
    /// Absolute deadline, computed once at dispatch
    pub deadline: Instant,
    /// Retry strategy consulted for every retry
    pub retry_strategy: Arc<dyn CoreRetryStrategy>,
    /// Parent span for transport-level tracing
    pub parent_span: Option<SpanContext>,
    /// Whether the statement is read-only (idempotent)
    pub read_only: bool,
}

/// Analytics request handed to the memd agent.
#[derive(Clone)]
pub struct MemdAnalyticsRequest {
    /// Serialized JSON body
    pub payload: Bytes,
    /// Request priority, -1 for high priority
    pub priority: i32,
    /// Absolute deadline
    pub deadline: Instant,
    /// Retry strategy
    pub retry_strategy: Arc<dyn CoreRetryStrategy>,
    /// Parent span
    pub parent_span: Option<SpanContext>,
    /// Whether the statement is read-only
    pub read_only: bool,
}

/// Search request handed to the memd agent.
#[derive(Clone)]
pub struct MemdSearchRequest {
    /// Target index
    pub index_name: String,
    /// Bucket for scope-level indexes
    pub bucket_name: Option<String>,
    /// Scope for scope-level indexes
    pub scope_name: Option<String>,
    /// Serialized JSON body
    pub payload: Bytes,
    /// Absolute deadline
    pub deadline: Instant,
    /// Retry strategy
    pub retry_strategy: Arc<dyn CoreRetryStrategy>,
    /// Parent span
    pub parent_span: Option<SpanContext>,
}

/// One batch of rows. `metadata` is set on the final chunk only.
#[derive(Debug, Clone, Default)]
pub struct MemdChunk {
    pub rows: Vec<Bytes>,
    pub metadata: Option<Bytes>,
}

impl MemdChunk {
    /// Intermediate chunk.
    pub fn rows(rows: Vec<Bytes>) -> Self {
        Self { rows, metadata: None }
    }

    /// Final chunk carrying the metadata envelope.
    pub fn last(rows: Vec<Bytes>, metadata: Bytes) -> Self {
        Self {
            rows,
            metadata: Some(metadata),
        }
    }
}

/// Open response stream. Dropping the handle releases its connection.
#[async_trait]
pub trait MemdStreamHandle: Send {
    /// Wait for the next chunk. Not called again after a chunk with metadata.
    async fn next_chunk(&mut self) -> TransportResult<MemdChunk>;

    /// Abort the response and release the connection.
    async fn close(&mut self) -> TransportResult<()>;

    /// Address of the node serving the stream.
    fn endpoint(&self) -> Option<String> {
        None
    }
}

/// Callback invoked exactly once when dispatch completes.
pub type MemdStreamCallback =
    Box<dyn FnOnce(TransportResult<Box<dyn MemdStreamHandle>>) + Send + 'static>;

/// Handle to an operation that has been dispatched but not yet answered.
pub trait PendingOp: Send + Sync {
    /// Cancel the operation. The callback still fires, with a cancellation error.
    fn cancel(&self);
}

/// Binary-protocol agent.
pub trait MemdAgent: Send + Sync {
    /// Dispatch an ad-hoc N1QL statement.
    fn n1ql_query(
        &self,
        request: MemdQueryRequest,
        callback: MemdStreamCallback,
    ) -> TransportResult<Box<dyn PendingOp>>;

    /// Dispatch a statement through the prepare-then-execute path.
    fn prepared_n1ql_query(
        &self,
        request: MemdQueryRequest,
        callback: MemdStreamCallback,
    ) -> TransportResult<Box<dyn PendingOp>>;

    /// Dispatch an analytics statement.
    fn analytics_query(
        &self,
        request: MemdAnalyticsRequest,
        callback: MemdStreamCallback,
    ) -> TransportResult<Box<dyn PendingOp>>;

    /// Dispatch a search request.
    fn search_query(
        &self,
        request: MemdSearchRequest,
        callback: MemdStreamCallback,
    ) -> TransportResult<Box<dyn PendingOp>>;
}
