//! Streaming-RPC transport collaborator.
//!
//! Each service exposes one server-streaming call. The call resolves once
//! the server accepted the request; rows then arrive through
//! [`RpcStream::recv`], which yields `Ok(None)` at end of stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::retry::CoreRetryStrategy;
use super::SpanContext;

/// Per-call context shared by every RPC.
#[derive(Clone)]
pub struct RpcCallContext {
    /// Canceled when the caller gives up, the deadline passes, or the stream closes
    pub cancellation: CancellationToken,
    /// Absolute deadline
    pub deadline: Instant,
    /// Retry strategy
    pub retry_strategy: Arc<dyn CoreRetryStrategy>,
    /// Parent span
    pub parent_span: Option<SpanContext>,
}

/// Server-streaming response.
#[async_trait]
pub trait RpcStream<T: Send + 'static>: Send {
    /// Receive the next message; `Ok(None)` marks end of stream.
    async fn recv(&mut self) -> Result<Option<T>, tonic::Status>;
}

/// Boxed response stream.
pub type BoxRpcStream<T> = Box<dyn RpcStream<T>>;

// ============================================================================
// Shared message types
// ============================================================================

/// Scan consistency on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcScanConsistency {
    NotBounded,
    RequestPlus,
}

/// Mutation token on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMutationToken {
    pub bucket_name: String,
    pub vbucket_id: u16,
    pub vbucket_uuid: u64,
    pub seq_no: u64,
}

/// Warning entry on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcWarning {
    pub code: u32,
    pub message: String,
}

// ============================================================================
// Query
// ============================================================================

/// Query profiling mode on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcProfileMode {
    Off,
    Phases,
    Timings,
}

/// Query tuning knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcQueryTuning {
    pub max_parallelism: Option<u32>,
    pub pipeline_batch: Option<u32>,
    pub pipeline_cap: Option<u32>,
    pub scan_wait: Option<Duration>,
    pub scan_cap: Option<u32>,
    pub disable_metrics: bool,
}

/// Query request.
#[derive(Debug, Clone, Default)]
pub struct RpcQueryRequest {
    pub statement: String,
    pub bucket_name: Option<String>,
    pub scope_name: Option<String>,
    pub read_only: Option<bool>,
    pub prepared: Option<bool>,
    pub tuning: Option<RpcQueryTuning>,
    pub client_context_id: Option<String>,
    pub scan_consistency: Option<RpcScanConsistency>,
    pub positional_parameters: Vec<Bytes>,
    pub named_parameters: HashMap<String, Bytes>,
    pub flex_index: Option<bool>,
    pub preserve_expiry: Option<bool>,
    pub consistent_with: Vec<RpcMutationToken>,
    pub profile_mode: Option<RpcProfileMode>,
}

/// Query metrics on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcQueryMetrics {
    pub elapsed_time: Duration,
    pub execution_time: Duration,
    pub result_count: u64,
    pub result_size: u64,
    pub mutation_count: u64,
    pub sort_count: u64,
    pub error_count: u64,
    pub warning_count: u64,
}

/// Trailing query metadata.
#[derive(Debug, Clone, Default)]
pub struct RpcQueryMetaData {
    pub request_id: String,
    pub client_context_id: String,
    pub status: String,
    pub signature: Option<Bytes>,
    pub profile: Option<Bytes>,
    pub metrics: Option<RpcQueryMetrics>,
    pub warnings: Vec<RpcWarning>,
}

/// One streamed query response message.
#[derive(Debug, Clone, Default)]
pub struct RpcQueryResponse {
    pub rows: Vec<Bytes>,
    pub meta_data: Option<RpcQueryMetaData>,
}

/// Query service client.
#[async_trait]
pub trait GrpcQueryClient: Send + Sync {
    /// Start a streaming query.
    async fn query(
        &self,
        request: RpcQueryRequest,
        ctx: RpcCallContext,
    ) -> Result<BoxRpcStream<RpcQueryResponse>, tonic::Status>;
}

// ============================================================================
// Analytics
// ============================================================================

/// Analytics request.
#[derive(Debug, Clone, Default)]
pub struct RpcAnalyticsRequest {
    pub statement: String,
    pub bucket_name: Option<String>,
    pub scope_name: Option<String>,
    pub read_only: Option<bool>,
    pub client_context_id: Option<String>,
    pub priority: Option<bool>,
    pub scan_consistency: Option<RpcScanConsistency>,
    pub positional_parameters: Vec<Bytes>,
    pub named_parameters: HashMap<String, Bytes>,
}

/// Analytics metrics on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcAnalyticsMetrics {
    pub elapsed_time: Duration,
    pub execution_time: Duration,
    pub result_count: u64,
    pub result_size: u64,
    pub error_count: u64,
    pub warning_count: u64,
    pub processed_objects: u64,
}

/// Trailing analytics metadata.
#[derive(Debug, Clone, Default)]
pub struct RpcAnalyticsMetaData {
    pub request_id: String,
    pub client_context_id: String,
    pub signature: Option<Bytes>,
    pub metrics: Option<RpcAnalyticsMetrics>,
    pub warnings: Vec<RpcWarning>,
}

/// One streamed analytics response message.
#[derive(Debug, Clone, Default)]
pub struct RpcAnalyticsResponse {
    pub rows: Vec<Bytes>,
    pub meta_data: Option<RpcAnalyticsMetaData>,
}

/// Analytics service client.
#[async_trait]
pub trait GrpcAnalyticsClient: Send + Sync {
    /// Start a streaming analytics query.
    async fn analytics_query(
        &self,
        request: RpcAnalyticsRequest,
        ctx: RpcCallContext,
    ) -> Result<BoxRpcStream<RpcAnalyticsResponse>, tonic::Status>;
}

// ============================================================================
// Search
// ============================================================================

/// Search request. Query, vector, sort and facet payloads travel as JSON.
#[derive(Debug, Clone, Default)]
pub struct RpcSearchRequest {
    pub index_name: String,
    pub bucket_name: Option<String>,
    pub scope_name: Option<String>,
    pub query: serde_json::Value,
    pub vector_search: Option<serde_json::Value>,
    pub scan_consistency: Option<RpcScanConsistency>,
    pub consistent_with: Vec<RpcMutationToken>,
    pub limit: Option<u32>,
    pub skip: Option<u32>,
    pub explain: Option<bool>,
    pub highlight_style: Option<String>,
    pub highlight_fields: Vec<String>,
    pub fields: Vec<String>,
    pub sort: Option<serde_json::Value>,
    pub facets: HashMap<String, serde_json::Value>,
    pub disable_scoring: bool,
    pub collections: Vec<String>,
    pub include_locations: bool,
}

/// Term location inside a hit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcSearchLocation {
    pub field: String,
    pub term: String,
    pub position: u32,
    pub start: u32,
    pub end: u32,
    pub array_positions: Vec<u32>,
}

/// One search hit.
#[derive(Debug, Clone, Default)]
pub struct RpcSearchHit {
    pub index: String,
    pub id: String,
    pub score: f64,
    pub explanation: Option<Bytes>,
    pub locations: Vec<RpcSearchLocation>,
    pub fragments: HashMap<String, Vec<String>>,
    pub fields: HashMap<String, Bytes>,
}

/// Search metrics on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpcSearchMetrics {
    pub took: Duration,
    pub total_rows: u64,
    pub max_score: f64,
    pub total_partition_count: u64,
    pub success_partition_count: u64,
    pub error_partition_count: u64,
}

/// Trailing search metadata.
#[derive(Debug, Clone, Default)]
pub struct RpcSearchMetaData {
    pub metrics: Option<RpcSearchMetrics>,
    pub errors: HashMap<String, String>,
}

/// One streamed search response message.
#[derive(Debug, Clone, Default)]
pub struct RpcSearchResponse {
    pub hits: Vec<RpcSearchHit>,
    pub facets: HashMap<String, Bytes>,
    pub meta_data: Option<RpcSearchMetaData>,
}

/// Search service client.
#[async_trait]
pub trait GrpcSearchClient: Send + Sync {
    /// Start a streaming search.
    async fn search_query(
        &self,
        request: RpcSearchRequest,
        ctx: RpcCallContext,
    ) -> Result<BoxRpcStream<RpcSearchResponse>, tonic::Status>;
}
