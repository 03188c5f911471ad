//! In-memory transport fakes for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::driver::observability::{Meter, RequestSpan, RequestTracer, ValueRecorder};
use crate::transport::grpc::{
    BoxRpcStream, GrpcAnalyticsClient, GrpcQueryClient, GrpcSearchClient, RpcAnalyticsRequest,
    RpcAnalyticsResponse, RpcCallContext, RpcQueryRequest, RpcQueryResponse, RpcSearchRequest,
    RpcSearchResponse, RpcStream,
};
use crate::transport::{
    ConnectionMonitor, CoreEndpointState, CoreServiceType, DiagnosticsSnapshot, EndpointProbe,
    EndpointSnapshot, MemdAgent, MemdAnalyticsRequest, MemdChunk, MemdQueryRequest,
    MemdSearchRequest, MemdStreamCallback, MemdStreamHandle, PendingOp, ProbeOutcome,
    QueryErrorRecord, ServerErrorKind, TransportError, TransportResult,
};

// ============================================================================
// Memd stream
// ============================================================================

/// Observes what happened to a [`FakeMemdStream`].
#[derive(Debug, Clone, Default)]
pub struct StreamTrace {
    dropped: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl StreamTrace {
    pub fn dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Scripted chunk stream. Blocks forever once the script runs out.
pub struct FakeMemdStream {
    chunks: VecDeque<TransportResult<MemdChunk>>,
    trace: StreamTrace,
}

impl FakeMemdStream {
    pub fn new(chunks: Vec<TransportResult<MemdChunk>>) -> (Self, StreamTrace) {
        let trace = StreamTrace::default();
        (
            Self {
                chunks: chunks.into(),
                trace: trace.clone(),
            },
            trace,
        )
    }
}

#[async_trait]
impl MemdStreamHandle for FakeMemdStream {
    async fn next_chunk(&mut self) -> TransportResult<MemdChunk> {
        match self.chunks.pop_front() {
            Some(chunk) => chunk,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.trace.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn endpoint(&self) -> Option<String> {
        Some("10.0.0.1:8093".to_string())
    }
}

impl Drop for FakeMemdStream {
    fn drop(&mut self) {
        self.trace.dropped.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Memd agent
// ============================================================================

/// How the fake agent answers the next dispatch.
pub enum FakeDispatch {
    /// Callback receives a stream with these chunks
    Stream(Vec<TransportResult<MemdChunk>>),
    /// Callback receives this error
    Fail(TransportError),
    /// Dispatch itself returns this error; the callback never fires
    Reject(TransportError),
    /// Callback only fires, with a cancellation error, once the op is canceled
    Hang,
}

/// A request the fake agent received.
#[derive(Clone)]
pub enum RecordedDispatch {
    Query { prepared: bool, request: MemdQueryRequest },
    Analytics(MemdAnalyticsRequest),
    Search(MemdSearchRequest),
}

impl RecordedDispatch {
    pub fn payload_json(&self) -> serde_json::Value {
        let payload = match self {
            Self::Query { request, .. } => &request.payload,
            Self::Analytics(request) => &request.payload,
            Self::Search(request) => &request.payload,
        };
        serde_json::from_slice(payload).unwrap()
    }

    pub fn deadline(&self) -> Instant {
        match self {
            Self::Query { request, .. } => request.deadline,
            Self::Analytics(request) => request.deadline,
            Self::Search(request) => request.deadline,
        }
    }
}

struct FakePendingOp {
    callback: Arc<Mutex<Option<MemdStreamCallback>>>,
    cancelled: Arc<AtomicBool>,
}

impl PendingOp for FakePendingOp {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(callback) = self.callback.lock().take() {
            callback(Err(TransportError::Query(Box::new(QueryErrorRecord {
                kind: Some(ServerErrorKind::RequestCanceled),
                error_text: "request canceled".into(),
                ..Default::default()
            }))));
        }
    }
}

/// Scripted memd agent.
#[derive(Default)]
pub struct FakeMemdAgent {
    script: Mutex<VecDeque<FakeDispatch>>,
    recorded: Mutex<Vec<RecordedDispatch>>,
    cancelled: Arc<AtomicBool>,
}

impl FakeMemdAgent {
    pub fn new(script: Vec<FakeDispatch>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn recorded(&self) -> Vec<RecordedDispatch> {
        self.recorded.lock().clone()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn dispatch(
        &self,
        recorded: RecordedDispatch,
        callback: MemdStreamCallback,
    ) -> TransportResult<Box<dyn PendingOp>> {
        self.recorded.lock().push(recorded);
        let next = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| FakeDispatch::Stream(vec![Ok(MemdChunk::last(vec![], Bytes::from_static(b"{}")))]));

        let slot = Arc::new(Mutex::new(None));
        match next {
            FakeDispatch::Stream(chunks) => {
                let (stream, _trace) = FakeMemdStream::new(chunks);
                callback(Ok(Box::new(stream)));
            }
            FakeDispatch::Fail(err) => callback(Err(err)),
            FakeDispatch::Reject(err) => return Err(err),
            FakeDispatch::Hang => *slot.lock() = Some(callback),
        }
        Ok(Box::new(FakePendingOp {
            callback: slot,
            cancelled: self.cancelled.clone(),
        }))
    }
}

impl MemdAgent for FakeMemdAgent {
    fn n1ql_query(
        &self,
        request: MemdQueryRequest,
        callback: MemdStreamCallback,
    ) -> TransportResult<Box<dyn PendingOp>> {
        self.dispatch(RecordedDispatch::Query { prepared: false, request }, callback)
    }

    fn prepared_n1ql_query(
        &self,
        request: MemdQueryRequest,
        callback: MemdStreamCallback,
    ) -> TransportResult<Box<dyn PendingOp>> {
        self.dispatch(RecordedDispatch::Query { prepared: true, request }, callback)
    }

    fn analytics_query(
        &self,
        request: MemdAnalyticsRequest,
        callback: MemdStreamCallback,
    ) -> TransportResult<Box<dyn PendingOp>> {
        self.dispatch(RecordedDispatch::Analytics(request), callback)
    }

    fn search_query(
        &self,
        request: MemdSearchRequest,
        callback: MemdStreamCallback,
    ) -> TransportResult<Box<dyn PendingOp>> {
        self.dispatch(RecordedDispatch::Search(request), callback)
    }
}

// ============================================================================
// RPC stream and clients
// ============================================================================

/// Scripted RPC stream. Blocks forever once the script runs out.
pub struct FakeRpcStream<T> {
    messages: VecDeque<Result<Option<T>, tonic::Status>>,
}

impl<T> FakeRpcStream<T> {
    pub fn new(messages: Vec<Result<Option<T>, tonic::Status>>) -> Self {
        Self {
            messages: messages.into(),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> RpcStream<T> for FakeRpcStream<T> {
    async fn recv(&mut self) -> Result<Option<T>, tonic::Status> {
        match self.messages.pop_front() {
            Some(msg) => msg,
            None => std::future::pending().await,
        }
    }
}

/// How a fake RPC client answers the next call.
pub enum FakeRpc<T> {
    Stream(Vec<Result<Option<T>, tonic::Status>>),
    Reject(tonic::Status),
    /// Never answers; resolves with `Cancelled` once the call context is canceled
    Hang,
}

/// Scripted RPC client for one service.
pub struct FakeRpcClient<Req, Resp> {
    script: Mutex<VecDeque<FakeRpc<Resp>>>,
    requests: Mutex<Vec<Req>>,
    deadlines: Mutex<Vec<Instant>>,
}

impl<Req, Resp> FakeRpcClient<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(script: Vec<FakeRpc<Resp>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            deadlines: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<Req> {
        self.requests.lock().clone()
    }

    pub fn deadlines(&self) -> Vec<Instant> {
        self.deadlines.lock().clone()
    }

    async fn call(&self, req: Req, ctx: RpcCallContext) -> Result<BoxRpcStream<Resp>, tonic::Status> {
        self.requests.lock().push(req);
        self.deadlines.lock().push(ctx.deadline);
        let next = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| FakeRpc::Stream(vec![Ok(None)]));
        match next {
            FakeRpc::Stream(messages) => Ok(Box::new(FakeRpcStream::new(messages))),
            FakeRpc::Reject(status) => Err(status),
            FakeRpc::Hang => {
                ctx.cancellation.cancelled().await;
                Err(tonic::Status::cancelled("context canceled"))
            }
        }
    }
}

pub type FakeQueryClient = FakeRpcClient<RpcQueryRequest, RpcQueryResponse>;
pub type FakeAnalyticsClient = FakeRpcClient<RpcAnalyticsRequest, RpcAnalyticsResponse>;
pub type FakeSearchClient = FakeRpcClient<RpcSearchRequest, RpcSearchResponse>;

#[async_trait]
impl GrpcQueryClient for FakeQueryClient {
    async fn query(
        &self,
        request: RpcQueryRequest,
        ctx: RpcCallContext,
    ) -> Result<BoxRpcStream<RpcQueryResponse>, tonic::Status> {
        self.call(request, ctx).await
    }
}

#[async_trait]
impl GrpcAnalyticsClient for FakeAnalyticsClient {
    async fn analytics_query(
        &self,
        request: RpcAnalyticsRequest,
        ctx: RpcCallContext,
    ) -> Result<BoxRpcStream<RpcAnalyticsResponse>, tonic::Status> {
        self.call(request, ctx).await
    }
}

#[async_trait]
impl GrpcSearchClient for FakeSearchClient {
    async fn search_query(
        &self,
        request: RpcSearchRequest,
        ctx: RpcCallContext,
    ) -> Result<BoxRpcStream<RpcSearchResponse>, tonic::Status> {
        self.call(request, ctx).await
    }
}

// ============================================================================
// Connection monitor
// ============================================================================

/// Endpoint snapshot with fixed addresses.
pub fn endpoint(service: CoreServiceType, id: &str, state: CoreEndpointState) -> EndpointSnapshot {
    EndpointSnapshot {
        service,
        id: id.to_string(),
        local_address: "127.0.0.1:50000".to_string(),
        remote_address: "10.0.0.1:11210".to_string(),
        state,
        last_activity: None,
        namespace: None,
    }
}

/// Probe result with fixed addresses.
pub fn probe(id: &str, outcome: ProbeOutcome, latency: Duration) -> EndpointProbe {
    EndpointProbe {
        id: id.to_string(),
        local_address: "127.0.0.1:50000".to_string(),
        remote_address: "10.0.0.1:8093".to_string(),
        outcome,
        latency,
        namespace: None,
    }
}

/// Scripted connection monitor. The last snapshot repeats once the script runs out.
#[derive(Default)]
pub struct FakeMonitor {
    snapshots: Mutex<VecDeque<DiagnosticsSnapshot>>,
    probes: Mutex<HashMap<CoreServiceType, TransportResult<Vec<EndpointProbe>>>>,
    diagnostics_calls: AtomicU32,
}

impl FakeMonitor {
    pub fn new(snapshots: Vec<DiagnosticsSnapshot>) -> Self {
        Self {
            snapshots: Mutex::new(snapshots.into()),
            ..Default::default()
        }
    }

    pub fn with_probes(
        self,
        service: CoreServiceType,
        result: TransportResult<Vec<EndpointProbe>>,
    ) -> Self {
        self.probes.lock().insert(service, result);
        self
    }

    pub fn diagnostics_calls(&self) -> u32 {
        self.diagnostics_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionMonitor for FakeMonitor {
    fn diagnostics(&self, _bucket: Option<&str>) -> TransportResult<DiagnosticsSnapshot> {
        self.diagnostics_calls.fetch_add(1, Ordering::SeqCst);
        let mut snapshots = self.snapshots.lock();
        if snapshots.len() > 1 {
            return Ok(snapshots.pop_front().unwrap_or_default());
        }
        Ok(snapshots.front().cloned().unwrap_or_default())
    }

    async fn ping(
        &self,
        service: CoreServiceType,
        _bucket: Option<&str>,
        _deadline: Instant,
    ) -> TransportResult<Vec<EndpointProbe>> {
        self.probes
            .lock()
            .get(&service)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

// ============================================================================
// Observability
// ============================================================================

/// Span that keeps its attributes and whether it ended.
#[derive(Default)]
pub struct RecordingSpan {
    pub attrs: Mutex<Vec<(String, String)>>,
    pub ended: Mutex<bool>,
}

impl RecordingSpan {
    pub fn ended(&self) -> bool {
        *self.ended.lock()
    }
}

impl RequestSpan for RecordingSpan {
    fn set_attribute(&self, key: &str, value: &str) {
        self.attrs.lock().push((key.to_string(), value.to_string()));
    }

    fn end(&self) {
        *self.ended.lock() = true;
    }
}

/// Tracer handing out one shared [`RecordingSpan`].
pub struct RecordingTracer(pub Arc<RecordingSpan>);

impl RequestTracer for RecordingTracer {
    fn request_span(&self, _name: &str, _parent: Option<Arc<dyn RequestSpan>>) -> Arc<dyn RequestSpan> {
        self.0.clone()
    }
}

/// Meter collecting every recorded value.
#[derive(Default)]
pub struct RecordingMeter(pub Arc<Mutex<Vec<u64>>>);

struct Recorder(Arc<Mutex<Vec<u64>>>);

impl ValueRecorder for Recorder {
    fn record_value(&self, value: u64) {
        self.0.lock().push(value);
    }
}

impl Meter for RecordingMeter {
    fn value_recorder(&self, _name: &str, _tags: &[(&str, &str)]) -> Arc<dyn ValueRecorder> {
        Arc::new(Recorder(self.0.clone()))
    }
}
