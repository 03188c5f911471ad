//! Row reader over the streaming-RPC transport.
//!
//! The reader owns a [`CancelWatch`], so a failing `recv` can be reported
//! as a timeout, a cancellation or a plain service error.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Map, Value};

use super::cancel::{CancelCause, CancelWatch};
use super::{ReaderCore, ReaderState, RowReader};
use crate::driver::error::{DriverError, DriverResult};
use crate::driver::metadata::format_duration;
use crate::driver::normalize::RpcErrorScope;
use crate::transport::grpc::{
    BoxRpcStream, RpcAnalyticsMetaData, RpcAnalyticsResponse, RpcQueryMetaData, RpcQueryResponse,
    RpcSearchHit, RpcSearchMetaData, RpcSearchResponse, RpcWarning,
};

// ============================================================================
// ChunkDecoder - per-service message to rows + envelope
// ============================================================================

/// Turns streamed messages into rows and, at end of stream, the metadata
/// envelope in the same JSON shape the binary transport produces.
pub(crate) trait ChunkDecoder<R>: Send {
    /// Rows carried by one message. A row that cannot be decoded is an `Err`.
    fn decode(&mut self, msg: R) -> Vec<DriverResult<Bytes>>;

    /// Metadata envelope once the stream ended.
    fn finish(&mut self) -> DriverResult<Bytes>;
}

fn parse_json(bytes: &Bytes, what: &str) -> DriverResult<Value> {
    serde_json::from_slice(bytes)
        .map_err(|e| DriverError::decoding(format!("invalid {} payload: {}", what, e)))
}

fn opt_json(bytes: &Option<Bytes>, what: &str) -> DriverResult<Option<Value>> {
    bytes.as_ref().map(|b| parse_json(b, what)).transpose()
}

fn warnings_json(warnings: &[RpcWarning]) -> Value {
    Value::Array(
        warnings
            .iter()
            .map(|w| json!({ "code": w.code, "msg": w.message }))
            .collect(),
    )
}

fn envelope(value: Value) -> DriverResult<Bytes> {
    serde_json::to_vec(&value)
        .map(Bytes::from)
        .map_err(|e| DriverError::decoding(format!("failed to encode metadata: {}", e)))
}

/// Query responses.
#[derive(Debug, Default)]
pub(crate) struct QueryChunkDecoder {
    meta: Option<RpcQueryMetaData>,
}

impl ChunkDecoder<RpcQueryResponse> for QueryChunkDecoder {
    fn decode(&mut self, msg: RpcQueryResponse) -> Vec<DriverResult<Bytes>> {
        if msg.meta_data.is_some() {
            self.meta = msg.meta_data;
        }
        msg.rows.into_iter().map(Ok).collect()
    }

    fn finish(&mut self) -> DriverResult<Bytes> {
        let meta = self.meta.take().unwrap_or_default();
        let mut obj = Map::new();
        obj.insert("requestID".into(), json!(meta.request_id));
        obj.insert("clientContextID".into(), json!(meta.client_context_id));
        obj.insert("status".into(), json!(meta.status));
        if let Some(signature) = opt_json(&meta.signature, "signature")? {
            obj.insert("signature".into(), signature);
        }
        if let Some(profile) = opt_json(&meta.profile, "profile")? {
            obj.insert("profile".into(), profile);
        }
        if let Some(m) = meta.metrics {
            obj.insert(
                "metrics".into(),
                json!({
                    "elapsedTime": format_duration(m.elapsed_time),
                    "executionTime": format_duration(m.execution_time),
                    "resultCount": m.result_count,
                    "resultSize": m.result_size,
                    "mutationCount": m.mutation_count,
                    "sortCount": m.sort_count,
                    "errorCount": m.error_count,
                    "warningCount": m.warning_count,
                }),
            );
        }
        obj.insert("warnings".into(), warnings_json(&meta.warnings));
        envelope(Value::Object(obj))
    }
}

/// Analytics responses.
#[derive(Debug, Default)]
pub(crate) struct AnalyticsChunkDecoder {
    meta: Option<RpcAnalyticsMetaData>,
}

impl ChunkDecoder<RpcAnalyticsResponse> for AnalyticsChunkDecoder {
    fn decode(&mut self, msg: RpcAnalyticsResponse) -> Vec<DriverResult<Bytes>> {
        if msg.meta_data.is_some() {
            self.meta = msg.meta_data;
        }
        msg.rows.into_iter().map(Ok).collect()
    }

    fn finish(&mut self) -> DriverResult<Bytes> {
        let meta = self.meta.take().unwrap_or_default();
        let mut obj = Map::new();
        obj.insert("requestID".into(), json!(meta.request_id));
        obj.insert("clientContextID".into(), json!(meta.client_context_id));
        obj.insert("status".into(), json!("success"));
        if let Some(signature) = opt_json(&meta.signature, "signature")? {
            obj.insert("signature".into(), signature);
        }
        if let Some(m) = meta.metrics {
            obj.insert(
                "metrics".into(),
                json!({
                    "elapsedTime": format_duration(m.elapsed_time),
                    "executionTime": format_duration(m.execution_time),
                    "resultCount": m.result_count,
                    "resultSize": m.result_size,
                    "errorCount": m.error_count,
                    "warningCount": m.warning_count,
                    "processedObjects": m.processed_objects,
                }),
            );
        }
        obj.insert("warnings".into(), warnings_json(&meta.warnings));
        envelope(Value::Object(obj))
    }
}

/// Search responses. Hits become rows in the search service's hit JSON.
#[derive(Debug, Default)]
pub(crate) struct SearchChunkDecoder {
    meta: Option<RpcSearchMetaData>,
    facets: HashMap<String, Bytes>,
}

fn hit_json(hit: RpcSearchHit) -> DriverResult<Bytes> {
    let mut locations: Map<String, Value> = Map::new();
    for loc in &hit.locations {
        let field = locations
            .entry(loc.field.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(terms) = field {
            let entry = terms
                .entry(loc.term.clone())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(list) = entry {
                list.push(json!({
                    "pos": loc.position,
                    "start": loc.start,
                    "end": loc.end,
                    "array_positions": loc.array_positions,
                }));
            }
        }
    }

    let mut fields = Map::new();
    for (name, raw) in &hit.fields {
        fields.insert(name.clone(), parse_json(raw, "search field")?);
    }

    let mut obj = Map::new();
    obj.insert("index".into(), json!(hit.index));
    obj.insert("id".into(), json!(hit.id));
    obj.insert("score".into(), json!(hit.score));
    if let Some(explanation) = opt_json(&hit.explanation, "explanation")? {
        obj.insert("explanation".into(), explanation);
    }
    if !locations.is_empty() {
        obj.insert("locations".into(), Value::Object(locations));
    }
    if !hit.fragments.is_empty() {
        obj.insert("fragments".into(), json!(hit.fragments));
    }
    if !fields.is_empty() {
        obj.insert("fields".into(), Value::Object(fields));
    }
    envelope(Value::Object(obj))
}

impl ChunkDecoder<RpcSearchResponse> for SearchChunkDecoder {
    fn decode(&mut self, msg: RpcSearchResponse) -> Vec<DriverResult<Bytes>> {
        if msg.meta_data.is_some() {
            self.meta = msg.meta_data;
        }
        self.facets.extend(msg.facets);
        msg.hits.into_iter().map(hit_json).collect()
    }

    fn finish(&mut self) -> DriverResult<Bytes> {
        let meta = self.meta.take().unwrap_or_default();
        let metrics = meta.metrics.unwrap_or_default();

        let mut facets = Map::new();
        for (name, raw) in self.facets.drain() {
            facets.insert(name, parse_json(&raw, "facet")?);
        }

        envelope(json!({
            "status": {
                "total": metrics.total_partition_count,
                "failed": metrics.error_partition_count,
                "successful": metrics.success_partition_count,
                "errors": meta.errors,
            },
            "total_hits": metrics.total_rows,
            "max_score": metrics.max_score,
            "took": metrics.took.as_nanos() as u64,
            "facets": facets,
        }))
    }
}

// ============================================================================
// GrpcRowReader
// ============================================================================

/// Reader over a server-streaming RPC.
pub struct GrpcRowReader<R: Send + 'static> {
    stream: Option<BoxRpcStream<R>>,
    pending: Option<R>,
    decoder: Box<dyn ChunkDecoder<R>>,
    core: ReaderCore,
    watch: CancelWatch,
    scope: RpcErrorScope,
}

impl<R: Send + 'static> std::fmt::Debug for GrpcRowReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcRowReader")
            .field("state", &self.core.state())
            .field("service", &self.scope.service)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl<R: Send + 'static> GrpcRowReader<R> {
    /// Reader over `stream`, with `first` already received by the caller.
    /// `stream` is `None` when end of stream was already observed.
    pub(crate) fn new(
        stream: Option<BoxRpcStream<R>>,
        first: Option<R>,
        decoder: Box<dyn ChunkDecoder<R>>,
        watch: CancelWatch,
        scope: RpcErrorScope,
    ) -> Self {
        let mut reader = Self {
            stream,
            pending: first,
            decoder,
            core: ReaderCore::default(),
            watch,
            scope,
        };
        if reader.stream.is_none() && reader.pending.is_none() {
            reader.end_of_stream();
        }
        reader
    }

    fn absorb(&mut self, msg: R) {
        for row in self.decoder.decode(msg) {
            match row {
                Ok(row) => self.core.push_rows(Some(row)),
                Err(err) => self.core.record_decode_error(err),
            }
        }
    }

    fn end_of_stream(&mut self) {
        self.stream = None;
        match self.decoder.finish() {
            Ok(metadata) => self.core.finish(metadata),
            Err(err) => {
                self.core.record_decode_error(err);
                self.core.finish(Bytes::from_static(b"{}"));
            }
        }
        self.watch.release();
    }

    async fn fetch(&mut self) {
        if let Some(msg) = self.pending.take() {
            self.absorb(msg);
            return;
        }
        let Some(stream) = self.stream.as_mut() else {
            self.end_of_stream();
            return;
        };

        let token = self.watch.token();
        let next = tokio::select! {
            biased;
            r = stream.recv() => r,
            _ = token.cancelled() => Err(tonic::Status::cancelled("request context canceled")),
        };

        match next {
            Ok(Some(msg)) => self.absorb(msg),
            Ok(None) => self.end_of_stream(),
            Err(status) => {
                self.stream = None;
                let err = self.watch.map_status(status, &self.scope);
                self.core.fail(err);
                self.watch.release();
            }
        }
    }
}

#[async_trait]
impl<R: Send + 'static> RowReader for GrpcRowReader<R> {
    async fn next_row(&mut self) -> Option<Bytes> {
        loop {
            if let Some(row) = self.core.pop() {
                return Some(row);
            }
            if self.core.state() != ReaderState::Active {
                return None;
            }
            self.fetch().await;
        }
    }

    fn err(&self) -> Option<DriverError> {
        self.core.err()
    }

    fn metadata(&self) -> DriverResult<Bytes> {
        self.core.metadata()
    }

    async fn close(&mut self) -> DriverResult<()> {
        if !self.core.close_by_caller() {
            return self.core.close_result();
        }
        self.watch.cancel(CancelCause::Closed);
        self.pending = None;
        self.stream = None;
        Ok(())
    }

    fn state(&self) -> ReaderState {
        self.core.state()
    }
}

impl<R: Send + 'static> Drop for GrpcRowReader<R> {
    fn drop(&mut self) {
        self.watch.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use tokio_util::sync::CancellationToken;

    use crate::driver::error::ErrorContext;
    use crate::driver::normalize::RpcService;
    use crate::driver::metadata::{QueryMetaData, SearchMetaData, SearchRow};
    use crate::driver::testing::FakeRpcStream;
    use crate::transport::grpc::{RpcQueryMetrics, RpcSearchMetrics};

    fn query_scope() -> RpcErrorScope {
        RpcErrorScope::new(
            RpcService::Query,
            ErrorContext::for_statement("SELECT 1", Some("ctx".into())),
            false,
        )
    }

    fn rows(values: &[&'static str]) -> Vec<Bytes> {
        values.iter().map(|v| Bytes::from_static(v.as_bytes())).collect()
    }

    fn query_reader(
        messages: Vec<Result<Option<RpcQueryResponse>, tonic::Status>>,
        deadline: Duration,
    ) -> GrpcRowReader<RpcQueryResponse> {
        let watch = CancelWatch::new(Instant::now() + deadline);
        let stream: BoxRpcStream<RpcQueryResponse> = Box::new(FakeRpcStream::new(messages));
        GrpcRowReader::new(
            Some(stream),
            None,
            Box::new(QueryChunkDecoder::default()),
            watch,
            query_scope(),
        )
    }

    #[tokio::test]
    async fn test_rows_then_rendered_metadata() {
        let mut reader = query_reader(
            vec![
                Ok(Some(RpcQueryResponse {
                    rows: rows(&["{\"a\":1}", "{\"a\":2}"]),
                    meta_data: None,
                })),
                Ok(Some(RpcQueryResponse {
                    rows: Vec::new(),
                    meta_data: Some(RpcQueryMetaData {
                        request_id: "r-1".into(),
                        client_context_id: "ctx".into(),
                        status: "success".into(),
                        metrics: Some(RpcQueryMetrics {
                            elapsed_time: Duration::from_millis(12),
                            result_count: 2,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                })),
                Ok(None),
            ],
            Duration::from_secs(5),
        );

        assert!(reader.metadata().is_err());
        assert_eq!(reader.next_row().await.as_deref(), Some(&b"{\"a\":1}"[..]));
        assert_eq!(reader.next_row().await.as_deref(), Some(&b"{\"a\":2}"[..]));
        assert_eq!(reader.next_row().await, None);
        assert_eq!(reader.state(), ReaderState::ClosedClean);

        let meta = QueryMetaData::from_json(&reader.metadata().unwrap()).unwrap();
        assert_eq!(meta.request_id, "r-1");
        assert_eq!(meta.metrics.unwrap().elapsed_time, Duration::from_millis(12));
    }

    #[tokio::test]
    async fn test_service_error_is_sticky() {
        let mut reader = query_reader(
            vec![
                Ok(Some(RpcQueryResponse {
                    rows: rows(&["1"]),
                    meta_data: None,
                })),
                Err(tonic::Status::not_found("keyspace not found")),
            ],
            Duration::from_secs(5),
        );

        assert!(reader.next_row().await.is_some());
        assert!(reader.next_row().await.is_none());
        let err = reader.err().unwrap();
        assert!(matches!(err, DriverError::Query { .. }));
        assert_eq!(err.context().unwrap().statement.as_deref(), Some("SELECT 1"));
        assert_eq!(reader.err(), Some(err.clone()));
        assert_eq!(reader.close().await, Err(err));
    }

    #[tokio::test]
    async fn test_deadline_mid_stream_is_timeout() {
        let mut reader = query_reader(
            vec![Ok(Some(RpcQueryResponse {
                rows: rows(&["1"]),
                meta_data: None,
            }))],
            Duration::from_millis(30),
        );
        reader.watch.spawn(None);

        assert!(reader.next_row().await.is_some());
        // The fake stream blocks after its scripted messages.
        assert!(reader.next_row().await.is_none());
        assert!(matches!(
            reader.err(),
            Some(DriverError::AmbiguousTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_caller_cancel_mid_stream() {
        let mut reader = query_reader(
            vec![Ok(Some(RpcQueryResponse {
                rows: rows(&["1"]),
                meta_data: None,
            }))],
            Duration::from_secs(30),
        );
        let caller = CancellationToken::new();
        reader.watch.spawn(Some(caller.clone()));

        assert!(reader.next_row().await.is_some());
        caller.cancel();
        assert!(reader.next_row().await.is_none());
        assert!(matches!(reader.err(), Some(DriverError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_close_records_closed_cause() {
        let mut reader = query_reader(
            vec![Ok(Some(RpcQueryResponse {
                rows: rows(&["1", "2"]),
                meta_data: None,
            }))],
            Duration::from_secs(30),
        );
        assert!(reader.next_row().await.is_some());
        assert!(reader.close().await.is_ok());
        assert_eq!(reader.watch.cause(), Some(CancelCause::Closed));
        assert_eq!(reader.state(), ReaderState::ClosedByCaller);
        assert!(reader.next_row().await.is_none());
        assert!(reader.err().is_none());
    }

    #[tokio::test]
    async fn test_search_bad_hit_is_best_effort() {
        let good = RpcSearchHit {
            index: "idx".into(),
            id: "doc-1".into(),
            score: 1.0,
            fields: [("name".to_string(), Bytes::from_static(b"\"inn\""))].into(),
            ..Default::default()
        };
        let bad = RpcSearchHit {
            id: "doc-2".into(),
            fields: [("name".to_string(), Bytes::from_static(b"{not json"))].into(),
            ..Default::default()
        };
        let after = RpcSearchHit {
            id: "doc-3".into(),
            ..Default::default()
        };
        let stream: BoxRpcStream<RpcSearchResponse> = Box::new(FakeRpcStream::new(vec![
            Ok(Some(RpcSearchResponse {
                hits: vec![good, bad, after],
                facets: [("types".to_string(), Bytes::from_static(b"{\"field\":\"type\",\"total\":3}"))].into(),
                meta_data: Some(RpcSearchMetaData {
                    metrics: Some(RpcSearchMetrics {
                        total_rows: 3,
                        took: Duration::from_millis(2),
                        ..Default::default()
                    }),
                    errors: HashMap::new(),
                }),
            })),
            Ok(None),
        ]));
        let mut reader = GrpcRowReader::new(
            Some(stream),
            None,
            Box::new(SearchChunkDecoder::default()),
            CancelWatch::new(Instant::now() + Duration::from_secs(5)),
            RpcErrorScope::new(RpcService::Search, ErrorContext::for_index("idx"), true),
        );

        let first = reader.next_row().await.unwrap();
        assert_eq!(SearchRow::from_json(&first).unwrap().id, "doc-1");
        assert!(reader.err().is_none());
        let second = reader.next_row().await.unwrap();
        assert_eq!(SearchRow::from_json(&second).unwrap().id, "doc-3");
        assert!(reader.next_row().await.is_none());

        assert!(matches!(reader.err(), Some(DriverError::Decoding(_))));
        let meta = SearchMetaData::from_json(&reader.metadata().unwrap()).unwrap();
        assert_eq!(meta.metrics.total_rows, 3);
        assert_eq!(meta.facets["types"].total, 3);
    }
}
