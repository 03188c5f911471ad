//! Provider over the streaming-RPC clients.
//!
//! The initial call blocks until the first response message arrives or the
//! request fails, so immediate failures (bad index, parse error) surface from
//! the call itself. The stream is then handed to a [`GrpcRowReader`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use super::{context_id, observed, AnalyticsProvider, CallSettings, Keyspace, QueryProvider, SearchProvider};
use crate::driver::config::ClusterConfig;
use crate::driver::error::{DriverError, DriverResult, ErrorContext};
use crate::driver::health::ServiceType;
use crate::driver::normalize::{RpcErrorScope, RpcService};
use crate::driver::observability::{OperationObserver, RequestSpan};
use crate::driver::options::{
    AnalyticsOptions, AnalyticsScanConsistency, MutationState, QueryOptions, QueryProfileMode,
    QueryScanConsistency, SearchOptions,
};
use crate::driver::result::{AnalyticsResult, QueryResult, ResultStream, SearchResult};
use crate::driver::search::{SearchRequest, SearchSort};
use crate::driver::stream::{
    AnalyticsChunkDecoder, CancelWatch, ChunkDecoder, GrpcRowReader, QueryChunkDecoder,
    SearchChunkDecoder,
};
use crate::transport::grpc::{
    BoxRpcStream, GrpcAnalyticsClient, GrpcQueryClient, GrpcSearchClient, RpcAnalyticsRequest,
    RpcCallContext, RpcMutationToken, RpcProfileMode, RpcQueryRequest, RpcQueryTuning,
    RpcScanConsistency, RpcSearchRequest,
};

/// Provider backed by the streaming-RPC clients.
pub struct GrpcProvider {
    query: Arc<dyn GrpcQueryClient>,
    analytics: Arc<dyn GrpcAnalyticsClient>,
    search: Arc<dyn GrpcSearchClient>,
    config: Arc<ClusterConfig>,
}

impl std::fmt::Debug for GrpcProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Request building
// ============================================================================

fn encode_param(value: &Value, context: &ErrorContext) -> DriverResult<Bytes> {
    serde_json::to_vec(value).map(Bytes::from).map_err(|e| {
        DriverError::encoding(format!("failed to encode parameter: {}", e), context.clone())
    })
}

fn encode_params(
    positional: &[Value],
    named: &std::collections::BTreeMap<String, Value>,
    context: &ErrorContext,
) -> DriverResult<(Vec<Bytes>, HashMap<String, Bytes>)> {
    let positional = positional
        .iter()
        .map(|v| encode_param(v, context))
        .collect::<DriverResult<Vec<_>>>()?;
    let mut encoded = HashMap::with_capacity(named.len());
    for (name, value) in named {
        encoded.insert(name.clone(), encode_param(value, context)?);
    }
    Ok((positional, encoded))
}

fn mutation_tokens(state: &Option<MutationState>) -> Vec<RpcMutationToken> {
    state
        .iter()
        .flat_map(|s| s.tokens())
        .map(|t| RpcMutationToken {
            bucket_name: t.bucket_name.clone(),
            vbucket_id: t.partition_id,
            vbucket_uuid: t.partition_uuid,
            seq_no: t.sequence_number,
        })
        .collect()
}

fn unsupported_raw(raw: &HashMap<String, Value>) -> DriverResult<()> {
    if raw.is_empty() {
        Ok(())
    } else {
        Err(DriverError::feature_not_available(
            "raw options are not supported over the streaming transport",
        ))
    }
}

fn query_request(
    statement: &str,
    options: &QueryOptions,
    keyspace: &Keyspace,
    client_context_id: Option<String>,
    context: &ErrorContext,
) -> DriverResult<RpcQueryRequest> {
    unsupported_raw(&options.raw)?;
    if options.use_replica.is_some() {
        return Err(DriverError::feature_not_available(
            "use replica is not supported over the streaming transport",
        ));
    }

    let tuning = RpcQueryTuning {
        max_parallelism: options.max_parallelism,
        pipeline_batch: options.pipeline_batch,
        pipeline_cap: options.pipeline_cap,
        scan_wait: options.scan_wait,
        scan_cap: options.scan_cap,
        disable_metrics: !options.metrics,
    };
    let (positional_parameters, named_parameters) =
        encode_params(&options.positional_parameters, &options.named_parameters, context)?;

    Ok(RpcQueryRequest {
        statement: statement.to_string(),
        bucket_name: keyspace.bucket.clone(),
        scope_name: keyspace.scope.clone(),
        read_only: options.readonly.then_some(true),
        prepared: Some(!options.adhoc),
        tuning: (tuning != RpcQueryTuning::default()).then_some(tuning),
        client_context_id,
        scan_consistency: options.scan_consistency.map(|c| match c {
            QueryScanConsistency::NotBounded => RpcScanConsistency::NotBounded,
            QueryScanConsistency::RequestPlus => RpcScanConsistency::RequestPlus,
        }),
        positional_parameters,
        named_parameters,
        flex_index: options.flex_index.then_some(true),
        preserve_expiry: options.preserve_expiry.then_some(true),
        consistent_with: mutation_tokens(&options.consistent_with),
        profile_mode: match options.profile {
            QueryProfileMode::None => None,
            QueryProfileMode::Phases => Some(RpcProfileMode::Phases),
            QueryProfileMode::Timings => Some(RpcProfileMode::Timings),
        },
    })
}

fn analytics_request(
    statement: &str,
    options: &AnalyticsOptions,
    keyspace: &Keyspace,
    client_context_id: Option<String>,
    context: &ErrorContext,
) -> DriverResult<RpcAnalyticsRequest> {
    unsupported_raw(&options.raw)?;
    let (positional_parameters, named_parameters) =
        encode_params(&options.positional_parameters, &options.named_parameters, context)?;

    Ok(RpcAnalyticsRequest {
        statement: statement.to_string(),
        bucket_name: keyspace.bucket.clone(),
        scope_name: keyspace.scope.clone(),
        read_only: options.readonly.then_some(true),
        client_context_id,
        priority: options.priority.then_some(true),
        scan_consistency: options.scan_consistency.map(|c| match c {
            AnalyticsScanConsistency::NotBounded => RpcScanConsistency::NotBounded,
            AnalyticsScanConsistency::RequestPlus => RpcScanConsistency::RequestPlus,
        }),
        positional_parameters,
        named_parameters,
    })
}

fn search_request(
    index_name: &str,
    search: &SearchRequest,
    options: &SearchOptions,
    keyspace: &Keyspace,
) -> DriverResult<RpcSearchRequest> {
    unsupported_raw(&options.raw)?;
    let vector_search = search
        .vector_search
        .as_ref()
        .map(|v| v.to_fields().map(Value::Object))
        .transpose()?;
    let sort = (!options.sort.is_empty())
        .then(|| Value::Array(options.sort.iter().map(SearchSort::to_json).collect()));
    let (highlight_style, highlight_fields) = match &options.highlight {
        Some(h) => (h.style.map(|s| s.as_str().to_string()), h.fields.clone()),
        None => (None, Vec::new()),
    };

    Ok(RpcSearchRequest {
        index_name: index_name.to_string(),
        bucket_name: keyspace.bucket.clone(),
        scope_name: keyspace.scope.clone(),
        query: search.query_json()?,
        vector_search,
        scan_consistency: options.scan_consistency.map(|_| RpcScanConsistency::NotBounded),
        consistent_with: mutation_tokens(&options.consistent_with),
        limit: options.limit,
        skip: options.skip,
        explain: options.explain.then_some(true),
        highlight_style,
        highlight_fields,
        fields: options.fields.clone(),
        sort,
        facets: options
            .facets
            .iter()
            .map(|(name, facet)| (name.clone(), facet.to_json()))
            .collect(),
        disable_scoring: options.disable_scoring,
        collections: options.collections.clone(),
        include_locations: options.include_locations,
    })
}

// ============================================================================
// Dispatch
// ============================================================================

/// Start the call and wait for its first message, then hand the stream to a reader.
async fn open_stream<R, F>(
    call: F,
    decoder: Box<dyn ChunkDecoder<R>>,
    watch: CancelWatch,
    scope: RpcErrorScope,
) -> DriverResult<GrpcRowReader<R>>
where
    R: Send + 'static,
    F: Future<Output = Result<BoxRpcStream<R>, tonic::Status>> + Send,
{
    let token = watch.token();
    let opened = tokio::select! {
        biased;
        r = call => r,
        _ = token.cancelled() => Err(tonic::Status::cancelled("request context canceled")),
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(status) => {
            let err = watch.map_status(status, &scope);
            watch.release();
            return Err(err);
        }
    };

    let first = tokio::select! {
        biased;
        r = stream.recv() => r,
        _ = token.cancelled() => Err(tonic::Status::cancelled("request context canceled")),
    };
    match first {
        Ok(Some(msg)) => Ok(GrpcRowReader::new(Some(stream), Some(msg), decoder, watch, scope)),
        Ok(None) => Ok(GrpcRowReader::new(None, None, decoder, watch, scope)),
        Err(status) => {
            let err = watch.map_status(status, &scope);
            watch.release();
            Err(err)
        }
    }
}

impl GrpcProvider {
    pub fn new(
        query: Arc<dyn GrpcQueryClient>,
        analytics: Arc<dyn GrpcAnalyticsClient>,
        search: Arc<dyn GrpcSearchClient>,
        config: Arc<ClusterConfig>,
    ) -> Self {
        Self {
            query,
            analytics,
            search,
            config,
        }
    }

    fn observer(
        &self,
        service: &str,
        parent: Option<Arc<dyn RequestSpan>>,
        keyspace: &Keyspace,
    ) -> OperationObserver {
        let observer = OperationObserver::start(
            self.config.tracer.as_ref(),
            self.config.meter.as_ref(),
            service,
            service,
            parent,
        );
        observer.set_keyspace(keyspace.bucket.as_deref(), keyspace.scope.as_deref());
        observer
    }

    async fn dispatch_query(
        &self,
        statement: &str,
        options: &QueryOptions,
        keyspace: &Keyspace,
        observer: &OperationObserver,
    ) -> DriverResult<QueryResult> {
        let map = options.to_map()?;
        let settings = CallSettings::new(
            &self.config,
            ServiceType::Query,
            options.timeout,
            options.retry_strategy.as_ref(),
        );
        let client_context_id = context_id(&map);
        let context = ErrorContext::for_statement(statement, client_context_id.clone());
        let request = query_request(statement, options, keyspace, client_context_id, &context)?;

        let watch = CancelWatch::new(settings.deadline);
        watch.spawn(options.cancellation.clone());
        let ctx = RpcCallContext {
            cancellation: watch.token(),
            deadline: settings.deadline,
            retry_strategy: settings.retry_strategy,
            parent_span: observer.span_context(),
        };
        let scope = RpcErrorScope::new(RpcService::Query, context, options.readonly);

        tracing::debug!(
            statement,
            timeout_ms = settings.timeout.as_millis() as u64,
            "dispatching query over rpc"
        );

        let reader = open_stream(
            self.query.query(request, ctx),
            Box::new(QueryChunkDecoder::default()),
            watch,
            scope,
        )
        .await?;
        Ok(ResultStream::new(Box::new(reader)))
    }

    async fn dispatch_analytics(
        &self,
        statement: &str,
        options: &AnalyticsOptions,
        keyspace: &Keyspace,
        observer: &OperationObserver,
    ) -> DriverResult<AnalyticsResult> {
        let map = options.to_map()?;
        let settings = CallSettings::new(
            &self.config,
            ServiceType::Analytics,
            options.timeout,
            options.retry_strategy.as_ref(),
        );
        let client_context_id = context_id(&map);
        let context = ErrorContext::for_statement(statement, client_context_id.clone());
        let request = analytics_request(statement, options, keyspace, client_context_id, &context)?;

        let watch = CancelWatch::new(settings.deadline);
        watch.spawn(options.cancellation.clone());
        let ctx = RpcCallContext {
            cancellation: watch.token(),
            deadline: settings.deadline,
            retry_strategy: settings.retry_strategy,
            parent_span: observer.span_context(),
        };
        let scope = RpcErrorScope::new(RpcService::Analytics, context, options.readonly);

        tracing::debug!(
            statement,
            timeout_ms = settings.timeout.as_millis() as u64,
            "dispatching analytics query over rpc"
        );

        let reader = open_stream(
            self.analytics.analytics_query(request, ctx),
            Box::new(AnalyticsChunkDecoder::default()),
            watch,
            scope,
        )
        .await?;
        Ok(ResultStream::new(Box::new(reader)))
    }

    async fn dispatch_search(
        &self,
        index_name: &str,
        search: &SearchRequest,
        options: &SearchOptions,
        keyspace: &Keyspace,
        observer: &OperationObserver,
    ) -> DriverResult<SearchResult> {
        search.validate()?;
        options.to_map(index_name)?;
        let settings = CallSettings::new(
            &self.config,
            ServiceType::Search,
            options.timeout,
            options.retry_strategy.as_ref(),
        );
        let request = search_request(index_name, search, options, keyspace)?;

        let mut context = ErrorContext::for_index(index_name);
        context.query = Some(request.query.clone());

        let watch = CancelWatch::new(settings.deadline);
        watch.spawn(options.cancellation.clone());
        let ctx = RpcCallContext {
            cancellation: watch.token(),
            deadline: settings.deadline,
            retry_strategy: settings.retry_strategy,
            parent_span: observer.span_context(),
        };
        // Search never mutates, so its timeouts are unambiguous.
        let scope = RpcErrorScope::new(RpcService::Search, context, true);

        tracing::debug!(
            index = index_name,
            timeout_ms = settings.timeout.as_millis() as u64,
            "dispatching search query over rpc"
        );

        let reader = open_stream(
            self.search.search_query(request, ctx),
            Box::new(SearchChunkDecoder::default()),
            watch,
            scope,
        )
        .await?;
        Ok(ResultStream::new(Box::new(reader)))
    }
}

#[async_trait]
impl QueryProvider for GrpcProvider {
    async fn query(
        &self,
        statement: &str,
        options: QueryOptions,
        keyspace: &Keyspace,
    ) -> DriverResult<QueryResult> {
        let observer = self.observer("query", options.parent_span.clone(), keyspace);
        observer.set_statement(statement);
        let result = self.dispatch_query(statement, &options, keyspace, &observer).await;
        observed(result, observer)
    }
}

#[async_trait]
impl AnalyticsProvider for GrpcProvider {
    async fn analytics_query(
        &self,
        statement: &str,
        options: AnalyticsOptions,
        keyspace: &Keyspace,
    ) -> DriverResult<AnalyticsResult> {
        let observer = self.observer("analytics", options.parent_span.clone(), keyspace);
        observer.set_statement(statement);
        let result = self
            .dispatch_analytics(statement, &options, keyspace, &observer)
            .await;
        observed(result, observer)
    }
}

#[async_trait]
impl SearchProvider for GrpcProvider {
    async fn search(
        &self,
        index_name: &str,
        request: SearchRequest,
        options: SearchOptions,
        keyspace: &Keyspace,
    ) -> DriverResult<SearchResult> {
        let observer = self.observer("search", options.parent_span.clone(), keyspace);
        let result = self
            .dispatch_search(index_name, &request, &options, keyspace, &observer)
            .await;
        observed(result, observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use crate::driver::search::SearchQuery;
    use crate::driver::stream::ReaderState;
    use crate::driver::testing::{FakeAnalyticsClient, FakeQueryClient, FakeRpc, FakeSearchClient};
    use crate::transport::grpc::{RpcQueryMetaData, RpcQueryResponse, RpcSearchResponse};

    struct Fixture {
        provider: GrpcProvider,
        query: Arc<FakeQueryClient>,
        search: Arc<FakeSearchClient>,
    }

    fn fixture(
        query_script: Vec<FakeRpc<RpcQueryResponse>>,
        search_script: Vec<FakeRpc<RpcSearchResponse>>,
    ) -> Fixture {
        let query = Arc::new(FakeQueryClient::new(query_script));
        let analytics = Arc::new(FakeAnalyticsClient::new(vec![]));
        let search = Arc::new(FakeSearchClient::new(search_script));
        let provider = GrpcProvider::new(
            query.clone(),
            analytics,
            search.clone(),
            Arc::new(ClusterConfig::default()),
        );
        Fixture {
            provider,
            query,
            search,
        }
    }

    fn message(rows: &[&'static str], done: bool) -> RpcQueryResponse {
        RpcQueryResponse {
            rows: rows.iter().map(|r| Bytes::from_static(r.as_bytes())).collect(),
            meta_data: done.then(|| RpcQueryMetaData {
                request_id: "r-1".into(),
                status: "success".into(),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_query_streams_rows() {
        let f = fixture(
            vec![FakeRpc::Stream(vec![
                Ok(Some(message(&["{\"id\":1}"], false))),
                Ok(Some(message(&["{\"id\":2}"], true))),
                Ok(None),
            ])],
            vec![],
        );

        let mut result = f
            .provider
            .query(
                "SELECT id FROM b",
                QueryOptions::new().with_readonly(true).with_client_context_id("ctx"),
                &Keyspace::scope("b", "s"),
            )
            .await
            .unwrap();

        let mut rows = Vec::new();
        while let Some(row) = result.next_row::<Value>().await {
            rows.push(row.unwrap()["id"].as_u64().unwrap());
        }
        assert_eq!(rows, vec![1, 2]);
        assert_eq!(result.metadata().unwrap().request_id, "r-1");

        let sent = &f.query.requests()[0];
        assert_eq!(sent.statement, "SELECT id FROM b");
        assert_eq!(sent.bucket_name.as_deref(), Some("b"));
        assert_eq!(sent.read_only, Some(true));
        assert_eq!(sent.prepared, Some(true));
        assert_eq!(sent.client_context_id.as_deref(), Some("ctx"));
    }

    #[tokio::test]
    async fn test_empty_stream_is_clean() {
        let f = fixture(vec![FakeRpc::Stream(vec![Ok(None)])], vec![]);
        let result = f
            .provider
            .query("SELECT 1", QueryOptions::new(), &Keyspace::cluster())
            .await
            .unwrap();
        assert_eq!(result.state(), ReaderState::ClosedClean);
    }

    #[tokio::test]
    async fn test_first_message_error_fails_call() {
        let f = fixture(
            vec![FakeRpc::Stream(vec![Err(tonic::Status::invalid_argument(
                "syntax error",
            ))])],
            vec![],
        );
        let err = f
            .provider
            .query("SELEC 1", QueryOptions::new(), &Keyspace::cluster())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_rejected_call_is_service_error() {
        let f = fixture(vec![FakeRpc::Reject(tonic::Status::not_found("no keyspace"))], vec![]);
        let err = f
            .provider
            .query("SELECT 1", QueryOptions::new(), &Keyspace::cluster())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Query { .. }));
        assert_eq!(err.context().unwrap().statement.as_deref(), Some("SELECT 1"));
    }

    #[tokio::test]
    async fn test_cancel_versus_timeout_before_first_chunk() {
        let f = fixture(vec![FakeRpc::Hang, FakeRpc::Hang, FakeRpc::Hang], vec![]);

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let err = f
            .provider
            .query(
                "SELECT 1",
                QueryOptions::new().with_cancellation(token),
                &Keyspace::cluster(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Cancelled(_)));

        let err = f
            .provider
            .query(
                "SELECT 1",
                QueryOptions::new().with_timeout(Duration::from_millis(20)),
                &Keyspace::cluster(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::AmbiguousTimeout { .. }));

        let err = f
            .provider
            .query(
                "SELECT 1",
                QueryOptions::new()
                    .with_readonly(true)
                    .with_timeout(Duration::from_millis(20)),
                &Keyspace::cluster(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::UnambiguousTimeout { .. }));
    }

    #[tokio::test]
    async fn test_raw_options_unsupported() {
        let f = fixture(vec![], vec![]);
        let err = f
            .provider
            .query(
                "SELECT 1",
                QueryOptions::new().with_raw("foo", Value::Bool(true)),
                &Keyspace::cluster(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::FeatureNotAvailable(_)));
        assert!(f.query.requests().is_empty());
    }

    #[tokio::test]
    async fn test_search_request_mapping() {
        let f = fixture(vec![], vec![FakeRpc::Stream(vec![Ok(None)])]);
        let options = SearchOptions::new()
            .with_limit(10)
            .with_skip(5)
            .with_fields(vec!["name".into()])
            .with_sort(vec![SearchSort::field("name")]);
        let result = f
            .provider
            .search(
                "hotels",
                SearchRequest::with_search_query(SearchQuery::match_query("inn")),
                options,
                &Keyspace::cluster(),
            )
            .await
            .unwrap();
        assert_eq!(result.state(), ReaderState::ClosedClean);

        let sent = &f.search.requests()[0];
        assert_eq!(sent.index_name, "hotels");
        assert_eq!(sent.limit, Some(10));
        assert_eq!(sent.skip, Some(5));
        assert_eq!(sent.query["match"], "inn");
        assert!(sent.sort.is_some());
    }

    #[tokio::test]
    async fn test_search_deadline_is_unambiguous() {
        let f = fixture(vec![], vec![FakeRpc::Hang]);
        let err = f
            .provider
            .search(
                "hotels",
                SearchRequest::with_search_query(SearchQuery::match_query("inn")),
                SearchOptions::new().with_timeout(Duration::from_millis(20)),
                &Keyspace::cluster(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::UnambiguousTimeout { .. }));
        assert_eq!(err.context().unwrap().index_name.as_deref(), Some("hotels"));
    }
}
