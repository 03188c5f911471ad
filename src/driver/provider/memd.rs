//! Provider over the binary-protocol agent.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use super::{context_id, encode_body, observed, AnalyticsProvider, CallSettings, Keyspace, QueryProvider, SearchProvider};
use crate::driver::config::ClusterConfig;
use crate::driver::error::{DriverError, DriverResult, ErrorContext};
use crate::driver::health::ServiceType;
use crate::driver::normalize::{normalize, RpcErrorScope, RpcService};
use crate::driver::observability::OperationObserver;
use crate::driver::options::{duration_to_ms_string, AnalyticsOptions, QueryOptions, SearchOptions};
use crate::driver::result::{AnalyticsResult, QueryResult, ResultStream, SearchResult};
use crate::driver::search::SearchRequest;
use crate::driver::stream::{check_search_hit, CancelWatch, MemdRowReader};
use crate::transport::{
    MemdAgent, MemdAnalyticsRequest, MemdQueryRequest, MemdSearchRequest, MemdStreamCallback,
    MemdStreamHandle, PendingOp, TransportResult,
};

/// Provider backed by a [`MemdAgent`].
pub struct MemdProvider {
    agent: Arc<dyn MemdAgent>,
    config: Arc<ClusterConfig>,
}

impl std::fmt::Debug for MemdProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemdProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MemdProvider {
    pub fn new(agent: Arc<dyn MemdAgent>, config: Arc<ClusterConfig>) -> Self {
        Self { agent, config }
    }

    fn observer(
        &self,
        service: &str,
        operation: &str,
        parent: Option<Arc<dyn crate::driver::observability::RequestSpan>>,
        keyspace: &Keyspace,
    ) -> OperationObserver {
        let observer = OperationObserver::start(
            self.config.tracer.as_ref(),
            self.config.meter.as_ref(),
            service,
            operation,
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
        let mut map = options.to_map()?;
        let settings = CallSettings::new(
            &self.config,
            ServiceType::Query,
            options.timeout,
            options.retry_strategy.as_ref(),
        );

        map.insert("statement".into(), json!(statement));
        map.insert("timeout".into(), json!(duration_to_ms_string(settings.timeout)));
        if let Some(query_context) = keyspace.query_context() {
            map.insert("query_context".into(), json!(query_context));
        }
        let payload = encode_body(&map)?;
        let context = ErrorContext::for_statement(statement, context_id(&map));

        let request = MemdQueryRequest {
            payload,
            deadline: settings.deadline,
            retry_strategy: settings.retry_strategy,
            parent_span: observer.span_context(),
            read_only: options.readonly,
        };

        tracing::debug!(
            statement,
            adhoc = options.adhoc,
            timeout_ms = settings.timeout.as_millis() as u64,
            "dispatching query"
        );

        let adhoc = options.adhoc;
        let scope = RpcErrorScope::new(RpcService::Query, context, options.readonly);
        let watch = CancelWatch::new(settings.deadline);
        watch.spawn(options.cancellation.clone());
        let handle = await_dispatch(
            |callback| {
                if adhoc {
                    self.agent.n1ql_query(request, callback)
                } else {
                    self.agent.prepared_n1ql_query(request, callback)
                }
            },
            &watch,
            &scope,
        )
        .await?;

        let reader = MemdRowReader::new(handle).with_cancel(watch, scope);
        Ok(ResultStream::new(Box::new(reader)))
    }

    async fn dispatch_analytics(
        &self,
        statement: &str,
        options: &AnalyticsOptions,
        keyspace: &Keyspace,
        observer: &OperationObserver,
    ) -> DriverResult<AnalyticsResult> {
        let mut map = options.to_map()?;
        let settings = CallSettings::new(
            &self.config,
            ServiceType::Analytics,
            options.timeout,
            options.retry_strategy.as_ref(),
        );

        map.insert("statement".into(), json!(statement));
        map.insert("timeout".into(), json!(duration_to_ms_string(settings.timeout)));
        if let Some(query_context) = keyspace.query_context() {
            map.insert("query_context".into(), json!(query_context));
        }
        let payload = encode_body(&map)?;
        let context = ErrorContext::for_statement(statement, context_id(&map));

        let request = MemdAnalyticsRequest {
            payload,
            priority: options.priority_value(),
            deadline: settings.deadline,
            retry_strategy: settings.retry_strategy,
            parent_span: observer.span_context(),
            read_only: options.readonly,
        };

        tracing::debug!(
            statement,
            priority = request.priority,
            timeout_ms = settings.timeout.as_millis() as u64,
            "dispatching analytics query"
        );

        let scope = RpcErrorScope::new(RpcService::Analytics, context, options.readonly);
        let watch = CancelWatch::new(settings.deadline);
        watch.spawn(options.cancellation.clone());
        let handle = await_dispatch(
            |callback| self.agent.analytics_query(request, callback),
            &watch,
            &scope,
        )
        .await?;

        let reader = MemdRowReader::new(handle).with_cancel(watch, scope);
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
        let mut map = options.to_map(index_name)?;
        let settings = CallSettings::new(
            &self.config,
            ServiceType::Search,
            options.timeout,
            options.retry_strategy.as_ref(),
        );

        map.insert("query".into(), search.query_json()?);
        if let Some(vector_search) = &search.vector_search {
            map.extend(vector_search.to_fields()?);
        }
        let ctl = map
            .entry("ctl")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(ctl) = ctl {
            ctl.insert("timeout".into(), json!(settings.timeout.as_millis() as u64));
        }
        let payload = encode_body(&map)?;

        let mut context = ErrorContext::for_index(index_name);
        context.query = map.get("query").cloned();

        let request = MemdSearchRequest {
            index_name: index_name.to_string(),
            bucket_name: keyspace.bucket.clone(),
            scope_name: keyspace.scope.clone(),
            payload,
            deadline: settings.deadline,
            retry_strategy: settings.retry_strategy,
            parent_span: observer.span_context(),
        };

        tracing::debug!(
            index = index_name,
            timeout_ms = settings.timeout.as_millis() as u64,
            "dispatching search query"
        );

        // Search never mutates, so its timeouts are unambiguous.
        let scope = RpcErrorScope::new(RpcService::Search, context, true);
        let watch = CancelWatch::new(settings.deadline);
        watch.spawn(options.cancellation.clone());
        let handle = await_dispatch(
            |callback| self.agent.search_query(request, callback),
            &watch,
            &scope,
        )
        .await?;

        let reader = MemdRowReader::new(handle)
            .with_row_check(check_search_hit)
            .with_cancel(watch, scope);
        Ok(ResultStream::new(Box::new(reader)))
    }
}

/// Bridge the agent's callback to a future, racing the request context.
/// The pending operation is canceled if the context fires first, and the
/// watch is released on every failure.
async fn await_dispatch<F>(
    start: F,
    watch: &CancelWatch,
    scope: &RpcErrorScope,
) -> DriverResult<Box<dyn MemdStreamHandle>>
where
    F: FnOnce(MemdStreamCallback) -> TransportResult<Box<dyn PendingOp>>,
{
    let (tx, rx) = oneshot::channel();
    let callback: MemdStreamCallback = Box::new(move |result| {
        // A closed receiver drops the handle, which releases the stream.
        let _ = tx.send(result);
    });

    let token = watch.token();
    let result = match start(callback) {
        Err(err) => Err(normalize(err)),
        Ok(op) => tokio::select! {
            biased;
            result = rx => match result {
                Ok(result) => result.map_err(normalize),
                Err(_) => Err(DriverError::transport(
                    "dispatch callback dropped without a result",
                    scope.context.clone(),
                )),
            },
            _ = token.cancelled() => {
                op.cancel();
                Err(watch
                    .cause_error(scope)
                    .unwrap_or_else(|| DriverError::cancelled("request context canceled")))
            }
        },
    };

    if result.is_err() {
        watch.release();
    }
    result
}

#[async_trait]
impl QueryProvider for MemdProvider {
    async fn query(
        &self,
        statement: &str,
        options: QueryOptions,
        keyspace: &Keyspace,
    ) -> DriverResult<QueryResult> {
        let observer = self.observer("query", "query", options.parent_span.clone(), keyspace);
        observer.set_statement(statement);
        let result = self.dispatch_query(statement, &options, keyspace, &observer).await;
        observed(result, observer)
    }
}

#[async_trait]
impl AnalyticsProvider for MemdProvider {
    async fn analytics_query(
        &self,
        statement: &str,
        options: AnalyticsOptions,
        keyspace: &Keyspace,
    ) -> DriverResult<AnalyticsResult> {
        let observer = self.observer("analytics", "analytics", options.parent_span.clone(), keyspace);
        observer.set_statement(statement);
        let result = self
            .dispatch_analytics(statement, &options, keyspace, &observer)
            .await;
        observed(result, observer)
    }
}

#[async_trait]
impl SearchProvider for MemdProvider {
    async fn search(
        &self,
        index_name: &str,
        request: SearchRequest,
        options: SearchOptions,
        keyspace: &Keyspace,
    ) -> DriverResult<SearchResult> {
        let observer = self.observer("search", "search", options.parent_span.clone(), keyspace);
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

    use bytes::Bytes;
    use serde::Deserialize;
    use tokio_util::sync::CancellationToken;

    use crate::driver::options::MutationToken;
    use crate::driver::options::{MutationState, QueryScanConsistency};
    use crate::driver::search::{SearchQuery, VectorQuery, VectorSearch};
    use crate::driver::stream::ReaderState;
    use crate::driver::testing::{FakeDispatch, FakeMemdAgent, RecordedDispatch};
    use crate::transport::{MemdChunk, QueryErrorDesc, QueryErrorRecord, TransportError};

    #[derive(Debug, Deserialize)]
    struct Row {
        id: u32,
    }

    fn provider(script: Vec<FakeDispatch>) -> (MemdProvider, Arc<FakeMemdAgent>) {
        let agent = Arc::new(FakeMemdAgent::new(script));
        let provider = MemdProvider::new(agent.clone(), Arc::new(ClusterConfig::default()));
        (provider, agent)
    }

    fn rows_then_meta() -> FakeDispatch {
        FakeDispatch::Stream(vec![
            Ok(MemdChunk::rows(vec![Bytes::from_static(b"{\"id\":1}")])),
            Ok(MemdChunk::last(
                vec![Bytes::from_static(b"{\"id\":2}")],
                Bytes::from_static(b"{\"requestID\":\"r\",\"status\":\"success\"}"),
            )),
        ])
    }

    #[tokio::test]
    async fn test_query_prepared_by_default() {
        let (provider, agent) = provider(vec![rows_then_meta()]);
        let mut result = provider
            .query(
                "SELECT * FROM `travel`",
                QueryOptions::new().with_client_context_id("ctx-1"),
                &Keyspace::cluster(),
            )
            .await
            .unwrap();

        let mut ids = Vec::new();
        while let Some(row) = result.next_row::<Row>().await {
            ids.push(row.unwrap().id);
        }
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(result.state(), ReaderState::ClosedClean);

        let recorded = agent.recorded();
        assert!(matches!(recorded[0], RecordedDispatch::Query { prepared: true, .. }));
        let body = recorded[0].payload_json();
        assert_eq!(body["statement"], "SELECT * FROM `travel`");
        assert_eq!(body["client_context_id"], "ctx-1");
        assert_eq!(body["timeout"], "75000ms");
        assert!(body.get("query_context").is_none());
    }

    #[tokio::test]
    async fn test_adhoc_scope_query() {
        let (provider, agent) = provider(vec![rows_then_meta()]);
        let options = QueryOptions::new()
            .with_adhoc(true)
            .with_timeout(Duration::from_secs(3));
        provider
            .query("SELECT 1", options, &Keyspace::scope("travel", "inventory"))
            .await
            .unwrap();

        let recorded = agent.recorded();
        assert!(matches!(recorded[0], RecordedDispatch::Query { prepared: false, .. }));
        let body = recorded[0].payload_json();
        assert_eq!(body["query_context"], "default:`travel`.`inventory`");
        assert_eq!(body["timeout"], "3000ms");
    }

    #[tokio::test]
    async fn test_exclusive_options_do_not_dispatch() {
        let (provider, agent) = provider(vec![]);
        let mut state = MutationState::new();
        state.add([MutationToken::new("travel", 12, 1234, 5)]);
        let options = QueryOptions::new()
            .with_scan_consistency(QueryScanConsistency::RequestPlus)
            .with_consistent_with(state);

        let err = provider
            .query("SELECT 1", options, &Keyspace::cluster())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
        assert!(agent.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_error_is_normalized() {
        let (provider, _agent) = provider(vec![FakeDispatch::Fail(TransportError::Query(Box::new(
            QueryErrorRecord {
                statement: "SELECT 1".into(),
                errors: vec![QueryErrorDesc::new(1197, "scope required")],
                ..Default::default()
            },
        )))]);

        let err = provider
            .query("SELECT 1", QueryOptions::new(), &Keyspace::cluster())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Scope"));
    }

    #[tokio::test]
    async fn test_rejected_dispatch() {
        let (provider, _agent) = provider(vec![FakeDispatch::Reject(TransportError::Query(
            Box::new(QueryErrorRecord::default()),
        ))]);
        let err = provider
            .analytics_query("SELECT 1", AnalyticsOptions::new(), &Keyspace::cluster())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Query { .. }));
    }

    #[tokio::test]
    async fn test_caller_cancel_before_first_chunk() {
        let (provider, agent) = provider(vec![FakeDispatch::Hang]);
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = provider
            .query(
                "SELECT 1",
                QueryOptions::new().with_cancellation(token),
                &Keyspace::cluster(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Cancelled(_)));
        assert!(agent.was_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_before_first_chunk() {
        let (provider, agent) = provider(vec![FakeDispatch::Hang, FakeDispatch::Hang]);

        let err = provider
            .query(
                "UPSERT INTO t VALUES ('k', {})",
                QueryOptions::new().with_timeout(Duration::from_millis(20)),
                &Keyspace::cluster(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::AmbiguousTimeout { .. }));
        assert_eq!(
            err.context().unwrap().statement.as_deref(),
            Some("UPSERT INTO t VALUES ('k', {})")
        );
        assert!(agent.was_cancelled());

        let err = provider
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
    async fn test_caller_cancel_mid_stream() {
        let (provider, _agent) = provider(vec![FakeDispatch::Stream(vec![Ok(MemdChunk::rows(
            vec![Bytes::from_static(b"{\"id\":1}")],
        ))])]);
        let token = CancellationToken::new();
        let mut result = provider
            .query(
                "SELECT 1",
                QueryOptions::new().with_cancellation(token.clone()),
                &Keyspace::cluster(),
            )
            .await
            .unwrap();

        assert_eq!(result.next_row::<Row>().await.unwrap().unwrap().id, 1);
        token.cancel();
        assert!(result.next_row::<Row>().await.is_none());
        assert_eq!(result.state(), ReaderState::ClosedError);
        assert!(matches!(result.err(), Some(DriverError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_deadline_mid_stream() {
        let (provider, _agent) = provider(vec![FakeDispatch::Stream(vec![Ok(MemdChunk::rows(
            vec![Bytes::from_static(b"{\"id\":1}")],
        ))])]);
        let mut result = provider
            .analytics_query(
                "SELECT 1",
                AnalyticsOptions::new()
                    .with_readonly(true)
                    .with_timeout(Duration::from_millis(30)),
                &Keyspace::cluster(),
            )
            .await
            .unwrap();

        assert!(result.next().await);
        assert!(!result.next().await);
        let err = result.err().unwrap();
        assert!(matches!(err, DriverError::UnambiguousTimeout { .. }));
        assert_eq!(err.context().unwrap().endpoint.as_deref(), Some("10.0.0.1:8093"));
    }

    #[tokio::test]
    async fn test_search_skips_malformed_hit() {
        let (provider, _agent) = provider(vec![FakeDispatch::Stream(vec![Ok(MemdChunk::last(
            vec![
                Bytes::from_static(br#"{"index":"hotels","id":"h1","score":2.0}"#),
                Bytes::from_static(br#"{"index":"hotels","score":"high"}"#),
                Bytes::from_static(br#"{"index":"hotels","id":"h3","score":1.0}"#),
            ],
            Bytes::from_static(br#"{"status":{"total":1,"failed":0,"successful":1},"total_hits":3}"#),
        ))])]);
        let mut result = provider
            .search(
                "hotels",
                SearchRequest::with_search_query(SearchQuery::match_query("inn")),
                SearchOptions::new(),
                &Keyspace::cluster(),
            )
            .await
            .unwrap();

        let mut ids = Vec::new();
        while result.next().await {
            ids.push(result.search_row().unwrap().id);
        }
        assert_eq!(ids, vec!["h1", "h3"]);
        assert_eq!(result.state(), ReaderState::ClosedClean);
        assert!(matches!(result.err(), Some(DriverError::Decoding(_))));
    }

    #[tokio::test]
    async fn test_analytics_priority_and_context() {
        let (provider, agent) = provider(vec![rows_then_meta()]);
        provider
            .analytics_query(
                "SELECT 1",
                AnalyticsOptions::new().with_priority(true),
                &Keyspace::scope("b", "s"),
            )
            .await
            .unwrap();

        match &agent.recorded()[0] {
            RecordedDispatch::Analytics(request) => assert_eq!(request.priority, -1),
            _ => panic!("expected analytics dispatch"),
        }
        assert_eq!(agent.recorded()[0].payload_json()["query_context"], "default:`b`.`s`");
    }

    #[tokio::test]
    async fn test_search_request_body() {
        let (provider, agent) = provider(vec![]);
        let request = SearchRequest::with_vector_search(VectorSearch::new(vec![VectorQuery::new(
            "embedding",
            vec![0.5, 1.0],
        )]));
        provider
            .search(
                "hotels",
                request,
                SearchOptions::new().with_limit(5).with_timeout(Duration::from_secs(2)),
                &Keyspace::cluster(),
            )
            .await
            .unwrap();

        let body = agent.recorded()[0].payload_json();
        assert_eq!(body["query"], json!({ "match_none": {} }));
        assert_eq!(body["knn"][0]["field"], "embedding");
        assert_eq!(body["size"], 5);
        assert_eq!(body["ctl"]["timeout"], 2000);
    }

    #[tokio::test]
    async fn test_empty_search_request_rejected() {
        let (provider, agent) = provider(vec![]);
        let err = provider
            .search(
                "hotels",
                SearchRequest::default(),
                SearchOptions::new(),
                &Keyspace::cluster(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
        assert!(agent.recorded().is_empty());

        let ok = provider
            .search(
                "hotels",
                SearchRequest::with_search_query(SearchQuery::match_query("inn")),
                SearchOptions::new(),
                &Keyspace::cluster(),
            )
            .await;
        assert!(ok.is_ok());
    }
}
