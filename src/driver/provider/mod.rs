//! Query, analytics and search providers.
//!
//! A provider validates options, computes the deadline, picks the retry
//! strategy, serializes the request and dispatches it over one transport:
//!
//! ```text
//! Cluster / Scope
//!   └── Provider (chosen once by Transport)
//!         ├── MemdProvider  ── MemdAgent callback ── MemdRowReader
//!         └── GrpcProvider  ── Grpc*Client stream ── GrpcRowReader
//! ```

mod grpc;
mod memd;

pub use grpc::GrpcProvider;
pub use memd::MemdProvider;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use super::config::ClusterConfig;
use super::error::{DriverError, DriverResult, ErrorContext};
use super::health::ServiceType;
use super::options::{AnalyticsOptions, OptionMap, QueryOptions, SearchOptions};
use super::observability::OperationObserver;
use super::result::{AnalyticsResult, QueryResult, ResultMetaData, ResultStream, SearchResult};
use super::retry::{RetryStrategy, RetryStrategyAdapter};
use super::search::SearchRequest;
use crate::transport::CoreRetryStrategy;

// ============================================================================
// Keyspace
// ============================================================================

/// Bucket and scope a call is issued against. Empty at cluster level.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyspace {
    pub bucket: Option<String>,
    pub scope: Option<String>,
}

impl Keyspace {
    /// Cluster-level calls.
    pub fn cluster() -> Self {
        Self::default()
    }

    /// Scope-level calls.
    pub fn scope(bucket: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            bucket: Some(bucket.into()),
            scope: Some(scope.into()),
        }
    }

    /// `query_context` sent with scope-level statements.
    pub(crate) fn query_context(&self) -> Option<String> {
        match (&self.bucket, &self.scope) {
            (Some(bucket), Some(scope)) => Some(format!("default:`{}`.`{}`", bucket, scope)),
            _ => None,
        }
    }
}

// ============================================================================
// Provider traits
// ============================================================================

/// N1QL dispatch.
#[async_trait]
pub trait QueryProvider: Send + Sync {
    async fn query(
        &self,
        statement: &str,
        options: QueryOptions,
        keyspace: &Keyspace,
    ) -> DriverResult<QueryResult>;
}

/// Analytics dispatch.
#[async_trait]
pub trait AnalyticsProvider: Send + Sync {
    async fn analytics_query(
        &self,
        statement: &str,
        options: AnalyticsOptions,
        keyspace: &Keyspace,
    ) -> DriverResult<AnalyticsResult>;
}

/// Search dispatch.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(
        &self,
        index_name: &str,
        request: SearchRequest,
        options: SearchOptions,
        keyspace: &Keyspace,
    ) -> DriverResult<SearchResult>;
}

// ============================================================================
// Shared dispatch helpers
// ============================================================================

/// Deadline and retry strategy of one call.
pub(crate) struct CallSettings {
    pub(crate) timeout: Duration,
    pub(crate) deadline: Instant,
    pub(crate) retry_strategy: Arc<dyn CoreRetryStrategy>,
}

impl CallSettings {
    /// A per-call timeout or strategy beats the configured default.
    pub(crate) fn new(
        config: &ClusterConfig,
        service: ServiceType,
        timeout: Option<Duration>,
        retry_strategy: Option<&Arc<dyn RetryStrategy>>,
    ) -> Self {
        let timeout = timeout.unwrap_or_else(|| config.timeouts.for_service(service));
        let strategy = retry_strategy
            .cloned()
            .unwrap_or_else(|| config.retry_strategy.clone());
        Self {
            timeout,
            deadline: Instant::now() + timeout,
            retry_strategy: RetryStrategyAdapter::wrap(strategy),
        }
    }
}

fn map_str(map: &OptionMap, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Serialize a request body. Failures carry whatever statement and
/// client context id the map already holds.
pub(crate) fn encode_body(map: &OptionMap) -> DriverResult<Bytes> {
    serde_json::to_vec(map).map(Bytes::from).map_err(|e| {
        let context = ErrorContext {
            statement: map_str(map, "statement"),
            client_context_id: map_str(map, "client_context_id"),
            ..Default::default()
        };
        DriverError::encoding(format!("failed to encode request: {}", e), context)
    })
}

/// Client context id rendered by `to_map`.
pub(crate) fn context_id(map: &OptionMap) -> Option<String> {
    map_str(map, "client_context_id")
}

/// Hand `observer` to a dispatched result so span and latency cover the
/// whole stream. A failed dispatch finishes it at once.
pub(crate) fn observed<M: ResultMetaData>(
    result: DriverResult<ResultStream<M>>,
    observer: OperationObserver,
) -> DriverResult<ResultStream<M>> {
    match result {
        Ok(stream) => Ok(stream.with_observer(observer)),
        Err(err) => {
            observer.finish();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::driver::retry::FailFastRetryStrategy;

    #[test]
    fn test_query_context() {
        assert_eq!(Keyspace::cluster().query_context(), None);
        assert_eq!(
            Keyspace::scope("travel", "inventory").query_context().as_deref(),
            Some("default:`travel`.`inventory`")
        );
    }

    #[test]
    fn test_call_settings_prefers_call_timeout() {
        let config = ClusterConfig::default();
        let before = Instant::now();
        let settings = CallSettings::new(&config, ServiceType::Query, None, None);
        assert_eq!(settings.timeout, Duration::from_secs(75));
        assert!(settings.deadline >= before + Duration::from_secs(75));

        let strategy: Arc<dyn RetryStrategy> = Arc::new(FailFastRetryStrategy);
        let settings = CallSettings::new(
            &config,
            ServiceType::Search,
            Some(Duration::from_millis(250)),
            Some(&strategy),
        );
        assert_eq!(settings.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_encode_body() {
        let mut map = OptionMap::new();
        map.insert("statement".into(), json!("SELECT 1"));
        map.insert("client_context_id".into(), json!("ctx-1"));
        let body = encode_body(&map).unwrap();
        let back: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(back["statement"], "SELECT 1");
        assert_eq!(context_id(&map).as_deref(), Some("ctx-1"));
    }
}
