//! Cluster, Bucket and Scope
//!
//! Public entry points. The transport is chosen once in [`Cluster::connect`];
//! every provider built from it is shared by the cluster and all of its
//! buckets and scopes.
//!
//! ```text
//! Cluster ── bucket(name) ──► Bucket ── scope(name) ──► Scope
//!   │ query / analytics_query / search      │ query / analytics_query / search
//!   │ ping / diagnostics / wait_until_ready │ (scope-level query_context)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use super::config::ClusterConfig;
use super::error::{DriverError, DriverResult};
use super::health::{
    DiagnosticsOptions, DiagnosticsReport, HealthChecker, PingOptions, PingReport, ServiceType,
    WaitUntilReadyOptions,
};
use super::options::{AnalyticsOptions, QueryOptions, SearchOptions};
use super::provider::{
    AnalyticsProvider, GrpcProvider, Keyspace, MemdProvider, QueryProvider, SearchProvider,
};
use super::result::{AnalyticsResult, QueryResult, SearchResult};
use super::search::{SearchQuery, SearchRequest};
use crate::transport::{
    ConnectionMonitor, GrpcAnalyticsClient, GrpcQueryClient, GrpcSearchClient, MemdAgent,
};

/// Default scope and collection name.
pub const DEFAULT_SCOPE: &str = "_default";

/// Services probed by a cluster-level ping.
const CLUSTER_PING_SERVICES: [ServiceType; 4] = [
    ServiceType::Query,
    ServiceType::Search,
    ServiceType::Analytics,
    ServiceType::Management,
];

// ============================================================================
// Transport
// ============================================================================

/// Wire transport backing a cluster.
pub enum Transport {
    /// Binary-protocol agent with callback dispatch
    Memd {
        agent: Arc<dyn MemdAgent>,
        monitor: Arc<dyn ConnectionMonitor>,
    },
    /// Streaming RPC clients
    Grpc {
        query: Arc<dyn GrpcQueryClient>,
        analytics: Arc<dyn GrpcAnalyticsClient>,
        search: Arc<dyn GrpcSearchClient>,
        monitor: Arc<dyn ConnectionMonitor>,
    },
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memd { .. } => "memd",
            Self::Grpc { .. } => "grpc",
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("kind", &self.name())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Cluster
// ============================================================================

struct ClusterInner {
    config: Arc<ClusterConfig>,
    transport: &'static str,
    query: Arc<dyn QueryProvider>,
    analytics: Arc<dyn AnalyticsProvider>,
    search: Arc<dyn SearchProvider>,
    health: HealthChecker,
    open: RwLock<bool>,
}

/// Connected cluster handle. Cheap to clone.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// Build providers over `transport`.
    pub fn connect(config: ClusterConfig, transport: Transport) -> DriverResult<Self> {
        let config = Arc::new(config);
        let name = transport.name();

        let (query, analytics, search, monitor): (
            Arc<dyn QueryProvider>,
            Arc<dyn AnalyticsProvider>,
            Arc<dyn SearchProvider>,
            Arc<dyn ConnectionMonitor>,
        ) = match transport {
            Transport::Memd { agent, monitor } => {
                let provider = Arc::new(MemdProvider::new(agent, config.clone()));
                (
                    provider.clone() as Arc<dyn QueryProvider>,
                    provider.clone() as Arc<dyn AnalyticsProvider>,
                    provider as Arc<dyn SearchProvider>,
                    monitor,
                )
            }
            Transport::Grpc {
                query,
                analytics,
                search,
                monitor,
            } => {
                let provider = Arc::new(GrpcProvider::new(query, analytics, search, config.clone()));
                (
                    provider.clone() as Arc<dyn QueryProvider>,
                    provider.clone() as Arc<dyn AnalyticsProvider>,
                    provider as Arc<dyn SearchProvider>,
                    monitor,
                )
            }
        };

        tracing::debug!(transport = name, sdk = %config.sdk, "cluster connected");

        Ok(Self {
            inner: Arc::new(ClusterInner {
                health: HealthChecker::new(monitor, config.clone()),
                config,
                transport: name,
                query,
                analytics,
                search,
                open: RwLock::new(true),
            }),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// Bucket handle; no round-trip.
    pub fn bucket(&self, name: impl Into<String>) -> Bucket {
        Bucket {
            cluster: self.clone(),
            name: name.into(),
        }
    }

    /// Cluster-level N1QL query
    pub async fn query(&self, statement: &str, options: QueryOptions) -> DriverResult<QueryResult> {
        self.run_query(statement, options, &Keyspace::cluster()).await
    }

    /// Cluster-level analytics query
    pub async fn analytics_query(
        &self,
        statement: &str,
        options: AnalyticsOptions,
    ) -> DriverResult<AnalyticsResult> {
        self.run_analytics(statement, options, &Keyspace::cluster())
            .await
    }

    /// Search an index with a structured query, a vector search, or both.
    pub async fn search(
        &self,
        index_name: &str,
        request: SearchRequest,
        options: SearchOptions,
    ) -> DriverResult<SearchResult> {
        self.run_search(index_name, request, options, &Keyspace::cluster())
            .await
    }

    /// Search an index with a structured query only.
    pub async fn search_query(
        &self,
        index_name: &str,
        query: SearchQuery,
        options: SearchOptions,
    ) -> DriverResult<SearchResult> {
        self.search(index_name, SearchRequest::with_search_query(query), options)
            .await
    }

    /// Probe cluster-level services.
    pub async fn ping(&self, options: PingOptions) -> DriverResult<PingReport> {
        self.ensure_open()?;
        self.inner
            .health
            .ping(None, &options, &CLUSTER_PING_SERVICES)
            .await
    }

    /// Local connection snapshot.
    pub fn diagnostics(&self, options: DiagnosticsOptions) -> DriverResult<DiagnosticsReport> {
        self.ensure_open()?;
        self.inner.health.diagnostics(None, &options)
    }

    /// Wait until the cluster reaches `options.desired_state`.
    pub async fn wait_until_ready(
        &self,
        timeout: Duration,
        options: WaitUntilReadyOptions,
    ) -> DriverResult<()> {
        self.ensure_open()?;
        self.inner
            .health
            .wait_until_ready(None, timeout, &options)
            .await
    }

    /// Close the cluster. Later operations fail with `Closed`; results
    /// already handed out stay readable.
    pub fn close(&self) -> DriverResult<()> {
        let mut open = self.inner.open.write();
        if !*open {
            return Ok(());
        }
        *open = false;
        tracing::debug!(transport = self.inner.transport, "cluster closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        *self.inner.open.read()
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DriverError::closed("cluster is closed"))
        }
    }

    async fn run_query(
        &self,
        statement: &str,
        options: QueryOptions,
        keyspace: &Keyspace,
    ) -> DriverResult<QueryResult> {
        self.ensure_open()?;
        self.inner.query.query(statement, options, keyspace).await
    }

    async fn run_analytics(
        &self,
        statement: &str,
        options: AnalyticsOptions,
        keyspace: &Keyspace,
    ) -> DriverResult<AnalyticsResult> {
        self.ensure_open()?;
        self.inner
            .analytics
            .analytics_query(statement, options, keyspace)
            .await
    }

    async fn run_search(
        &self,
        index_name: &str,
        request: SearchRequest,
        options: SearchOptions,
        keyspace: &Keyspace,
    ) -> DriverResult<SearchResult> {
        self.ensure_open()?;
        self.inner
            .search
            .search(index_name, request, options, keyspace)
            .await
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("transport", &self.inner.transport)
            .field("open", &self.is_open())
            .finish()
    }
}

// ============================================================================
// Bucket
// ============================================================================

/// Bucket handle
#[derive(Clone)]
pub struct Bucket {
    cluster: Cluster,
    name: String,
}

impl Bucket {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self, name: impl Into<String>) -> Scope {
        Scope {
            cluster: self.cluster.clone(),
            keyspace: Keyspace::scope(self.name.clone(), name),
        }
    }

    pub fn default_scope(&self) -> Scope {
        self.scope(DEFAULT_SCOPE)
    }

    /// Probe every service this bucket uses.
    pub async fn ping(&self, options: PingOptions) -> DriverResult<PingReport> {
        self.cluster.ensure_open()?;
        self.cluster
            .inner
            .health
            .ping(Some(&self.name), &options, &ServiceType::ALL)
            .await
    }

    /// Wait until this bucket's connections reach `options.desired_state`.
    pub async fn wait_until_ready(
        &self,
        timeout: Duration,
        options: WaitUntilReadyOptions,
    ) -> DriverResult<()> {
        self.cluster.ensure_open()?;
        self.cluster
            .inner
            .health
            .wait_until_ready(Some(&self.name), timeout, &options)
            .await
    }
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket").field("name", &self.name).finish()
    }
}

// ============================================================================
// Scope
// ============================================================================

/// Scope handle; statements resolve names relative to it.
#[derive(Clone)]
pub struct Scope {
    cluster: Cluster,
    keyspace: Keyspace,
}

impl Scope {
    pub fn name(&self) -> &str {
        self.keyspace.scope.as_deref().unwrap_or(DEFAULT_SCOPE)
    }

    pub fn bucket_name(&self) -> &str {
        self.keyspace.bucket.as_deref().unwrap_or_default()
    }

    pub async fn query(&self, statement: &str, options: QueryOptions) -> DriverResult<QueryResult> {
        self.cluster
            .run_query(statement, options, &self.keyspace)
            .await
    }

    pub async fn analytics_query(
        &self,
        statement: &str,
        options: AnalyticsOptions,
    ) -> DriverResult<AnalyticsResult> {
        self.cluster
            .run_analytics(statement, options, &self.keyspace)
            .await
    }

    pub async fn search(
        &self,
        index_name: &str,
        request: SearchRequest,
        options: SearchOptions,
    ) -> DriverResult<SearchResult> {
        self.cluster
            .run_search(index_name, request, options, &self.keyspace)
            .await
    }

    pub async fn search_query(
        &self,
        index_name: &str,
        query: SearchQuery,
        options: SearchOptions,
    ) -> DriverResult<SearchResult> {
        self.search(index_name, SearchRequest::with_search_query(query), options)
            .await
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("bucket", &self.bucket_name())
            .field("name", &self.name())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    use crate::driver::testing::{
        endpoint, probe, FakeAnalyticsClient, FakeDispatch, FakeMemdAgent, FakeMonitor,
        FakeQueryClient, FakeSearchClient, RecordedDispatch,
    };
    use crate::transport::{CoreEndpointState, CoreServiceType, DiagnosticsSnapshot, MemdChunk, ProbeOutcome};

    fn memd_cluster(script: Vec<FakeDispatch>) -> (Cluster, Arc<FakeMemdAgent>) {
        memd_cluster_with_monitor(script, FakeMonitor::default())
    }

    fn memd_cluster_with_monitor(
        script: Vec<FakeDispatch>,
        monitor: FakeMonitor,
    ) -> (Cluster, Arc<FakeMemdAgent>) {
        let agent = Arc::new(FakeMemdAgent::new(script));
        let cluster = Cluster::connect(
            ClusterConfig::default(),
            Transport::Memd {
                agent: agent.clone(),
                monitor: Arc::new(monitor),
            },
        )
        .unwrap();
        (cluster, agent)
    }

    #[tokio::test]
    async fn test_memd_cluster_query() {
        let (cluster, agent) = memd_cluster(vec![FakeDispatch::Stream(vec![Ok(MemdChunk::last(
            vec![Bytes::from_static(b"{\"n\":1}")],
            Bytes::from_static(b"{\"requestID\":\"r-1\",\"status\":\"success\"}"),
        ))])]);

        let mut result = cluster
            .query("SELECT 1 AS n", QueryOptions::default())
            .await
            .unwrap();
        let row: serde_json::Value = result.one().await.unwrap();
        assert_eq!(row["n"], 1);
        assert_eq!(result.metadata().unwrap().request_id, "r-1");

        let recorded = agent.recorded();
        assert!(matches!(recorded[0], RecordedDispatch::Query { prepared: true, .. }));
        assert!(recorded[0].payload_json().get("query_context").is_none());
    }

    #[tokio::test]
    async fn test_scope_query_sets_query_context() {
        let (cluster, agent) = memd_cluster(vec![]);
        let scope = cluster.bucket("travel").scope("inventory");
        assert_eq!(scope.bucket_name(), "travel");
        assert_eq!(scope.name(), "inventory");

        let mut result = scope
            .query("SELECT * FROM airline", QueryOptions::default())
            .await
            .unwrap();
        assert!(!result.next().await);
        assert_eq!(
            agent.recorded()[0].payload_json()["query_context"],
            "default:`travel`.`inventory`"
        );

        let _ = scope
            .analytics_query("SELECT 1", AnalyticsOptions::default())
            .await
            .unwrap();
        assert_eq!(
            agent.recorded()[1].payload_json()["query_context"],
            "default:`travel`.`inventory`"
        );
    }

    #[tokio::test]
    async fn test_grpc_scope_query_sets_names() {
        let query = Arc::new(FakeQueryClient::new(vec![]));
        let cluster = Cluster::connect(
            ClusterConfig::default(),
            Transport::Grpc {
                query: query.clone(),
                analytics: Arc::new(FakeAnalyticsClient::new(vec![])),
                search: Arc::new(FakeSearchClient::new(vec![])),
                monitor: Arc::new(FakeMonitor::default()),
            },
        )
        .unwrap();
        assert!(format!("{:?}", cluster).contains("grpc"));

        let mut result = cluster
            .bucket("travel")
            .default_scope()
            .query("SELECT 1", QueryOptions::default())
            .await
            .unwrap();
        assert!(!result.next().await);
        assert!(result.err().is_none());

        let sent = &query.requests()[0];
        assert_eq!(sent.bucket_name.as_deref(), Some("travel"));
        assert_eq!(sent.scope_name.as_deref(), Some(DEFAULT_SCOPE));
    }

    #[tokio::test]
    async fn test_search_query_wraps_structured_query() {
        let (cluster, agent) = memd_cluster(vec![]);
        let _ = cluster
            .search_query(
                "hotels",
                SearchQuery::match_query("pool"),
                SearchOptions::default(),
            )
            .await
            .unwrap();
        match &agent.recorded()[0] {
            RecordedDispatch::Search(request) => assert_eq!(request.index_name, "hotels"),
            _ => panic!("expected search dispatch"),
        }
        assert_eq!(agent.recorded()[0].payload_json()["query"]["match"], "pool");
    }

    #[tokio::test]
    async fn test_closed_cluster_rejects_operations() {
        let (cluster, agent) = memd_cluster(vec![]);
        let scope = cluster.bucket("b").scope("s");
        cluster.close().unwrap();
        cluster.close().unwrap();
        assert!(!cluster.is_open());

        let err = cluster
            .query("SELECT 1", QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Closed(_)));
        assert!(matches!(
            scope.query("SELECT 1", QueryOptions::default()).await,
            Err(DriverError::Closed(_))
        ));
        assert!(matches!(
            cluster.diagnostics(DiagnosticsOptions::default()),
            Err(DriverError::Closed(_))
        ));
        assert!(matches!(
            cluster.ping(PingOptions::default()).await,
            Err(DriverError::Closed(_))
        ));
        assert!(agent.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_ping_defaults_per_level() {
        let monitor = FakeMonitor::default().with_probes(
            CoreServiceType::KeyValue,
            Ok(vec![probe("kv-1", ProbeOutcome::Ok, Duration::from_micros(40))]),
        );
        let (cluster, _) = memd_cluster_with_monitor(vec![], monitor);

        let report = cluster.ping(PingOptions::default()).await.unwrap();
        assert!(!report.services.contains_key(&ServiceType::KeyValue));
        assert!(report.services.contains_key(&ServiceType::Query));

        let report = cluster
            .bucket("travel")
            .ping(PingOptions::default())
            .await
            .unwrap();
        assert_eq!(report.services.len(), ServiceType::ALL.len());
        assert_eq!(report.services[&ServiceType::KeyValue][0].id, "kv-1");
    }

    #[tokio::test]
    async fn test_cluster_diagnostics_and_wait() {
        let monitor = FakeMonitor::new(vec![DiagnosticsSnapshot {
            config_rev: 3,
            endpoints: vec![endpoint(
                CoreServiceType::Query,
                "q-1",
                CoreEndpointState::Connected,
            )],
        }]);
        let (cluster, _) = memd_cluster_with_monitor(vec![], monitor);

        let report = cluster.diagnostics(DiagnosticsOptions::default()).unwrap();
        assert_eq!(report.services[&ServiceType::Query][0].id, "q-1");

        cluster
            .bucket("travel")
            .wait_until_ready(Duration::from_secs(1), WaitUntilReadyOptions::default())
            .await
            .unwrap();
    }
}
