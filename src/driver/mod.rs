//! Driver Module
//!
//! Query, analytics, search and health operations over either transport.
//!
//! # Layout
//!
//! - [`Cluster`], [`Bucket`], [`Scope`]: entry points, transport chosen once
//! - `provider`: option validation, deadlines, retry wrapping, dispatch
//! - `stream`: row readers turning chunked responses into pull iteration
//! - `result`: typed facade over a row reader
//! - `normalize`: transport errors into [`DriverError`]
//! - `health`: ping, diagnostics and wait-until-ready
//!
//! # Example
//!
//! ```ignore
//! use nimbus_driver::driver::{Cluster, ClusterConfig, QueryOptions, Transport};
//!
//! let cluster = Cluster::connect(ClusterConfig::default(), Transport::Memd { agent, monitor })?;
//!
//! let mut result = cluster
//!     .bucket("travel-sample")
//!     .scope("inventory")
//!     .query("SELECT name FROM airline LIMIT 10", QueryOptions::default())
//!     .await?;
//! while let Some(row) = result.next_row::<serde_json::Value>().await {
//!     println!("{}", row?);
//! }
//! if let Some(err) = result.err() {
//!     return Err(err.into());
//! }
//! println!("{:?}", result.metadata()?.metrics);
//! ```

mod cluster;
mod config;
mod error;
mod health;
mod metadata;
mod normalize;
mod observability;
mod options;
mod provider;
mod result;
mod retry;
mod search;
mod stream;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use cluster::{Bucket, Cluster, Scope, Transport, DEFAULT_SCOPE};
pub use config::{ClusterConfig, ClusterConfigBuilder, TimeoutConfig, SDK_IDENTIFIER};
pub use error::{DriverError, DriverResult, ErrorContext, ErrorDesc};
pub use health::{
    ClusterState, DiagnosticsOptions, DiagnosticsReport, EndpointDiagnostics, EndpointPingReport,
    EndpointState, PingOptions, PingReport, PingState, ServiceType, WaitUntilReadyOptions,
    REPORT_VERSION,
};
pub use metadata::{
    format_duration, parse_duration, AnalyticsMetaData, AnalyticsMetrics, DateRangeFacetResult,
    NumericRangeFacetResult, QueryMetaData, QueryMetrics, SearchFacetResult, SearchMetaData,
    SearchMetrics, SearchRow, SearchRowLocation, ServiceWarning, TermFacetResult,
};
pub use normalize::{normalize, normalize_rpc, RpcErrorScope, RpcService, QUERY_SCOPE_LEVEL_REQUIRED};
pub use observability::{
    Meter, NoopMeter, NoopSpan, NoopTracer, NoopValueRecorder, RequestSpan, RequestTracer,
    ValueRecorder, OPERATION_METER,
};
pub use options::{
    AnalyticsOptions, AnalyticsScanConsistency, MutationState, MutationToken, OptionMap,
    QueryOptions, QueryProfileMode, QueryScanConsistency, SearchHighlight, SearchOptions,
    SearchScanConsistency,
};
pub use provider::{
    AnalyticsProvider, GrpcProvider, Keyspace, MemdProvider, QueryProvider, SearchProvider,
};
pub use result::{AnalyticsResult, QueryResult, ResultMetaData, ResultStream, RowStream, SearchResult};
pub use retry::{
    exponential_backoff, BackoffCalculator, BestEffortRetryStrategy, FailFastRetryStrategy,
    RetryAction, RetryContext, RetryReason, RetryRequest, RetryStrategy, RetryStrategyAdapter,
};
pub use search::{
    DateRange, HighlightStyle, MatchOperator, NumericRange, SearchFacet, SearchQuery,
    SearchRequest, SearchSort, VectorQuery, VectorQueryCombination, VectorSearch,
};
pub use stream::{GrpcRowReader, MemdRowReader, ReaderState, RowReader};
