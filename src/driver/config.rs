//! Cluster Configuration
//!
//! Everything a provider needs that is not per call: service timeouts, the
//! default retry strategy, tracer, meter and SDK identifier. Built once and
//! shared read-only.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::health::ServiceType;
use super::observability::{Meter, NoopMeter, NoopTracer, RequestTracer};
use super::retry::{BestEffortRetryStrategy, RetryStrategy};

/// SDK identifier reported in health reports.
pub const SDK_IDENTIFIER: &str = concat!("nimbus-rust/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// TimeoutConfig
// ============================================================================

/// Per-service default timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Key-value operations
    pub kv: Duration,
    /// Key-value operations with durability
    pub kv_durable: Duration,
    /// N1QL queries
    pub query: Duration,
    /// Analytics queries
    pub analytics: Duration,
    /// Search queries
    pub search: Duration,
    /// View queries
    pub views: Duration,
    /// Management requests
    pub management: Duration,
    /// Bootstrap and connect
    pub connect: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            kv: Duration::from_millis(2500),
            kv_durable: Duration::from_secs(10),
            query: Duration::from_secs(75),
            analytics: Duration::from_secs(75),
            search: Duration::from_secs(75),
            views: Duration::from_secs(75),
            management: Duration::from_secs(75),
            connect: Duration::from_secs(10),
        }
    }
}

impl TimeoutConfig {
    /// Default timeout for one service
    pub fn for_service(&self, service: ServiceType) -> Duration {
        match service {
            ServiceType::KeyValue => self.kv,
            ServiceType::Views => self.views,
            ServiceType::Query => self.query,
            ServiceType::Search => self.search,
            ServiceType::Analytics => self.analytics,
            ServiceType::Management => self.management,
        }
    }
}

// ============================================================================
// ClusterConfig
// ============================================================================

/// Cluster configuration
#[derive(Clone)]
pub struct ClusterConfig {
    /// Service timeouts
    pub timeouts: TimeoutConfig,
    /// Retry strategy used when a call does not override it
    pub retry_strategy: Arc<dyn RetryStrategy>,
    /// Span factory
    pub tracer: Arc<dyn RequestTracer>,
    /// Metric factory
    pub meter: Arc<dyn Meter>,
    /// SDK identifier
    pub sdk: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            retry_strategy: Arc::new(BestEffortRetryStrategy::default()),
            tracer: Arc::new(NoopTracer),
            meter: Arc::new(NoopMeter),
            sdk: SDK_IDENTIFIER.to_string(),
        }
    }
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("timeouts", &self.timeouts)
            .field("sdk", &self.sdk)
            .finish_non_exhaustive()
    }
}

impl ClusterConfig {
    /// Builder starting from defaults
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }
}

/// Cluster configuration builder
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    /// Replace all timeouts
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    /// Key-value timeout
    pub fn with_kv_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.kv = timeout;
        self
    }

    /// Query timeout
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.query = timeout;
        self
    }

    /// Analytics timeout
    pub fn with_analytics_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.analytics = timeout;
        self
    }

    /// Search timeout
    pub fn with_search_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.search = timeout;
        self
    }

    /// Management timeout
    pub fn with_management_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.management = timeout;
        self
    }

    /// Default retry strategy
    pub fn with_retry_strategy(mut self, strategy: Arc<dyn RetryStrategy>) -> Self {
        self.config.retry_strategy = strategy;
        self
    }

    /// Span factory
    pub fn with_tracer(mut self, tracer: Arc<dyn RequestTracer>) -> Self {
        self.config.tracer = tracer;
        self
    }

    /// Metric factory
    pub fn with_meter(mut self, meter: Arc<dyn Meter>) -> Self {
        self.config.meter = meter;
        self
    }

    /// SDK identifier
    pub fn with_sdk(mut self, sdk: impl Into<String>) -> Self {
        self.config.sdk = sdk.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> ClusterConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.kv, Duration::from_millis(2500));
        assert_eq!(timeouts.kv_durable, Duration::from_secs(10));
        assert_eq!(timeouts.for_service(ServiceType::Query), Duration::from_secs(75));
        assert_eq!(timeouts.for_service(ServiceType::Management), Duration::from_secs(75));
        assert_eq!(timeouts.connect, Duration::from_secs(10));
    }

    #[test]
    fn test_builder() {
        let config = ClusterConfig::builder()
            .with_query_timeout(Duration::from_secs(5))
            .with_sdk("custom/1.0")
            .build();

        assert_eq!(config.timeouts.query, Duration::from_secs(5));
        assert_eq!(config.timeouts.search, Duration::from_secs(75));
        assert_eq!(config.sdk, "custom/1.0");
    }

    #[test]
    fn test_default_sdk_identifier() {
        assert!(ClusterConfig::default().sdk.starts_with("nimbus-rust/"));
    }
}
