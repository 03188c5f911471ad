//! Retry Strategies
//!
//! User-facing retry API and the adapter that lets a transport consult it.
//!
//! ```text
//! transport retry loop
//!   └── RetryStrategyAdapter (CoreRetryStrategy)
//!         ├── maps CoreRetryReason -> RetryReason
//!         ├── delegates to the user's RetryStrategy
//!         └── records the attempt on the transport request
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Serialize, Serializer};

use crate::transport::{CoreRetryAction, CoreRetryReason, CoreRetryRequest, CoreRetryStrategy};

// ============================================================================
// RetryReason
// ============================================================================

/// Why an operation is being retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryReason {
    Unknown,
    SocketNotAvailable,
    ServiceNotAvailable,
    NodeNotAvailable,
    KvNotMyVbucket,
    KvCollectionOutdated,
    KvErrorMapRetryIndicated,
    KvLocked,
    KvTemporaryFailure,
    KvSyncWriteInProgress,
    KvSyncWriteRecommitInProgress,
    ServiceResponseCodeIndicated,
    SocketCloseInFlight,
    CircuitBreakerOpen,
    QueryPreparedStatementFailure,
    QueryIndexNotFound,
    AnalyticsTemporaryFailure,
    SearchTooManyRequests,
    ViewsTemporaryFailure,
    ViewsNoActivePartition,
    NotReady,
    NodeLocatorFailure,
}

impl RetryReason {
    /// Whether an operation that is not idempotent may be retried for this reason
    pub fn allows_non_idempotent_retry(&self) -> bool {
        !matches!(self, Self::Unknown | Self::SocketCloseInFlight)
    }

    /// Whether this reason is retried regardless of the strategy's decision
    pub fn always_retry(&self) -> bool {
        matches!(
            self,
            Self::KvNotMyVbucket
                | Self::KvCollectionOutdated
                | Self::ViewsNoActivePartition
                | Self::NotReady
        )
    }

    /// Stable description, used in logs and diagnostic JSON
    pub fn description(&self) -> &'static str {
        self.to_core().known_description().unwrap_or("UNKNOWN")
    }

    /// Transport-side counterpart.
    pub fn to_core(self) -> CoreRetryReason {
        match self {
            Self::Unknown => CoreRetryReason::Unknown,
            Self::SocketNotAvailable => CoreRetryReason::SocketNotAvailable,
            Self::ServiceNotAvailable => CoreRetryReason::ServiceNotAvailable,
            Self::NodeNotAvailable => CoreRetryReason::NodeNotAvailable,
            Self::KvNotMyVbucket => CoreRetryReason::KvNotMyVbucket,
            Self::KvCollectionOutdated => CoreRetryReason::KvCollectionOutdated,
            Self::KvErrorMapRetryIndicated => CoreRetryReason::KvErrorMapRetryIndicated,
            Self::KvLocked => CoreRetryReason::KvLocked,
            Self::KvTemporaryFailure => CoreRetryReason::KvTemporaryFailure,
            Self::KvSyncWriteInProgress => CoreRetryReason::KvSyncWriteInProgress,
            Self::KvSyncWriteRecommitInProgress => CoreRetryReason::KvSyncWriteRecommitInProgress,
            Self::ServiceResponseCodeIndicated => CoreRetryReason::ServiceResponseCodeIndicated,
            Self::SocketCloseInFlight => CoreRetryReason::SocketCloseInFlight,
            Self::CircuitBreakerOpen => CoreRetryReason::CircuitBreakerOpen,
            Self::QueryPreparedStatementFailure => CoreRetryReason::QueryPreparedStatementFailure,
            Self::QueryIndexNotFound => CoreRetryReason::QueryIndexNotFound,
            Self::AnalyticsTemporaryFailure => CoreRetryReason::AnalyticsTemporaryFailure,
            Self::SearchTooManyRequests => CoreRetryReason::SearchTooManyRequests,
            Self::ViewsTemporaryFailure => CoreRetryReason::ViewsTemporaryFailure,
            Self::ViewsNoActivePartition => CoreRetryReason::ViewsNoActivePartition,
            Self::NotReady => CoreRetryReason::NotReady,
            Self::NodeLocatorFailure => CoreRetryReason::NodeLocatorFailure,
        }
    }

    /// Driver-side counterpart of a transport reason; `None` if it has none.
    pub fn from_core(reason: &CoreRetryReason) -> Option<Self> {
        Some(match reason {
            CoreRetryReason::Unknown => Self::Unknown,
            CoreRetryReason::SocketNotAvailable => Self::SocketNotAvailable,
            CoreRetryReason::ServiceNotAvailable => Self::ServiceNotAvailable,
            CoreRetryReason::NodeNotAvailable => Self::NodeNotAvailable,
            CoreRetryReason::KvNotMyVbucket => Self::KvNotMyVbucket,
            CoreRetryReason::KvCollectionOutdated => Self::KvCollectionOutdated,
            CoreRetryReason::KvErrorMapRetryIndicated => Self::KvErrorMapRetryIndicated,
            CoreRetryReason::KvLocked => Self::KvLocked,
            CoreRetryReason::KvTemporaryFailure => Self::KvTemporaryFailure,
            CoreRetryReason::KvSyncWriteInProgress => Self::KvSyncWriteInProgress,
            CoreRetryReason::KvSyncWriteRecommitInProgress => Self::KvSyncWriteRecommitInProgress,
            CoreRetryReason::ServiceResponseCodeIndicated => Self::ServiceResponseCodeIndicated,
            CoreRetryReason::SocketCloseInFlight => Self::SocketCloseInFlight,
            CoreRetryReason::CircuitBreakerOpen => Self::CircuitBreakerOpen,
            CoreRetryReason::QueryPreparedStatementFailure => Self::QueryPreparedStatementFailure,
            CoreRetryReason::QueryIndexNotFound => Self::QueryIndexNotFound,
            CoreRetryReason::AnalyticsTemporaryFailure => Self::AnalyticsTemporaryFailure,
            CoreRetryReason::SearchTooManyRequests => Self::SearchTooManyRequests,
            CoreRetryReason::ViewsTemporaryFailure => Self::ViewsTemporaryFailure,
            CoreRetryReason::ViewsNoActivePartition => Self::ViewsNoActivePartition,
            CoreRetryReason::NotReady => Self::NotReady,
            CoreRetryReason::NodeLocatorFailure => Self::NodeLocatorFailure,
            CoreRetryReason::Unrecognized(_) => return None,
        })
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl Serialize for RetryReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.description())
    }
}

/// Map transport reasons, dropping the ones this layer does not know.
pub(crate) fn map_core_reasons(reasons: &[CoreRetryReason]) -> Vec<RetryReason> {
    reasons
        .iter()
        .filter_map(|reason| {
            let mapped = RetryReason::from_core(reason);
            if mapped.is_none() {
                tracing::warn!(reason = %reason, "dropping unrecognized retry reason");
            }
            mapped
        })
        .collect()
}

// ============================================================================
// RetryAction / RetryRequest / RetryStrategy
// ============================================================================

/// What a strategy wants done with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Retry after the given duration
    RetryAfter(Duration),
    /// Fail now
    Stop,
}

impl RetryAction {
    /// Backoff duration, `None` for `Stop`
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::RetryAfter(d) => Some(*d),
            Self::Stop => None,
        }
    }
}

/// Read-only view of a request being retried.
pub trait RetryRequest {
    /// Operation identifier
    fn identifier(&self) -> &str;
    /// Whether replaying the request is safe
    fn idempotent(&self) -> bool;
    /// Retries so far
    fn retry_attempts(&self) -> u32;
    /// Distinct reasons so far, first occurrence first
    fn retry_reasons(&self) -> Vec<RetryReason>;
}

/// Policy deciding whether and when to retry.
pub trait RetryStrategy: Send + Sync {
    /// Decide what to do after `request` failed for `reason`.
    fn retry_after(&self, request: &dyn RetryRequest, reason: RetryReason) -> RetryAction;
}

/// Backoff curve: attempt number to delay.
pub type BackoffCalculator = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Exponential backoff `min * factor^attempts`, capped at `max`.
pub fn exponential_backoff(min: Duration, max: Duration, factor: f64, jitter: bool) -> BackoffCalculator {
    let factor = if factor <= 0.0 { 2.0 } else { factor };
    Arc::new(move |attempts: u32| {
        let exp = factor.powi(attempts.min(64) as i32);
        let millis = (min.as_secs_f64() * 1000.0 * exp).min(max.as_secs_f64() * 1000.0);
        let millis = if jitter && millis > 0.0 {
            rand::thread_rng().gen_range(millis / 2.0..=millis)
        } else {
            millis
        };
        Duration::from_micros((millis * 1000.0) as u64)
    })
}

/// Retries every reason safe for the request, backing off exponentially.
#[derive(Clone)]
pub struct BestEffortRetryStrategy {
    backoff: BackoffCalculator,
}

impl BestEffortRetryStrategy {
    /// Strategy with a custom backoff curve
    pub fn new(backoff: BackoffCalculator) -> Self {
        Self { backoff }
    }
}

impl Default for BestEffortRetryStrategy {
    fn default() -> Self {
        Self::new(exponential_backoff(
            Duration::from_millis(1),
            Duration::from_millis(500),
            2.0,
            false,
        ))
    }
}

impl fmt::Debug for BestEffortRetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BestEffortRetryStrategy").finish_non_exhaustive()
    }
}

impl RetryStrategy for BestEffortRetryStrategy {
    fn retry_after(&self, request: &dyn RetryRequest, reason: RetryReason) -> RetryAction {
        if request.idempotent() || reason.allows_non_idempotent_retry() {
            RetryAction::RetryAfter((self.backoff)(request.retry_attempts()))
        } else {
            RetryAction::Stop
        }
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFastRetryStrategy;

impl RetryStrategy for FailFastRetryStrategy {
    fn retry_after(&self, _request: &dyn RetryRequest, _reason: RetryReason) -> RetryAction {
        RetryAction::Stop
    }
}

// ============================================================================
// RetryContext
// ============================================================================

/// Request-scoped retry bookkeeping for loops driven by the driver itself.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    identifier: String,
    idempotent: bool,
    attempts: u32,
    reasons: Vec<RetryReason>,
}

impl RetryContext {
    /// Create bookkeeping for one request
    pub fn new(identifier: impl Into<String>, idempotent: bool) -> Self {
        Self {
            identifier: identifier.into(),
            idempotent,
            attempts: 0,
            reasons: Vec::new(),
        }
    }

    /// Record one retry for `reason`
    pub fn record(&mut self, reason: RetryReason) {
        self.attempts += 1;
        if !self.reasons.contains(&reason) {
            self.reasons.push(reason);
        }
    }
}

impl RetryRequest for RetryContext {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn idempotent(&self) -> bool {
        self.idempotent
    }

    fn retry_attempts(&self) -> u32 {
        self.attempts
    }

    fn retry_reasons(&self) -> Vec<RetryReason> {
        self.reasons.clone()
    }
}

// ============================================================================
// RetryStrategyAdapter
// ============================================================================

struct CoreRequestView<'a>(&'a dyn CoreRetryRequest);

impl RetryRequest for CoreRequestView<'_> {
    fn identifier(&self) -> &str {
        self.0.identifier()
    }

    fn idempotent(&self) -> bool {
        self.0.idempotent()
    }

    fn retry_attempts(&self) -> u32 {
        self.0.retry_attempts()
    }

    fn retry_reasons(&self) -> Vec<RetryReason> {
        map_core_reasons(&self.0.retry_reasons())
    }
}

/// Presents a [`RetryStrategy`] to the transport as a [`CoreRetryStrategy`].
#[derive(Clone)]
pub struct RetryStrategyAdapter {
    inner: Arc<dyn RetryStrategy>,
}

impl RetryStrategyAdapter {
    /// Wrap a strategy
    pub fn new(inner: Arc<dyn RetryStrategy>) -> Self {
        Self { inner }
    }

    /// Wrap a strategy, already boxed for the transport
    pub fn wrap(inner: Arc<dyn RetryStrategy>) -> Arc<dyn CoreRetryStrategy> {
        Arc::new(Self::new(inner))
    }
}

impl fmt::Debug for RetryStrategyAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryStrategyAdapter").finish_non_exhaustive()
    }
}

impl CoreRetryStrategy for RetryStrategyAdapter {
    fn retry_after(&self, request: &mut dyn CoreRetryRequest, reason: CoreRetryReason) -> CoreRetryAction {
        let mapped = RetryReason::from_core(&reason).unwrap_or_else(|| {
            tracing::warn!(reason = %reason, "unrecognized retry reason, treating as unknown");
            RetryReason::Unknown
        });

        let action = self.inner.retry_after(&CoreRequestView(&*request), mapped);

        // Recorded even when the decision is to stop.
        request.record_retry_attempt(reason);

        match action {
            RetryAction::RetryAfter(d) => CoreRetryAction::RetryAfter(d),
            RetryAction::Stop => CoreRetryAction::Stop,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
