//! Transport-side retry plumbing.
//!
//! The transports own the retry loop. They describe why a request wants to
//! be retried with a [`CoreRetryReason`] and ask a [`CoreRetryStrategy`]
//! what to do next. The driver layer plugs its user-facing strategies in
//! through an adapter, so nothing here depends on driver types.

use std::fmt;
use std::time::Duration;

/// Reason a transport wants to retry a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CoreRetryReason {
    /// Cause could not be determined
    Unknown,
    /// No socket available to dispatch on
    SocketNotAvailable,
    /// Target service is not available in the cluster
    ServiceNotAvailable,
    /// Target node is not available
    NodeNotAvailable,
    /// Node returned NOT_MY_VBUCKET
    KvNotMyVbucket,
    /// Collection manifest is outdated
    KvCollectionOutdated,
    /// Error map indicated a retry
    KvErrorMapRetryIndicated,
    /// Document is locked
    KvLocked,
    /// Temporary failure
    KvTemporaryFailure,
    /// Sync write in progress
    KvSyncWriteInProgress,
    /// Sync write re-commit in progress
    KvSyncWriteRecommitInProgress,
    /// Service response code indicated a retry
    ServiceResponseCodeIndicated,
    /// Socket closed while the request was in flight
    SocketCloseInFlight,
    /// Circuit breaker is open for the endpoint
    CircuitBreakerOpen,
    /// Prepared statement needs to be re-prepared
    QueryPreparedStatementFailure,
    /// Query index was not found
    QueryIndexNotFound,
    /// Analytics reported a temporary failure
    AnalyticsTemporaryFailure,
    /// Search service rejected the request with 429
    SearchTooManyRequests,
    /// Views reported a temporary failure
    ViewsTemporaryFailure,
    /// Views had no active partition
    ViewsNoActivePartition,
    /// Connection or cluster is not ready yet
    NotReady,
    /// Node locator could not find a node for the request
    NodeLocatorFailure,
    /// Reason introduced by a newer transport that this layer does not know
    Unrecognized(String),
}

impl CoreRetryReason {
    /// Stable, upper snake case description used in logs.
    pub fn description(&self) -> &str {
        match self {
            Self::Unrecognized(name) => name.as_str(),
            known => known.known_description().unwrap_or("UNKNOWN"),
        }
    }

    /// Description of a reason this layer defines; `None` for `Unrecognized`.
    pub fn known_description(&self) -> Option<&'static str> {
        Some(match self {
            Self::Unknown => "UNKNOWN",
            Self::SocketNotAvailable => "SOCKET_NOT_AVAILABLE",
            Self::ServiceNotAvailable => "SERVICE_NOT_AVAILABLE",
            Self::NodeNotAvailable => "NODE_NOT_AVAILABLE",
            Self::KvNotMyVbucket => "KV_NOT_MY_VBUCKET",
            Self::KvCollectionOutdated => "KV_COLLECTION_OUTDATED",
            Self::KvErrorMapRetryIndicated => "KV_ERROR_MAP_RETRY_INDICATED",
            Self::KvLocked => "KV_LOCKED",
            Self::KvTemporaryFailure => "KV_TEMPORARY_FAILURE",
            Self::KvSyncWriteInProgress => "KV_SYNC_WRITE_IN_PROGRESS",
            Self::KvSyncWriteRecommitInProgress => "KV_SYNC_WRITE_RE_COMMIT_IN_PROGRESS",
            Self::ServiceResponseCodeIndicated => "SERVICE_RESPONSE_CODE_INDICATED",
            Self::SocketCloseInFlight => "SOCKET_CLOSED_WHILE_IN_FLIGHT",
            Self::CircuitBreakerOpen => "CIRCUIT_BREAKER_OPEN",
            Self::QueryPreparedStatementFailure => "QUERY_PREPARED_STATEMENT_FAILURE",
            Self::QueryIndexNotFound => "QUERY_INDEX_NOT_FOUND",
            Self::AnalyticsTemporaryFailure => "ANALYTICS_TEMPORARY_FAILURE",
            Self::SearchTooManyRequests => "SEARCH_TOO_MANY_REQUESTS",
            Self::ViewsTemporaryFailure => "VIEWS_TEMPORARY_FAILURE",
            Self::ViewsNoActivePartition => "VIEWS_NO_ACTIVE_PARTITION",
            Self::NotReady => "NOT_READY",
            Self::NodeLocatorFailure => "NODE_LOCATOR_FAILURE",
            Self::Unrecognized(_) => return None,
        })
    }
}

impl fmt::Display for CoreRetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Decision returned to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreRetryAction {
    /// Retry once the duration has elapsed
    RetryAfter(Duration),
    /// Give up and fail the request
    Stop,
}

/// Request-scoped retry bookkeeping owned by the transport.
pub trait CoreRetryRequest: Send {
    /// Operation identifier
    fn identifier(&self) -> &str;

    /// Whether the request is safe to replay
    fn idempotent(&self) -> bool;

    /// Number of retries recorded so far
    fn retry_attempts(&self) -> u32;

    /// Distinct reasons recorded so far, first occurrence first
    fn retry_reasons(&self) -> Vec<CoreRetryReason>;

    /// Record a retry invocation for `reason`.
    fn record_retry_attempt(&mut self, reason: CoreRetryReason);
}

/// Strategy consulted by the transport whenever a request could be retried.
pub trait CoreRetryStrategy: Send + Sync {
    /// Decide what to do with `request` after a failure caused by `reason`.
    fn retry_after(&self, request: &mut dyn CoreRetryRequest, reason: CoreRetryReason) -> CoreRetryAction;
}

/// Plain retry bookkeeping for transports that do not carry their own.
#[derive(Debug, Clone, Default)]
pub struct CoreRetryState {
    identifier: String,
    idempotent: bool,
    attempts: u32,
    reasons: Vec<CoreRetryReason>,
}

impl CoreRetryState {
    /// Create bookkeeping for one request.
    pub fn new(identifier: impl Into<String>, idempotent: bool) -> Self {
        Self {
            identifier: identifier.into(),
            idempotent,
            attempts: 0,
            reasons: Vec::new(),
        }
    }
}

impl CoreRetryRequest for CoreRetryState {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn idempotent(&self) -> bool {
        self.idempotent
    }

    fn retry_attempts(&self) -> u32 {
        self.attempts
    }

    fn retry_reasons(&self) -> Vec<CoreRetryReason> {
        self.reasons.clone()
    }

    fn record_retry_attempt(&mut self, reason: CoreRetryReason) {
        self.attempts += 1;
        if !self.reasons.contains(&reason) {
            self.reasons.push(reason);
        }
    }
}
