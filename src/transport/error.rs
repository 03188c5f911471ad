//! Transport error types.
//!
//! Every error either transport can raise is one variant of
//! [`TransportError`]. The driver layer translates these with an
//! exhaustive match, so adding a variant here is a compile error until the
//! normalizer handles it.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::retry::CoreRetryReason;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Server-side classification attached to a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerErrorKind {
    /// Statement could not be parsed
    ParsingFailure,
    /// Index does not exist
    IndexNotFound,
    /// Index already exists
    IndexExists,
    /// Query planner failed
    PlanningFailure,
    /// Prepared statement could not be executed
    PreparedStatementFailure,
    /// Mutation inside a statement failed
    DmlFailure,
    /// Analytics compilation failed
    CompilationFailure,
    /// Analytics job queue is full
    JobQueueFull,
    /// Analytics dataset does not exist
    DatasetNotFound,
    /// Analytics dataverse does not exist
    DataverseNotFound,
    /// Document does not exist
    DocumentNotFound,
    /// Document already exists
    DocumentExists,
    /// Document is locked
    DocumentLocked,
    /// CAS value did not match
    CasMismatch,
    /// Value exceeds the size limit
    ValueTooLarge,
    /// Requested durability cannot be met
    DurabilityImpossible,
    /// Credentials were rejected
    AuthenticationFailure,
    /// Server failed internally
    InternalServerFailure,
    /// Request was rate limited
    RateLimited,
    /// Quota exceeded
    QuotaLimited,
    /// View does not exist
    ViewNotFound,
    /// Design document does not exist
    DesignDocumentNotFound,
    /// Feature is not available in this context
    FeatureNotAvailable,
    /// Service is not available
    ServiceNotAvailable,
    /// Request was canceled
    RequestCanceled,
    /// Temporary failure
    TemporaryFailure,
    /// Not classified
    Unknown,
}

impl ServerErrorKind {
    /// Human-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ParsingFailure => "parsing failure",
            Self::IndexNotFound => "index not found",
            Self::IndexExists => "index exists",
            Self::PlanningFailure => "planning failure",
            Self::PreparedStatementFailure => "prepared statement failure",
            Self::DmlFailure => "dml failure",
            Self::CompilationFailure => "compilation failure",
            Self::JobQueueFull => "job queue full",
            Self::DatasetNotFound => "dataset not found",
            Self::DataverseNotFound => "dataverse not found",
            Self::DocumentNotFound => "document not found",
            Self::DocumentExists => "document exists",
            Self::DocumentLocked => "document locked",
            Self::CasMismatch => "cas mismatch",
            Self::ValueTooLarge => "value too large",
            Self::DurabilityImpossible => "durability impossible",
            Self::AuthenticationFailure => "authentication failure",
            Self::InternalServerFailure => "internal server failure",
            Self::RateLimited => "rate limited",
            Self::QuotaLimited => "quota limited",
            Self::ViewNotFound => "view not found",
            Self::DesignDocumentNotFound => "design document not found",
            Self::FeatureNotAvailable => "feature not available",
            Self::ServiceNotAvailable => "service not available",
            Self::RequestCanceled => "request canceled",
            Self::TemporaryFailure => "temporary failure",
            Self::Unknown => "unknown error",
        }
    }
}

impl fmt::Display for ServerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry history captured by the transport when the request failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryInfo {
    /// Distinct reasons, first occurrence first
    pub reasons: Vec<CoreRetryReason>,
    /// Total retry attempts
    pub attempts: u32,
}

impl RetryInfo {
    /// Retry info with the given reasons and attempts.
    pub fn new(reasons: Vec<CoreRetryReason>, attempts: u32) -> Self {
        Self { reasons, attempts }
    }
}

/// Key-value protocol error.
#[derive(Debug, Clone, Default)]
pub struct KeyValueErrorRecord {
    pub kind: Option<ServerErrorKind>,
    pub status_code: u16,
    pub document_key: String,
    pub bucket: String,
    pub scope: String,
    pub collection: String,
    pub collection_id: u32,
    pub error_name: String,
    pub error_description: String,
    pub opaque: u32,
    pub last_dispatched_to: String,
    pub last_dispatched_from: String,
    pub last_connection_id: String,
    pub retry: RetryInfo,
}

/// One error entry reported by the views service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewErrorDesc {
    pub source: String,
    pub message: String,
}

/// Views service error.
#[derive(Debug, Clone, Default)]
pub struct ViewErrorRecord {
    pub kind: Option<ServerErrorKind>,
    pub design_document: String,
    pub view_name: String,
    pub errors: Vec<ViewErrorDesc>,
    pub endpoint: String,
    pub http_status: u16,
    pub error_text: String,
    pub retry: RetryInfo,
}

/// One error entry reported by the query service.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryErrorDesc {
    pub code: u32,
    pub message: String,
    pub retry: bool,
    pub reason: HashMap<String, serde_json::Value>,
}

impl QueryErrorDesc {
    /// Descriptor with no retry flag or reason details.
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry: false,
            reason: HashMap::new(),
        }
    }
}

/// Query service error.
#[derive(Debug, Clone, Default)]
pub struct QueryErrorRecord {
    pub kind: Option<ServerErrorKind>,
    pub statement: String,
    pub client_context_id: String,
    pub errors: Vec<QueryErrorDesc>,
    pub endpoint: String,
    pub http_status: u16,
    pub error_text: String,
    pub retry: RetryInfo,
}

/// One error entry reported by the analytics service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyticsErrorDesc {
    pub code: u32,
    pub message: String,
}

/// Analytics service error.
#[derive(Debug, Clone, Default)]
pub struct AnalyticsErrorRecord {
    pub kind: Option<ServerErrorKind>,
    pub statement: String,
    pub client_context_id: String,
    pub errors: Vec<AnalyticsErrorDesc>,
    pub endpoint: String,
    pub http_status: u16,
    pub error_text: String,
    pub retry: RetryInfo,
}

/// Search service error.
#[derive(Debug, Clone, Default)]
pub struct SearchErrorRecord {
    pub kind: Option<ServerErrorKind>,
    pub index_name: String,
    pub query: Option<serde_json::Value>,
    pub endpoint: String,
    pub http_status: u16,
    pub error_text: String,
    pub retry: RetryInfo,
}

/// Generic HTTP service error.
#[derive(Debug, Clone, Default)]
pub struct HttpErrorRecord {
    pub kind: Option<ServerErrorKind>,
    pub endpoint: String,
    pub method: String,
    pub path: String,
    pub http_status: u16,
    pub error_text: String,
    pub retry: RetryInfo,
}

/// Request timed out inside the transport.
#[derive(Debug, Clone, Default)]
pub struct TimeoutErrorRecord {
    pub operation: String,
    pub ambiguous: bool,
    pub opaque: String,
    pub time_observed: Duration,
    pub last_dispatched_to: String,
    pub last_dispatched_from: String,
    pub last_connection_id: String,
    pub retry: RetryInfo,
}

/// Error raised by either transport.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Key-value protocol error
    KeyValue(Box<KeyValueErrorRecord>),
    /// Views service error
    View(Box<ViewErrorRecord>),
    /// Query service error
    Query(Box<QueryErrorRecord>),
    /// Analytics service error
    Analytics(Box<AnalyticsErrorRecord>),
    /// Search service error
    Search(Box<SearchErrorRecord>),
    /// Generic HTTP error
    Http(Box<HttpErrorRecord>),
    /// Transport-level timeout
    Timeout(Box<TimeoutErrorRecord>),
    /// Streaming RPC status
    Rpc(tonic::Status),
    /// Anything else, passed through untouched
    Other(Arc<dyn StdError + Send + Sync>),
}

impl TransportError {
    /// Wrap an arbitrary error.
    pub fn other<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Other(Arc::new(err))
    }

    /// Retry history attached to the error, if the shape carries one.
    pub fn retry_info(&self) -> Option<&RetryInfo> {
        match self {
            Self::KeyValue(r) => Some(&r.retry),
            Self::View(r) => Some(&r.retry),
            Self::Query(r) => Some(&r.retry),
            Self::Analytics(r) => Some(&r.retry),
            Self::Search(r) => Some(&r.retry),
            Self::Http(r) => Some(&r.retry),
            Self::Timeout(r) => Some(&r.retry),
            Self::Rpc(_) | Self::Other(_) => None,
        }
    }
}

fn kind_str(kind: &Option<ServerErrorKind>) -> &'static str {
    kind.map(|k| k.as_str()).unwrap_or("error")
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyValue(r) => write!(
                f,
                "key-value {} (status 0x{:02x}) for key '{}'",
                kind_str(&r.kind),
                r.status_code,
                r.document_key
            ),
            Self::View(r) => write!(
                f,
                "view {} for {}/{}",
                kind_str(&r.kind),
                r.design_document,
                r.view_name
            ),
            Self::Query(r) => write!(f, "query {}: {}", kind_str(&r.kind), r.error_text),
            Self::Analytics(r) => write!(f, "analytics {}: {}", kind_str(&r.kind), r.error_text),
            Self::Search(r) => write!(
                f,
                "search {} on index '{}': {}",
                kind_str(&r.kind),
                r.index_name,
                r.error_text
            ),
            Self::Http(r) => write!(
                f,
                "http {} ({} {} -> {})",
                kind_str(&r.kind),
                r.method,
                r.path,
                r.http_status
            ),
            Self::Timeout(r) => write!(
                f,
                "{} timed out after {:?}",
                r.operation, r.time_observed
            ),
            Self::Rpc(status) => write!(f, "rpc status {:?}: {}", status.code(), status.message()),
            Self::Other(err) => write!(f, "{}", err),
        }
    }
}

impl StdError for TransportError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Rpc(status) => Some(status),
            Self::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<tonic::Status> for TransportError {
    fn from(status: tonic::Status) -> Self {
        Self::Rpc(status)
    }
}
