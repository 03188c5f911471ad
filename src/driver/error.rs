//! Driver Error Types
//!
//! Every error that crosses the public boundary is a [`DriverError`].
//! Transport errors are translated by [`normalize`](super::normalize) before
//! they get here.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::retry::RetryReason;
pub use crate::transport::ServerErrorKind;

// ============================================================================
// ErrorContext - diagnostic payload
// ============================================================================

/// One error entry reported by a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorDesc {
    /// Service error code
    pub code: u32,
    /// Service error message
    pub message: String,
    /// Originating node, views only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Whether the service marked the error retriable
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retry: bool,
    /// Extra details
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub reason: HashMap<String, serde_json::Value>,
}

impl ErrorDesc {
    /// Descriptor with a code and message.
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Structured context attached to service, timeout and transport errors.
///
/// Captured once when the error is translated and never changed afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_context_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub design_document: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opaque: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_observed_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_dispatched_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_dispatched_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connection_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorDesc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub retry_reasons: Vec<RetryReason>,
    pub retry_attempts: u32,
}

impl ErrorContext {
    /// Context naming a statement and its client context id.
    pub fn for_statement(statement: impl Into<String>, client_context_id: Option<String>) -> Self {
        Self {
            statement: Some(statement.into()),
            client_context_id,
            ..Default::default()
        }
    }

    /// Context naming a search index.
    pub fn for_index(index_name: impl Into<String>) -> Self {
        Self {
            index_name: Some(index_name.into()),
            ..Default::default()
        }
    }
}

// ============================================================================
// DriverError
// ============================================================================

/// Driver error
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    /// Bad or contradictory options, detected before dispatch
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Request body could not be serialized
    #[error("Encoding error: {message}")]
    Encoding {
        message: String,
        context: Box<ErrorContext>,
    },

    /// Timed out; the operation may have taken effect
    #[error("Ambiguous timeout: {message}")]
    AmbiguousTimeout {
        message: String,
        context: Box<ErrorContext>,
    },

    /// Timed out; the operation did not take effect
    #[error("Unambiguous timeout: {message}")]
    UnambiguousTimeout {
        message: String,
        context: Box<ErrorContext>,
    },

    /// Key-value service error
    #[error("Key-value error: {message}")]
    KeyValue {
        kind: Option<ServerErrorKind>,
        message: String,
        context: Box<ErrorContext>,
    },

    /// Views service error
    #[error("View error: {message}")]
    View {
        kind: Option<ServerErrorKind>,
        message: String,
        context: Box<ErrorContext>,
    },

    /// Query service error
    #[error("Query error: {message}")]
    Query {
        kind: Option<ServerErrorKind>,
        message: String,
        context: Box<ErrorContext>,
    },

    /// Analytics service error
    #[error("Analytics error: {message}")]
    Analytics {
        kind: Option<ServerErrorKind>,
        message: String,
        context: Box<ErrorContext>,
    },

    /// Search service error
    #[error("Search error: {message}")]
    Search {
        kind: Option<ServerErrorKind>,
        message: String,
        context: Box<ErrorContext>,
    },

    /// Generic HTTP service error
    #[error("HTTP error: {message}")]
    Http {
        kind: Option<ServerErrorKind>,
        message: String,
        context: Box<ErrorContext>,
    },

    /// Lower-level transport failure
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        context: Box<ErrorContext>,
    },

    /// Canceled by the caller
    #[error("Request canceled: {0}")]
    Cancelled(String),

    /// Metadata read before the stream finished
    #[error("Metadata unavailable: {0}")]
    MetadataUnavailable(String),

    /// No row to return
    #[error("No result")]
    NoResult,

    /// Not supported by the configured transport or server
    #[error("Feature not available: {0}")]
    FeatureNotAvailable(String),

    /// Cluster or stream already closed
    #[error("Closed: {0}")]
    Closed(String),

    /// Row or metadata payload could not be decoded
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// Unrecognized error, passed through unchanged
    #[error(transparent)]
    Other(Arc<dyn StdError + Send + Sync>),
}

impl DriverError {
    /// Invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Encoding error
    pub fn encoding(msg: impl Into<String>, context: ErrorContext) -> Self {
        Self::Encoding {
            message: msg.into(),
            context: Box::new(context),
        }
    }

    /// Timeout error; `ambiguous` is false only when the operation is known not to have taken effect
    pub fn timeout(ambiguous: bool, msg: impl Into<String>, context: ErrorContext) -> Self {
        let message = msg.into();
        let context = Box::new(context);
        if ambiguous {
            Self::AmbiguousTimeout { message, context }
        } else {
            Self::UnambiguousTimeout { message, context }
        }
    }

    /// Transport error
    pub fn transport(msg: impl Into<String>, context: ErrorContext) -> Self {
        Self::Transport {
            message: msg.into(),
            context: Box::new(context),
        }
    }

    /// Cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Metadata unavailable error
    pub fn metadata_unavailable(msg: impl Into<String>) -> Self {
        Self::MetadataUnavailable(msg.into())
    }

    /// Feature not available error
    pub fn feature_not_available(msg: impl Into<String>) -> Self {
        Self::FeatureNotAvailable(msg.into())
    }

    /// Closed error
    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    /// Decoding error
    pub fn decoding(msg: impl Into<String>) -> Self {
        Self::Decoding(msg.into())
    }

    /// Diagnostic context, when the error carries one.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::Encoding { context, .. }
            | Self::AmbiguousTimeout { context, .. }
            | Self::UnambiguousTimeout { context, .. }
            | Self::KeyValue { context, .. }
            | Self::View { context, .. }
            | Self::Query { context, .. }
            | Self::Analytics { context, .. }
            | Self::Search { context, .. }
            | Self::Http { context, .. }
            | Self::Transport { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Name the serving endpoint when the context does not already.
    pub(crate) fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        if let (Some(context), Some(endpoint)) = (self.context_mut(), endpoint) {
            context.endpoint.get_or_insert(endpoint);
        }
        self
    }

    fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            Self::Encoding { context, .. }
            | Self::AmbiguousTimeout { context, .. }
            | Self::UnambiguousTimeout { context, .. }
            | Self::KeyValue { context, .. }
            | Self::View { context, .. }
            | Self::Query { context, .. }
            | Self::Analytics { context, .. }
            | Self::Search { context, .. }
            | Self::Http { context, .. }
            | Self::Transport { context, .. } => Some(context.as_mut()),
            _ => None,
        }
    }

    /// Diagnostic context rendered as JSON.
    pub fn context_json(&self) -> Option<String> {
        self.context().and_then(|ctx| serde_json::to_string(ctx).ok())
    }

    /// Server-side classification of a service error.
    pub fn kind(&self) -> Option<ServerErrorKind> {
        match self {
            Self::KeyValue { kind, .. }
            | Self::View { kind, .. }
            | Self::Query { kind, .. }
            | Self::Analytics { kind, .. }
            | Self::Search { kind, .. }
            | Self::Http { kind, .. } => *kind,
            _ => None,
        }
    }

    /// Timeout of either flavor
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::AmbiguousTimeout { .. } | Self::UnambiguousTimeout { .. }
        )
    }

    /// Whether reissuing the request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UnambiguousTimeout { .. } | Self::Transport { .. } => true,
            _ => matches!(
                self.kind(),
                Some(
                    ServerErrorKind::TemporaryFailure
                        | ServerErrorKind::ServiceNotAvailable
                        | ServerErrorKind::JobQueueFull
                        | ServerErrorKind::RateLimited
                )
            ),
        }
    }

    /// Whether the caller is at fault
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::InvalidArgument(_)
            | Self::Encoding { .. }
            | Self::FeatureNotAvailable(_)
            | Self::MetadataUnavailable(_)
            | Self::Closed(_) => true,
            _ => matches!(
                self.kind(),
                Some(
                    ServerErrorKind::ParsingFailure
                        | ServerErrorKind::CompilationFailure
                        | ServerErrorKind::AuthenticationFailure
                        | ServerErrorKind::FeatureNotAvailable
                )
            ),
        }
    }
}

impl PartialEq for DriverError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Other(a), Self::Other(b)) => Arc::ptr_eq(a, b),
            (Self::Other(_), _) | (_, Self::Other(_)) => false,
            _ => {
                std::mem::discriminant(self) == std::mem::discriminant(other)
                    && self.to_string() == other.to_string()
                    && self.context() == other.context()
            }
        }
    }
}

// ============================================================================
// Result Type
// ============================================================================

/// Driver result type
pub type DriverResult<T> = Result<T, DriverError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::invalid_argument("bad option");
        assert_eq!(err.to_string(), "Invalid argument: bad option");

        let err = DriverError::timeout(false, "query timed out", ErrorContext::default());
        assert_eq!(err.to_string(), "Unambiguous timeout: query timed out");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_driver_error_classification() {
        assert!(DriverError::invalid_argument("x").is_client_error());
        assert!(!DriverError::invalid_argument("x").is_retryable());

        let err = DriverError::timeout(true, "t", ErrorContext::default());
        assert!(matches!(err, DriverError::AmbiguousTimeout { .. }));
        assert!(!err.is_retryable());

        let err = DriverError::Query {
            kind: Some(ServerErrorKind::ParsingFailure),
            message: "syntax error".into(),
            context: Box::default(),
        };
        assert!(err.is_client_error());
        assert_eq!(err.kind(), Some(ServerErrorKind::ParsingFailure));

        let err = DriverError::Analytics {
            kind: Some(ServerErrorKind::JobQueueFull),
            message: "queue full".into(),
            context: Box::default(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_context_json_skips_empty_fields() {
        let mut ctx = ErrorContext::for_statement("SELECT 1", Some("ctx-1".into()));
        ctx.retry_reasons = vec![RetryReason::NotReady];
        ctx.retry_attempts = 2;
        let err = DriverError::transport("boom", ctx);

        let json: serde_json::Value =
            serde_json::from_str(&err.context_json().unwrap()).unwrap();
        assert_eq!(json["statement"], "SELECT 1");
        assert_eq!(json["client_context_id"], "ctx-1");
        assert_eq!(json["retry_reasons"][0], "NOT_READY");
        assert_eq!(json["retry_attempts"], 2);
        assert!(json.get("endpoint").is_none());
    }

    #[test]
    fn test_with_endpoint_keeps_existing() {
        let err = DriverError::transport("boom", ErrorContext::default())
            .with_endpoint(Some("10.0.0.1:8093".into()));
        assert_eq!(err.context().unwrap().endpoint.as_deref(), Some("10.0.0.1:8093"));

        let err = err.with_endpoint(Some("10.0.0.2:8093".into()));
        assert_eq!(err.context().unwrap().endpoint.as_deref(), Some("10.0.0.1:8093"));

        let err = DriverError::cancelled("stop").with_endpoint(Some("10.0.0.1:8093".into()));
        assert!(err.context().is_none());
    }

    #[test]
    fn test_error_equality() {
        let a = DriverError::cancelled("stop");
        assert_eq!(a.clone(), a);
        assert_ne!(a, DriverError::cancelled("other"));

        let inner: Arc<dyn StdError + Send + Sync> =
            Arc::new(std::io::Error::new(std::io::ErrorKind::Other, "io"));
        let x = DriverError::Other(inner.clone());
        assert_eq!(x, DriverError::Other(inner));
    }
}
