//! Error Normalizer
//!
//! Translates [`TransportError`] values into the public [`DriverError`]
//! taxonomy. Each transport record is copied field for field into an
//! [`ErrorContext`]; retry history is carried across with reasons this layer
//! cannot name dropped.

use tonic::Code;

use super::error::{DriverError, ErrorContext, ErrorDesc, ServerErrorKind};
use super::retry::map_core_reasons;
use crate::transport::{
    AnalyticsErrorRecord, HttpErrorRecord, KeyValueErrorRecord, QueryErrorRecord, RetryInfo,
    SearchErrorRecord, TimeoutErrorRecord, TransportError, ViewErrorRecord,
};

/// Query error code raised when a statement must be routed through a scope.
pub const QUERY_SCOPE_LEVEL_REQUIRED: u32 = 1197;

const SCOPE_LEVEL_MESSAGE: &str =
    "this statement targets a scope-level resource; run it with Scope::query instead of Cluster::query";

/// Service an RPC status came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcService {
    Query,
    Analytics,
    Search,
}

/// What the caller knows about an RPC when its status is translated.
#[derive(Debug, Clone)]
pub struct RpcErrorScope {
    pub service: RpcService,
    pub context: ErrorContext,
    /// Read-only requests time out unambiguously
    pub idempotent: bool,
}

impl RpcErrorScope {
    pub fn new(service: RpcService, context: ErrorContext, idempotent: bool) -> Self {
        Self {
            service,
            context,
            idempotent,
        }
    }
}

/// Translate a transport error into the public taxonomy.
pub fn normalize(err: TransportError) -> DriverError {
    match err {
        TransportError::KeyValue(record) => key_value(*record),
        TransportError::View(record) => view(*record),
        TransportError::Query(record) => query(*record),
        TransportError::Analytics(record) => analytics(*record),
        TransportError::Search(record) => search(*record),
        TransportError::Http(record) => http(*record),
        TransportError::Timeout(record) => timeout(*record),
        TransportError::Rpc(status) => normalize_rpc(status, None),
        TransportError::Other(inner) => DriverError::Other(inner),
    }
}

impl From<TransportError> for DriverError {
    fn from(err: TransportError) -> Self {
        normalize(err)
    }
}

fn apply_retry(ctx: &mut ErrorContext, retry: &RetryInfo) {
    ctx.retry_reasons = map_core_reasons(&retry.reasons);
    ctx.retry_attempts = retry.attempts;
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn non_zero(status: u16) -> Option<u16> {
    (status != 0).then_some(status)
}

fn message_for(kind: Option<ServerErrorKind>, first: Option<&str>, text: &str) -> String {
    first
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .or_else(|| non_empty(text.to_string()))
        .unwrap_or_else(|| kind.unwrap_or(ServerErrorKind::Unknown).to_string())
}

fn key_value(r: KeyValueErrorRecord) -> DriverError {
    let mut ctx = ErrorContext {
        document_key: non_empty(r.document_key),
        bucket: non_empty(r.bucket),
        scope: non_empty(r.scope),
        collection: non_empty(r.collection),
        collection_id: (r.collection_id != 0).then_some(r.collection_id),
        status_code: Some(r.status_code),
        error_name: non_empty(r.error_name.clone()),
        error_description: non_empty(r.error_description.clone()),
        opaque: (r.opaque != 0).then(|| format!("0x{:x}", r.opaque)),
        last_dispatched_to: non_empty(r.last_dispatched_to),
        last_dispatched_from: non_empty(r.last_dispatched_from),
        last_connection_id: non_empty(r.last_connection_id),
        ..Default::default()
    };
    apply_retry(&mut ctx, &r.retry);

    let message = message_for(r.kind, Some(&r.error_description), &r.error_name);
    DriverError::KeyValue {
        kind: r.kind,
        message,
        context: Box::new(ctx),
    }
}

fn view(r: ViewErrorRecord) -> DriverError {
    let message = message_for(
        r.kind,
        r.errors.first().map(|e| e.message.as_str()),
        &r.error_text,
    );
    let mut ctx = ErrorContext {
        design_document: non_empty(r.design_document),
        view_name: non_empty(r.view_name),
        endpoint: non_empty(r.endpoint),
        http_status: non_zero(r.http_status),
        error_text: non_empty(r.error_text),
        errors: r
            .errors
            .into_iter()
            .map(|e| ErrorDesc {
                source: non_empty(e.source),
                ..ErrorDesc::new(0, e.message)
            })
            .collect(),
        ..Default::default()
    };
    apply_retry(&mut ctx, &r.retry);

    DriverError::View {
        kind: r.kind,
        message,
        context: Box::new(ctx),
    }
}

fn query(r: QueryErrorRecord) -> DriverError {
    let scope_level = r
        .errors
        .iter()
        .any(|e| e.code == QUERY_SCOPE_LEVEL_REQUIRED);

    let mut message = message_for(
        r.kind,
        r.errors.first().map(|e| e.message.as_str()),
        &r.error_text,
    );
    let mut kind = r.kind;
    if scope_level {
        message = SCOPE_LEVEL_MESSAGE.to_string();
        kind = Some(ServerErrorKind::FeatureNotAvailable);
    }

    let mut ctx = ErrorContext {
        statement: non_empty(r.statement),
        client_context_id: non_empty(r.client_context_id),
        endpoint: non_empty(r.endpoint),
        http_status: non_zero(r.http_status),
        error_text: non_empty(r.error_text),
        errors: r
            .errors
            .into_iter()
            .map(|e| ErrorDesc {
                retry: e.retry,
                reason: e.reason,
                ..ErrorDesc::new(e.code, e.message)
            })
            .collect(),
        ..Default::default()
    };
    apply_retry(&mut ctx, &r.retry);

    DriverError::Query {
        kind,
        message,
        context: Box::new(ctx),
    }
}

fn analytics(r: AnalyticsErrorRecord) -> DriverError {
    let message = message_for(
        r.kind,
        r.errors.first().map(|e| e.message.as_str()),
        &r.error_text,
    );
    let mut ctx = ErrorContext {
        statement: non_empty(r.statement),
        client_context_id: non_empty(r.client_context_id),
        endpoint: non_empty(r.endpoint),
        http_status: non_zero(r.http_status),
        error_text: non_empty(r.error_text),
        errors: r
            .errors
            .into_iter()
            .map(|e| ErrorDesc::new(e.code, e.message))
            .collect(),
        ..Default::default()
    };
    apply_retry(&mut ctx, &r.retry);

    DriverError::Analytics {
        kind: r.kind,
        message,
        context: Box::new(ctx),
    }
}

fn search(r: SearchErrorRecord) -> DriverError {
    let message = message_for(r.kind, None, &r.error_text);
    let mut ctx = ErrorContext {
        index_name: non_empty(r.index_name),
        query: r.query,
        endpoint: non_empty(r.endpoint),
        http_status: non_zero(r.http_status),
        error_text: non_empty(r.error_text),
        ..Default::default()
    };
    apply_retry(&mut ctx, &r.retry);

    DriverError::Search {
        kind: r.kind,
        message,
        context: Box::new(ctx),
    }
}

fn http(r: HttpErrorRecord) -> DriverError {
    let message = message_for(r.kind, None, &r.error_text);
    let mut ctx = ErrorContext {
        endpoint: non_empty(r.endpoint),
        method: non_empty(r.method),
        path: non_empty(r.path),
        http_status: non_zero(r.http_status),
        error_text: non_empty(r.error_text),
        ..Default::default()
    };
    apply_retry(&mut ctx, &r.retry);

    DriverError::Http {
        kind: r.kind,
        message,
        context: Box::new(ctx),
    }
}

fn timeout(r: TimeoutErrorRecord) -> DriverError {
    let message = format!("{} timed out after {:?}", r.operation, r.time_observed);
    let mut ctx = ErrorContext {
        operation: non_empty(r.operation),
        opaque: non_empty(r.opaque),
        time_observed_us: Some(r.time_observed.as_micros() as u64),
        last_dispatched_to: non_empty(r.last_dispatched_to),
        last_dispatched_from: non_empty(r.last_dispatched_from),
        last_connection_id: non_empty(r.last_connection_id),
        ..Default::default()
    };
    apply_retry(&mut ctx, &r.retry);

    DriverError::timeout(r.ambiguous, message, ctx)
}

/// Translate an RPC status, using what the caller knows about the request.
pub fn normalize_rpc(status: tonic::Status, scope: Option<&RpcErrorScope>) -> DriverError {
    let message = status.message().to_string();
    let ctx = scope.map(|s| s.context.clone()).unwrap_or_default();

    match status.code() {
        Code::DeadlineExceeded => {
            let ambiguous = !scope.map(|s| s.idempotent).unwrap_or(false);
            DriverError::timeout(ambiguous, message, ctx)
        }
        Code::Cancelled => DriverError::cancelled(message),
        Code::InvalidArgument => DriverError::invalid_argument(message),
        Code::Unimplemented => DriverError::feature_not_available(message),
        code => {
            let kind = match (code, scope.map(|s| s.service)) {
                (Code::NotFound, Some(RpcService::Analytics)) => Some(ServerErrorKind::DatasetNotFound),
                (Code::NotFound, _) => Some(ServerErrorKind::IndexNotFound),
                (Code::AlreadyExists, _) => Some(ServerErrorKind::IndexExists),
                (Code::Unauthenticated | Code::PermissionDenied, _) => {
                    Some(ServerErrorKind::AuthenticationFailure)
                }
                (Code::ResourceExhausted, _) => Some(ServerErrorKind::RateLimited),
                (Code::Unavailable, _) => Some(ServerErrorKind::ServiceNotAvailable),
                (Code::Aborted, _) => Some(ServerErrorKind::RequestCanceled),
                (Code::Internal, _) => Some(ServerErrorKind::InternalServerFailure),
                _ => None,
            };
            service_error(scope.map(|s| s.service), kind, message, ctx)
        }
    }
}

fn service_error(
    service: Option<RpcService>,
    kind: Option<ServerErrorKind>,
    message: String,
    context: ErrorContext,
) -> DriverError {
    let context = Box::new(context);
    match service {
        Some(RpcService::Query) => DriverError::Query {
            kind,
            message,
            context,
        },
        Some(RpcService::Analytics) => DriverError::Analytics {
            kind,
            message,
            context,
        },
        Some(RpcService::Search) => DriverError::Search {
            kind,
            message,
            context,
        },
        None => DriverError::Transport { message, context },
    }
}

// ============================================================================
// Tests
// ============================================================================
