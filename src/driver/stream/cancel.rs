//! Request-scoped cancellation shared by both row readers.
//!
//! A [`CancelWatch`] owns one token canceled by whichever comes first of
//! caller cancellation, deadline expiry or `close()`. The first cause
//! recorded wins, so a failing read can be reported as a timeout, a
//! cancellation or a plain service error.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::driver::error::DriverError;
use crate::driver::normalize::{normalize_rpc, RpcErrorScope, RpcService};

const CAUSE_NONE: u8 = 0;

/// Why a request context was canceled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelCause {
    Caller = 1,
    Deadline = 2,
    Closed = 3,
}

impl CancelCause {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Caller),
            2 => Some(Self::Deadline),
            3 => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Request-scoped cancellation with a recorded cause.
#[derive(Debug, Clone)]
pub(crate) struct CancelWatch {
    token: CancellationToken,
    cause: Arc<AtomicU8>,
    deadline: Instant,
}

impl CancelWatch {
    pub(crate) fn new(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            cause: Arc::new(AtomicU8::new(CAUSE_NONE)),
            deadline,
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel the context. Returns true if `cause` is the one recorded.
    pub(crate) fn cancel(&self, cause: CancelCause) -> bool {
        let won = self
            .cause
            .compare_exchange(CAUSE_NONE, cause as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        self.token.cancel();
        won
    }

    pub(crate) fn cause(&self) -> Option<CancelCause> {
        CancelCause::from_u8(self.cause.load(Ordering::Acquire))
    }

    /// Stop the watcher task without recording a cause.
    pub(crate) fn release(&self) {
        self.token.cancel();
    }

    /// Race the caller's token against the deadline on a background task.
    pub(crate) fn spawn(&self, caller: Option<CancellationToken>) {
        let watch = self.clone();
        tokio::spawn(async move {
            let caller_cancelled = async move {
                match caller {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending::<()>().await,
                }
            };
            let deadline = tokio::time::Instant::from_std(watch.deadline);

            tokio::select! {
                _ = watch.token.cancelled() => {}
                _ = caller_cancelled => {
                    watch.cancel(CancelCause::Caller);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    watch.cancel(CancelCause::Deadline);
                }
            }
        });
    }

    /// Error for the recorded cause, if one was recorded.
    pub(crate) fn cause_error(&self, scope: &RpcErrorScope) -> Option<DriverError> {
        match self.cause()? {
            CancelCause::Deadline => Some(DriverError::timeout(
                !scope.idempotent,
                format!("{} request timed out", service_name(scope.service)),
                scope.context.clone(),
            )),
            CancelCause::Caller => Some(DriverError::cancelled("request canceled by caller")),
            CancelCause::Closed => Some(DriverError::cancelled("stream closed")),
        }
    }

    /// Translate a failed RPC, taking the recorded cause into account.
    pub(crate) fn map_status(&self, status: tonic::Status, scope: &RpcErrorScope) -> DriverError {
        self.cause_error(scope)
            .unwrap_or_else(|| normalize_rpc(status, Some(scope)))
    }
}

fn service_name(service: RpcService) -> &'static str {
    match service {
        RpcService::Query => "query",
        RpcService::Analytics => "analytics",
        RpcService::Search => "search",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::driver::error::ErrorContext;

    #[test]
    fn test_first_cause_wins() {
        let watch = CancelWatch::new(Instant::now());
        assert!(watch.cancel(CancelCause::Deadline));
        assert!(!watch.cancel(CancelCause::Caller));
        assert_eq!(watch.cause(), Some(CancelCause::Deadline));
        assert!(watch.token().is_cancelled());

        let released = CancelWatch::new(Instant::now());
        released.release();
        assert_eq!(released.cause(), None);
    }

    #[test]
    fn test_cause_error_follows_idempotency() {
        let context = ErrorContext::for_statement("SELECT 1", None);
        let write = RpcErrorScope::new(RpcService::Query, context.clone(), false);
        let read = RpcErrorScope::new(RpcService::Query, context, true);

        let watch = CancelWatch::new(Instant::now());
        assert!(watch.cause_error(&write).is_none());
        watch.cancel(CancelCause::Deadline);
        assert!(matches!(
            watch.cause_error(&write),
            Some(DriverError::AmbiguousTimeout { .. })
        ));
        assert!(matches!(
            watch.cause_error(&read),
            Some(DriverError::UnambiguousTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_spawned_watch_records_deadline() {
        let watch = CancelWatch::new(Instant::now() + Duration::from_millis(10));
        watch.spawn(None);
        watch.token().cancelled().await;
        assert_eq!(watch.cause(), Some(CancelCause::Deadline));
    }
}
