//! Row reader over the binary-protocol transport's chunked stream.

use async_trait::async_trait;
use bytes::Bytes;

use super::cancel::{CancelCause, CancelWatch};
use super::{ReaderCore, ReaderState, RowReader};
use crate::driver::error::{DriverError, DriverResult};
use crate::driver::metadata::SearchRow;
use crate::driver::normalize::{normalize, RpcErrorScope};
use crate::transport::MemdStreamHandle;

/// Validates one raw row before it is yielded.
pub(crate) type RowCheck = fn(&[u8]) -> DriverResult<()>;

/// Search hits must decode as a [`SearchRow`].
pub(crate) fn check_search_hit(raw: &[u8]) -> DriverResult<()> {
    SearchRow::from_json(raw).map(|_| ())
}

/// Reader over a [`MemdStreamHandle`].
///
/// The handle is dropped as soon as the reader reaches a terminal state, which
/// releases the underlying connection on every exit path. Rows failing the
/// row check are skipped and the first failure is reported by `err()` once
/// the reader is terminal.
pub struct MemdRowReader {
    handle: Option<Box<dyn MemdStreamHandle>>,
    core: ReaderCore,
    check: Option<RowCheck>,
    cancel: Option<(CancelWatch, RpcErrorScope)>,
}

impl std::fmt::Debug for MemdRowReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemdRowReader")
            .field("state", &self.core.state())
            .field("open", &self.handle.is_some())
            .field("checked", &self.check.is_some())
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

impl MemdRowReader {
    pub fn new(handle: Box<dyn MemdStreamHandle>) -> Self {
        Self {
            handle: Some(handle),
            core: ReaderCore::default(),
            check: None,
            cancel: None,
        }
    }

    /// Run `check` on every row before yielding it.
    pub(crate) fn with_row_check(mut self, check: RowCheck) -> Self {
        self.check = Some(check);
        self
    }

    /// Abort the stream once `watch` fires, reporting its cause against `scope`.
    pub(crate) fn with_cancel(mut self, watch: CancelWatch, scope: RpcErrorScope) -> Self {
        self.cancel = Some((watch, scope));
        self
    }

    fn absorb(&mut self, rows: Vec<Bytes>) {
        let Some(check) = self.check else {
            self.core.push_rows(rows);
            return;
        };
        for row in rows {
            match check(&row) {
                Ok(()) => self.core.push_rows(Some(row)),
                Err(err) => self.core.record_decode_error(err),
            }
        }
    }

    /// Drop the handle and stop the watcher; called on every terminal transition.
    fn release(&mut self) {
        self.handle = None;
        if let Some((watch, _)) = &self.cancel {
            watch.release();
        }
    }

    async fn fetch(&mut self) {
        let Some(handle) = self.handle.as_mut() else {
            return;
        };

        let next = match &self.cancel {
            Some((watch, _)) => {
                let token = watch.token();
                tokio::select! {
                    biased;
                    r = handle.next_chunk() => Some(r),
                    _ = token.cancelled() => None,
                }
            }
            None => Some(handle.next_chunk().await),
        };

        match next {
            Some(Ok(chunk)) => {
                self.absorb(chunk.rows);
                if let Some(metadata) = chunk.metadata {
                    self.core.finish(metadata);
                    self.release();
                }
            }
            Some(Err(err)) => {
                let endpoint = handle.endpoint();
                self.core.fail(normalize(err).with_endpoint(endpoint));
                self.release();
            }
            None => self.abort().await,
        }
    }

    /// The request context fired mid-stream: stop the response and fail.
    async fn abort(&mut self) {
        let mut endpoint = None;
        if let Some(mut handle) = self.handle.take() {
            endpoint = handle.endpoint();
            if let Err(err) = handle.close().await {
                tracing::warn!(error = %err, "failed to close canceled stream");
            }
        }

        let err = self
            .cancel
            .as_ref()
            .and_then(|(watch, scope)| watch.cause_error(scope))
            .unwrap_or_else(|| DriverError::cancelled("request context canceled"));
        tracing::debug!(error = %err, "stream aborted before completion");

        self.core.fail(err.with_endpoint(endpoint));
        self.release();
    }
}

#[async_trait]
impl RowReader for MemdRowReader {
    async fn next_row(&mut self) -> Option<Bytes> {
        loop {
            if let Some(row) = self.core.pop() {
                return Some(row);
            }
            if self.core.state() != ReaderState::Active || self.handle.is_none() {
                return None;
            }
            self.fetch().await;
        }
    }

    fn err(&self) -> Option<DriverError> {
        self.core.err()
    }

    fn metadata(&self) -> DriverResult<Bytes> {
        self.core.metadata()
    }

    async fn close(&mut self) -> DriverResult<()> {
        if !self.core.close_by_caller() {
            return self.core.close_result();
        }
        if let Some((watch, _)) = &self.cancel {
            watch.cancel(CancelCause::Closed);
        }
        if let Some(mut handle) = self.handle.take() {
            if let Err(err) = handle.close().await {
                tracing::warn!(error = %err, "failed to close query stream");
            }
        }
        Ok(())
    }

    fn state(&self) -> ReaderState {
        self.core.state()
    }
}

impl Drop for MemdRowReader {
    fn drop(&mut self) {
        if let Some((watch, _)) = &self.cancel {
            watch.release();
        }
    }
}
