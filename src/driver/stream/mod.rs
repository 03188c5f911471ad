//! Row Stream Readers
//!
//! Pull-based iteration over a streamed response, one implementation per
//! transport behind the [`RowReader`] contract.
//!
//! # State machine
//!
//! ```text
//!            rows arrive                 end of stream, buffer empty
//!   Active ───────────────► Active ─────────────────────────────► ClosedClean
//!     │                       │ end of stream, rows buffered          ▲
//!     │                       ▼                                       │
//!     │                    Draining ──────── buffer empty ────────────┘
//!     │ transport error
//!     ├──────────────────────────────────────────────────────────────► ClosedError
//!     │ close()
//!     └──────────────────────────────────────────────────────────────► ClosedByCaller
//! ```
//!
//! Terminal states are sticky. Metadata is readable only once terminal.
//! A reader is driven by a single consumer; concurrent `next_row` calls on one
//! reader are not supported.

mod cancel;
mod grpc;
mod memd;

pub(crate) use cancel::CancelWatch;
pub use grpc::GrpcRowReader;
pub(crate) use grpc::{
    AnalyticsChunkDecoder, ChunkDecoder, QueryChunkDecoder, SearchChunkDecoder,
};
pub use memd::MemdRowReader;
pub(crate) use memd::check_search_hit;

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;

use super::error::{DriverError, DriverResult};

/// Lifecycle of a row reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Rows may still arrive
    Active,
    /// Upstream finished; buffered rows not yet yielded
    Draining,
    /// Upstream signaled end of stream and every row was yielded
    ClosedClean,
    /// Upstream signaled failure
    ClosedError,
    /// Closed by the caller before completion
    ClosedByCaller,
}

impl ReaderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ClosedClean | Self::ClosedError | Self::ClosedByCaller
        )
    }
}

/// Pull iterator over the rows of one streamed response.
#[async_trait]
pub trait RowReader: Send {
    /// Next row in wire order, or `None` once no more rows are observable.
    async fn next_row(&mut self) -> Option<Bytes>;

    /// Terminal error, if any. Row decode failures are reported once terminal.
    fn err(&self) -> Option<DriverError>;

    /// Trailing metadata envelope; fails until the reader is terminal.
    fn metadata(&self) -> DriverResult<Bytes>;

    /// Stop the stream and release its transport resources.
    async fn close(&mut self) -> DriverResult<()>;

    /// Current state.
    fn state(&self) -> ReaderState;
}

// ============================================================================
// ReaderCore - state shared by both implementations
// ============================================================================

/// Buffer, state and captured outcome of a reader.
#[derive(Debug)]
pub(crate) struct ReaderCore {
    state: ReaderState,
    buffer: VecDeque<Bytes>,
    metadata: Option<Bytes>,
    error: Option<DriverError>,
    decode_error: Option<DriverError>,
}

impl Default for ReaderCore {
    fn default() -> Self {
        Self {
            state: ReaderState::Active,
            buffer: VecDeque::new(),
            metadata: None,
            error: None,
            decode_error: None,
        }
    }
}

impl ReaderCore {
    pub(crate) fn state(&self) -> ReaderState {
        self.state
    }

    pub(crate) fn push_rows(&mut self, rows: impl IntoIterator<Item = Bytes>) {
        if self.state == ReaderState::Active {
            self.buffer.extend(rows);
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Bytes> {
        let row = self.buffer.pop_front()?;
        if self.state == ReaderState::Draining && self.buffer.is_empty() {
            self.state = ReaderState::ClosedClean;
        }
        Some(row)
    }

    /// Upstream reached end of stream with `metadata`.
    pub(crate) fn finish(&mut self, metadata: Bytes) {
        if self.state != ReaderState::Active {
            return;
        }
        self.metadata = Some(metadata);
        self.state = if self.buffer.is_empty() {
            ReaderState::ClosedClean
        } else {
            ReaderState::Draining
        };
    }

    /// Upstream failed. Buffered rows are discarded.
    pub(crate) fn fail(&mut self, err: DriverError) {
        if self.state.is_terminal() {
            return;
        }
        self.buffer.clear();
        self.error = Some(err);
        self.state = ReaderState::ClosedError;
    }

    /// A row could not be decoded; iteration continues.
    pub(crate) fn record_decode_error(&mut self, err: DriverError) {
        if self.decode_error.is_none() {
            tracing::debug!(error = %err, "row decode failed, continuing");
            self.decode_error = Some(err);
        }
    }

    /// Caller closed the reader. Returns true if upstream was still active.
    pub(crate) fn close_by_caller(&mut self) -> bool {
        match self.state {
            ReaderState::Active => {
                self.buffer.clear();
                self.state = ReaderState::ClosedByCaller;
                true
            }
            ReaderState::Draining => {
                self.buffer.clear();
                self.state = ReaderState::ClosedClean;
                false
            }
            _ => false,
        }
    }

    pub(crate) fn err(&self) -> Option<DriverError> {
        if let Some(err) = &self.error {
            return Some(err.clone());
        }
        if self.state.is_terminal() {
            return self.decode_error.clone();
        }
        None
    }

    pub(crate) fn metadata(&self) -> DriverResult<Bytes> {
        if !self.state.is_terminal() {
            return Err(DriverError::metadata_unavailable(
                "metadata is available once all rows have been read or the stream is closed",
            ));
        }
        self.metadata
            .clone()
            .ok_or_else(|| DriverError::metadata_unavailable("stream ended without metadata"))
    }

    /// Result of `close()` on a reader that was already terminal.
    pub(crate) fn close_result(&self) -> DriverResult<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
