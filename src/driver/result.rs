//! Typed results over a [`RowReader`].
//!
//! # Example
//!
//! ```ignore
//! let mut result = cluster.query("SELECT name FROM `travel-sample`", QueryOptions::default()).await?;
//! while result.next().await {
//!     let row: serde_json::Value = result.row()?;
//!     println!("{}", row);
//! }
//! if let Some(err) = result.err() {
//!     return Err(err);
//! }
//! let meta = result.metadata()?;
//! ```

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::error::{DriverError, DriverResult};
use super::metadata::{AnalyticsMetaData, QueryMetaData, SearchMetaData, SearchRow};
use super::observability::OperationObserver;
use super::stream::{ReaderState, RowReader};

/// Capacity of the channel behind [`ResultStream::into_stream`].
const ROW_CHANNEL_CAPACITY: usize = 64;

/// Metadata envelope decodable from the raw trailing bytes.
pub trait ResultMetaData: Sized {
    fn from_json(bytes: &[u8]) -> DriverResult<Self>;
}

impl ResultMetaData for QueryMetaData {
    fn from_json(bytes: &[u8]) -> DriverResult<Self> {
        QueryMetaData::from_json(bytes)
    }
}

impl ResultMetaData for AnalyticsMetaData {
    fn from_json(bytes: &[u8]) -> DriverResult<Self> {
        AnalyticsMetaData::from_json(bytes)
    }
}

impl ResultMetaData for SearchMetaData {
    fn from_json(bytes: &[u8]) -> DriverResult<Self> {
        SearchMetaData::from_json(bytes)
    }
}

// ============================================================================
// ResultStream
// ============================================================================

/// Rows of one request followed by its metadata.
///
/// The operation's span and latency stay open until the reader is terminal,
/// the result is closed, or it is dropped.
pub struct ResultStream<M> {
    reader: Box<dyn RowReader>,
    current: Option<Bytes>,
    observer: Option<OperationObserver>,
    _meta: PhantomData<fn() -> M>,
}

/// Query result.
pub type QueryResult = ResultStream<QueryMetaData>;
/// Analytics result.
pub type AnalyticsResult = ResultStream<AnalyticsMetaData>;
/// Search result.
pub type SearchResult = ResultStream<SearchMetaData>;

impl<M> std::fmt::Debug for ResultStream<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("state", &self.reader.state())
            .field("has_row", &self.current.is_some())
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

impl<M: ResultMetaData> ResultStream<M> {
    pub(crate) fn new(reader: Box<dyn RowReader>) -> Self {
        Self {
            reader,
            current: None,
            observer: None,
            _meta: PhantomData,
        }
    }

    pub(crate) fn with_observer(mut self, observer: OperationObserver) -> Self {
        self.observer = Some(observer);
        self.settle();
        self
    }

    /// Finish the observer once the reader is terminal.
    fn settle(&mut self) {
        if self.reader.state().is_terminal() {
            if let Some(observer) = self.observer.take() {
                observer.finish();
            }
        }
    }

    /// Advance to the next row. Returns false once no more rows are available;
    /// check [`err`](Self::err) afterwards.
    pub async fn next(&mut self) -> bool {
        self.current = self.reader.next_row().await;
        self.settle();
        self.current.is_some()
    }

    /// Decode the current row.
    pub fn row<T: DeserializeOwned>(&self) -> DriverResult<T> {
        let raw = self.current.as_ref().ok_or(DriverError::NoResult)?;
        serde_json::from_slice(raw)
            .map_err(|e| DriverError::decoding(format!("failed to decode row: {}", e)))
    }

    /// Raw bytes of the current row.
    pub fn raw_row(&self) -> Option<&Bytes> {
        self.current.as_ref()
    }

    /// Advance and decode in one step.
    pub async fn next_row<T: DeserializeOwned>(&mut self) -> Option<DriverResult<T>> {
        if self.next().await {
            Some(self.row())
        } else {
            None
        }
    }

    /// First row, after draining the rest of the stream.
    pub async fn one<T: DeserializeOwned>(&mut self) -> DriverResult<T> {
        let first = self.reader.next_row().await;
        while self.reader.next_row().await.is_some() {}
        self.current = None;
        self.settle();

        if let Some(err) = self.reader.err() {
            return Err(err);
        }
        let raw = first.ok_or(DriverError::NoResult)?;
        serde_json::from_slice(&raw)
            .map_err(|e| DriverError::decoding(format!("failed to decode row: {}", e)))
    }

    /// Decoded metadata; fails until every row was read or the stream closed.
    pub fn metadata(&self) -> DriverResult<M> {
        let raw = self.reader.metadata()?;
        M::from_json(&raw)
    }

    /// Raw metadata envelope.
    pub fn raw_metadata(&self) -> DriverResult<Bytes> {
        self.reader.metadata()
    }

    pub fn err(&self) -> Option<DriverError> {
        self.reader.err()
    }

    pub fn state(&self) -> ReaderState {
        self.reader.state()
    }

    /// Stop reading and release the transport.
    pub async fn close(&mut self) -> DriverResult<()> {
        self.current = None;
        let closed = self.reader.close().await;
        self.settle();
        closed
    }

    /// Consume the result as a [`Stream`] of decoded rows. A terminal error
    /// is yielded as the last item.
    pub fn into_stream<T>(mut self) -> RowStream<T>
    where
        T: DeserializeOwned + Send + 'static,
        M: 'static,
    {
        let (tx, rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(row) = self.next_row::<T>().await {
                if tx.send(row).await.is_err() {
                    let _ = self.close().await;
                    return;
                }
            }
            if let Some(err) = self.err() {
                let _ = tx.send(Err(err)).await;
            }
        });
        RowStream::from_channel(rx)
    }
}

impl<M> Drop for ResultStream<M> {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.take() {
            observer.finish();
        }
    }
}

impl SearchResult {
    /// Decode the current row as a search hit.
    pub fn search_row(&self) -> DriverResult<SearchRow> {
        let raw = self.current.as_ref().ok_or(DriverError::NoResult)?;
        SearchRow::from_json(raw)
    }
}

// ============================================================================
// RowStream
// ============================================================================

/// Async stream of decoded rows.
pub struct RowStream<T> {
    inner: Pin<Box<dyn Stream<Item = DriverResult<T>> + Send>>,
}

impl<T> std::fmt::Debug for RowStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> RowStream<T> {
    fn from_channel(rx: mpsc::Receiver<DriverResult<T>>) -> Self {
        Self {
            inner: Box::pin(ReceiverStream::new(rx)),
        }
    }

    /// Collect every row, stopping at the first error.
    pub async fn try_collect(self) -> DriverResult<Vec<T>> {
        use tokio_stream::StreamExt;

        let mut rows = Vec::new();
        let mut stream = self.inner;
        while let Some(row) = stream.next().await {
            rows.push(row?);
        }
        Ok(rows)
    }
}

impl<T> Stream for RowStream<T> {
    type Item = DriverResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
