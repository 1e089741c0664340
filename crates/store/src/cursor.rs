//! Lazily evaluated result sets over a relation's read channel.

use crate::error::Result;
use futures::{Stream, StreamExt, TryStreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

/// A forward-only cursor over rows fetched from the read channel.
///
/// Rows are pulled one at a time from SQLite. The pooled connection backing
/// the cursor is returned as soon as the cursor is drained or dropped, so an
/// abandoned cursor never pins a reader.
pub struct Cursor<T> {
    inner: Pin<Box<dyn Stream<Item = Result<T>> + Send>>,
}

impl<T> Cursor<T> {
    pub(crate) fn new(stream: impl Stream<Item = Result<T>> + Send + 'static) -> Self {
        Self { inner: Box::pin(stream) }
    }

    /// The next row, or `None` once the result set is exhausted.
    pub async fn next(&mut self) -> Option<Result<T>> {
        self.inner.next().await
    }

    /// Drain the remaining rows into memory.
    pub async fn try_collect(self) -> Result<Vec<T>> {
        TryStreamExt::try_collect(self.inner).await
    }
}

impl<T> Stream for Cursor<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<T> std::fmt::Debug for Cursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor").finish_non_exhaustive()
    }
}
