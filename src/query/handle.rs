//! Awaitable, cancellable query handles.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::QueryId;
use crate::error::Result;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Externally owned cancellation signal. Cancelling it cancels the query;
    /// cancelling the query never cancels it.
    pub signal: Option<CancellationToken>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Handle to a running query.
///
/// The handle is a future resolving to the query result and also the
/// control for cancelling it. The query runs on its own task, so dropping
/// the handle detaches from the result without stopping the query; call
/// [`QueryHandle::cancel`] first to stop it.
pub struct QueryHandle<T> {
    id: QueryId,
    token: CancellationToken,
    result: BoxFuture<'static, Result<T>>,
}

impl<T: Send + 'static> QueryHandle<T> {
    pub(crate) fn new<F>(id: QueryId, token: CancellationToken, result: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            id,
            token,
            result: result.boxed(),
        }
    }

    pub fn id(&self) -> &QueryId {
        &self.id
    }

    /// Requests cancellation.
    ///
    /// Safe to call any number of times; once the query has settled it has
    /// no effect on the result.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The query's cancellation token.
    ///
    /// Reports cancellation from any source, including a linked external
    /// signal. Cancelling the returned token cancels the query.
    pub fn signal(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Consumes the handle and waits for the result.
    pub async fn result(self) -> Result<T> {
        self.result.await
    }

    /// Transforms the successful result, keeping id and cancellation.
    pub fn map<U, F>(self, f: F) -> QueryHandle<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        QueryHandle {
            id: self.id,
            token: self.token,
            result: self.result.map(|r| r.map(f)).boxed(),
        }
    }
}

impl<T> Future for QueryHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.result.as_mut().poll(cx)
    }
}

impl<T> fmt::Debug for QueryHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}
