use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::response::Response;
use crate::stream::{EventStream, joined_result};

/// A running promise-style session.
///
/// The session starts as soon as the promise is created. Awaiting it yields
/// the final response or error; dropping it cancels the session.
pub struct ResponsePromise {
    task: JoinHandle<Result<Response, Error>>,
    cancel: CancellationToken,
    events: Option<EventStream>,
}

impl ResponsePromise {
    pub(crate) fn new(
        task: JoinHandle<Result<Response, Error>>,
        cancel: CancellationToken,
        events: EventStream,
    ) -> Self {
        Self {
            task,
            cancel,
            events: Some(events),
        }
    }

    /// Cancels the session. Awaiting then yields a cancel error unless the
    /// session already settled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that cancels this session when triggered.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Lifecycle events. Returns `None` after the first call.
    pub fn events(&mut self) -> Option<EventStream> {
        self.events.take()
    }

    pub async fn text(self) -> Result<String, Error> {
        Ok(self.await?.text())
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T, Error> {
        self.await?.json()
    }

    pub async fn buffer(self) -> Result<Bytes, Error> {
        Ok(self.await?.into_body())
    }
}

impl Future for ResponsePromise {
    type Output = Result<Response, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.task.poll_unpin(cx).map(joined_result)
    }
}

impl Drop for ResponsePromise {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

impl fmt::Debug for ResponsePromise {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ResponsePromise")
            .field("canceled", &self.cancel.is_cancelled())
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}
