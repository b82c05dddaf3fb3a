use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::FutureExt;
use http::Method;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::engine::{ResponseBody, StreamingResponse};
use crate::error::{BoxError, Error, ErrorKind};
use crate::options::NormalizedOptions;
use crate::progress::Progress;
use crate::response::ResponseHead;

/// Observable lifecycle notifications of a session, in the order they occur.
#[derive(Clone, Debug)]
pub enum Event {
    /// An attempt is about to be handed to the transport.
    Request { method: Method, url: Url },
    /// A response head was received, including intermediate redirect hops.
    Response(ResponseHead),
    /// A redirect is about to be followed.
    Redirect {
        response: ResponseHead,
        next: Box<NormalizedOptions>,
    },
    /// A retry is scheduled after `delay`.
    Retry { retry_count: u32, delay: Duration },
    UploadProgress(Progress),
    DownloadProgress(Progress),
}

#[derive(Clone, Debug, Default)]
pub(crate) struct EventSink {
    sender: Option<mpsc::UnboundedSender<Event>>,
}

impl EventSink {
    pub(crate) fn channel() -> (Self, EventStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            EventStream { receiver },
        )
    }

    pub(crate) fn emit(&self, event: Event) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}

/// Events of one session. Ends when the session finishes.
#[derive(Debug)]
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Write side of a duplex session. Dropping it ends the request body.
#[derive(Debug)]
pub struct RequestWriter {
    sender: mpsc::Sender<Result<Bytes, BoxError>>,
}

impl RequestWriter {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<Result<Bytes, BoxError>>) {
        let (sender, receiver) = mpsc::channel(16);
        (Self { sender }, receiver)
    }

    /// Queues one chunk of the request body.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<(), Error> {
        self.sender
            .send(Ok(chunk.into()))
            .await
            .map_err(|_| Error::validation("cannot write after the session has ended"))
    }

    /// Fails the upload with `source`.
    pub async fn abort(self, source: impl Into<BoxError>) {
        let _ = self.sender.send(Err(source.into())).await;
    }

    /// Ends the request body.
    pub fn finish(self) {}
}

enum StreamState {
    Pending(JoinHandle<Result<StreamingResponse, Error>>),
    Streaming(ResponseBody),
    Done,
}

/// Stream-style session: the response head, then the body chunk by chunk.
///
/// The session keeps running across redirects and retries until a final head
/// arrives. Dropping the stream cancels it.
pub struct RequestStream {
    state: StreamState,
    head: Option<ResponseHead>,
    cancel: CancellationToken,
    events: Option<EventStream>,
}

impl RequestStream {
    pub(crate) fn new(
        task: JoinHandle<Result<StreamingResponse, Error>>,
        cancel: CancellationToken,
        events: EventStream,
    ) -> Self {
        Self {
            state: StreamState::Pending(task),
            head: None,
            cancel,
            events: Some(events),
        }
    }

    /// Lifecycle events. Returns `None` after the first call.
    pub fn events(&mut self) -> Option<EventStream> {
        self.events.take()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits for the final response head.
    pub async fn response(&mut self) -> Result<&ResponseHead, Error> {
        std::future::poll_fn(|cx| self.poll_head(cx)).await?;
        self.head
            .as_ref()
            .ok_or_else(|| Error::validation("response stream already failed"))
    }

    pub fn head(&self) -> Option<&ResponseHead> {
        self.head.as_ref()
    }

    fn poll_head(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        let StreamState::Pending(task) = &mut self.state else {
            return Poll::Ready(if self.head.is_some() {
                Ok(())
            } else {
                Err(Error::validation("response stream already failed"))
            });
        };
        let joined = match task.poll_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(joined) => joined,
        };
        match joined_result(joined) {
            Ok(streaming) => {
                self.head = Some(streaming.head);
                self.state = StreamState::Streaming(streaming.body);
                Poll::Ready(Ok(()))
            }
            Err(error) => {
                self.state = StreamState::Done;
                Poll::Ready(Err(error))
            }
        }
    }
}

pub(crate) fn joined_result<T>(
    joined: Result<Result<T, Error>, tokio::task::JoinError>,
) -> Result<T, Error> {
    match joined {
        Ok(result) => result,
        Err(error) if error.is_panic() => std::panic::resume_unwind(error.into_panic()),
        Err(_) => Err(Error::new(ErrorKind::Cancel)),
    }
}

impl Stream for RequestStream {
    type Item = Result<Bytes, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if matches!(this.state, StreamState::Pending(_)) {
            match this.poll_head(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(error)) => return Poll::Ready(Some(Err(error))),
                Poll::Ready(Ok(())) => {}
            }
        }
        match &mut this.state {
            StreamState::Streaming(body) => match body.as_mut().poll_next(cx) {
                Poll::Ready(None) => {
                    this.state = StreamState::Done;
                    Poll::Ready(None)
                }
                other => other,
            },
            StreamState::Pending(_) | StreamState::Done => Poll::Ready(None),
        }
    }
}

impl Drop for RequestStream {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let StreamState::Pending(task) = &self.state {
            task.abort();
        }
    }
}

impl fmt::Debug for RequestStream {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            StreamState::Pending(_) => "pending",
            StreamState::Streaming(_) => "streaming",
            StreamState::Done => "done",
        };
        formatter
            .debug_struct("RequestStream")
            .field("state", &state)
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}
