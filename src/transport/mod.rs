//! The network capability sessions dispatch attempts through.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use http::{HeaderMap, Method, StatusCode};
use tokio::sync::mpsc;
use url::Url;

use crate::body::BodyStream;
use crate::error::{BoxError, TimeoutPhase, TransportErrorKind};

mod hyper_client;

pub use self::hyper_client::{HyperTransport, HyperTransportBuilder};

/// Progress notifications sent from the transport (and the upload side of a
/// session) while an attempt is in flight.
#[derive(Debug)]
pub(crate) enum Signal {
    PhaseStarted(TimeoutPhase),
    PhaseFinished(TimeoutPhase),
    Uploaded(usize),
    UploadFailed(BoxError),
}

/// Reports connection phases of one attempt so its timers can follow them.
#[derive(Clone, Debug)]
pub struct PhaseReporter {
    sender: mpsc::UnboundedSender<Signal>,
}

impl PhaseReporter {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Signal>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// A reporter nobody listens to.
    pub fn detached() -> Self {
        Self::channel().0
    }

    pub fn started(&self, phase: TimeoutPhase) {
        let _ = self.sender.send(Signal::PhaseStarted(phase));
    }

    pub fn finished(&self, phase: TimeoutPhase) {
        let _ = self.sender.send(Signal::PhaseFinished(phase));
    }

    pub(crate) fn uploaded(&self, chunk_len: usize) {
        let _ = self.sender.send(Signal::Uploaded(chunk_len));
    }

    pub(crate) fn upload_failed(&self, error: BoxError) {
        let _ = self.sender.send(Signal::UploadFailed(error));
    }
}

/// One attempt, ready to put on the wire.
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    /// `None` for requests without a body.
    pub body: Option<BodyStream>,
    /// Declared body size, when known up front.
    pub body_len: Option<u64>,
    pub http2: bool,
    pub phases: PhaseReporter,
}

impl fmt::Debug for TransportRequest {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TransportRequest")
            .field("method", &self.method)
            .field("url", &crate::util::redact_url_for_logs(&self.url))
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .field("body_len", &self.body_len)
            .finish_non_exhaustive()
    }
}

pub type ResponseBodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBodyStream,
    pub remote_addr: Option<SocketAddr>,
}

impl fmt::Debug for TransportResponse {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Network failure with its errno-style classification.
#[derive(Debug)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    /// Classifies an arbitrary error by walking its source chain.
    pub fn classify(source: BoxError) -> Self {
        Self {
            kind: classify_error(source.as_ref()),
            source,
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} ({})", self.source, self.kind)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

pub(crate) fn classify_error(error: &(dyn std::error::Error + 'static)) -> TransportErrorKind {
    let mut current = Some(error);
    while let Some(error) = current {
        if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
            let kind = TransportErrorKind::from_io(io_error);
            if kind != TransportErrorKind::Other {
                return kind;
            }
        }
        if let Some(transport_error) = error.downcast_ref::<TransportError>() {
            return transport_error.kind;
        }
        let text = error.to_string().to_ascii_lowercase();
        if text.contains("certificate") || text.contains("tls") {
            return TransportErrorKind::Tls;
        }
        if text.contains("failed to lookup") || text.contains("name or service not known") {
            return TransportErrorKind::HostNotFound;
        }
        if text.contains("temporary failure in name resolution") {
            return TransportErrorKind::DnsTemporaryFailure;
        }
        current = error.source();
    }
    TransportErrorKind::Other
}

/// Performs attempts on behalf of sessions.
///
/// Dropping the returned future, or the body stream of a returned response,
/// must abort the underlying I/O.
pub trait Transport: Send + Sync {
    fn supports_scheme(&self, scheme: &str) -> bool {
        matches!(scheme, "http" | "https")
    }

    fn dispatch(
        &self,
        request: TransportRequest,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>>;
}
