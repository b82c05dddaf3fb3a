use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::ser::SerializeStruct;
use thiserror::Error as ThisError;
use url::Url;

use crate::options::NormalizedOptions;
use crate::response::Response;
use crate::timings::Timings;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errno-style classification of a transport failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    TimedOut,
    ConnectionReset,
    ConnectionRefused,
    AddressInUse,
    BrokenPipe,
    HostNotFound,
    DnsTemporaryFailure,
    NetworkUnreachable,
    Tls,
    Other,
}

impl TransportErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TimedOut => "ETIMEDOUT",
            Self::ConnectionReset => "ECONNRESET",
            Self::ConnectionRefused => "ECONNREFUSED",
            Self::AddressInUse => "EADDRINUSE",
            Self::BrokenPipe => "EPIPE",
            Self::HostNotFound => "ENOTFOUND",
            Self::DnsTemporaryFailure => "EAI_AGAIN",
            Self::NetworkUnreachable => "ENETUNREACH",
            Self::Tls => "ETLS",
            Self::Other => "EOTHER",
        }
    }

    pub fn from_io(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => Self::TimedOut,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => Self::ConnectionReset,
            ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            ErrorKind::AddrInUse => Self::AddressInUse,
            ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => Self::BrokenPipe,
            ErrorKind::NetworkUnreachable | ErrorKind::HostUnreachable => {
                Self::NetworkUnreachable
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Lifecycle phase a timer is armed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    Lookup,
    Connect,
    SecureConnect,
    Socket,
    Send,
    Response,
    Read,
    Request,
}

impl TimeoutPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lookup => "lookup",
            Self::Connect => "connect",
            Self::SecureConnect => "secureConnect",
            Self::Socket => "socket",
            Self::Send => "send",
            Self::Response => "response",
            Self::Read => "read",
            Self::Request => "request",
        }
    }
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Validation,
    Request,
    HttpStatus,
    MaxRedirects,
    Timeout,
    Read,
    Upload,
    Cache,
    UnsupportedProtocol,
    Cancel,
    Parse,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Request => "request",
            Self::HttpStatus => "http_status",
            Self::MaxRedirects => "max_redirects",
            Self::Timeout => "timeout",
            Self::Read => "read",
            Self::Upload => "upload",
            Self::Cache => "cache",
            Self::UnsupportedProtocol => "unsupported_protocol",
            Self::Cancel => "cancel",
            Self::Parse => "parse",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum ErrorKind {
    #[error("invalid options: {message}")]
    Validation { message: String },
    #[error("request failed ({kind}) for {method} {url}: {source}")]
    Request {
        kind: TransportErrorKind,
        method: String,
        url: String,
        #[source]
        source: BoxError,
    },
    #[error("response code {status} ({reason}) for {method} {url}")]
    HttpStatus {
        status: u16,
        reason: String,
        method: String,
        url: String,
    },
    #[error("redirected {max_redirects} times, aborting")]
    MaxRedirects {
        max_redirects: usize,
        redirect_urls: Vec<Url>,
    },
    #[error("timeout awaiting '{phase}' for {timeout_ms}ms")]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        elapsed_ms: u128,
    },
    #[error("failed to read response body: {source}")]
    Read {
        kind: Option<TransportErrorKind>,
        #[source]
        source: BoxError,
    },
    #[error("failed to stream request body: {source}")]
    Upload {
        #[source]
        source: BoxError,
    },
    #[error("cache storage failure: {source}")]
    Cache {
        #[source]
        source: BoxError,
    },
    #[error("unsupported protocol \"{protocol}\"")]
    UnsupportedProtocol { protocol: String },
    #[error("promise was canceled")]
    Cancel,
    #[error("failed to parse response body as {response_type}: {source}")]
    Parse {
        response_type: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("invalid redirect location {location}: {reason}")]
    InvalidRedirectLocation { location: String, reason: String },
    #[error("cannot follow {status} redirect: request body was already consumed")]
    RedirectBodyNotReplayable { status: u16 },
    #[error("hook failed: {source}")]
    Hook {
        #[source]
        source: BoxError,
    },
    #[error("cookie jar failure: {source}")]
    CookieJar {
        #[source]
        source: BoxError,
    },
}

impl ErrorKind {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } => ErrorCode::Validation,
            Self::Request { .. }
            | Self::InvalidRedirectLocation { .. }
            | Self::RedirectBodyNotReplayable { .. }
            | Self::Hook { .. }
            | Self::CookieJar { .. } => ErrorCode::Request,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::MaxRedirects { .. } => ErrorCode::MaxRedirects,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Read { .. } => ErrorCode::Read,
            Self::Upload { .. } => ErrorCode::Upload,
            Self::Cache { .. } => ErrorCode::Cache,
            Self::UnsupportedProtocol { .. } => ErrorCode::UnsupportedProtocol,
            Self::Cancel => ErrorCode::Cancel,
            Self::Parse { .. } => ErrorCode::Parse,
        }
    }
}

/// Error surfaced by a request session.
///
/// Besides its [`ErrorKind`], an error carries the options of the attempt
/// that produced it, the response when one was received, and a timing
/// snapshot. None of these attachments are serialized.
pub struct Error {
    kind: ErrorKind,
    options: Option<Arc<NormalizedOptions>>,
    response: Option<Box<Response>>,
    timings: Option<Timings>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            options: None,
            response: None,
            timings: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation {
            message: message.into(),
        })
    }

    pub fn cancel() -> Self {
        Self::new(ErrorKind::Cancel)
    }

    /// Wraps a failure raised by user code (hooks, handlers, delay functions).
    pub fn hook(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        match source.downcast::<Error>() {
            Ok(error) => *error,
            Err(source) => Self::new(ErrorKind::Hook { source }),
        }
    }

    pub(crate) fn timeout(phase: TimeoutPhase, limit: Duration, elapsed: Duration) -> Self {
        Self::new(ErrorKind::Timeout {
            phase,
            timeout_ms: limit.as_millis(),
            elapsed_ms: elapsed.as_millis(),
        })
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> ErrorCode {
        self.kind.code()
    }

    /// Transport code used by retry allow-lists. Timeouts report `ETIMEDOUT`.
    pub fn transport_code(&self) -> Option<TransportErrorKind> {
        match &self.kind {
            ErrorKind::Request { kind, .. } => Some(*kind),
            ErrorKind::Read { kind, .. } => *kind,
            ErrorKind::Timeout { .. } => Some(TransportErrorKind::TimedOut),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.kind {
            ErrorKind::HttpStatus { status, .. } => Some(*status),
            _ => self.response.as_ref().map(|response| response.status().as_u16()),
        }
    }

    pub fn timeout_phase(&self) -> Option<TimeoutPhase> {
        match &self.kind {
            ErrorKind::Timeout { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub fn redirect_urls(&self) -> &[Url] {
        match &self.kind {
            ErrorKind::MaxRedirects { redirect_urls, .. } => redirect_urls,
            _ => self
                .response
                .as_ref()
                .map(|response| response.redirect_urls())
                .unwrap_or_default(),
        }
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancel)
    }

    pub fn options(&self) -> Option<&NormalizedOptions> {
        self.options.as_deref()
    }

    pub fn response(&self) -> Option<&Response> {
        self.response.as_deref()
    }

    pub fn take_response(&mut self) -> Option<Response> {
        self.response.take().map(|response| *response)
    }

    pub fn timings(&self) -> Option<&Timings> {
        self.timings.as_ref()
    }

    pub fn with_response(mut self, response: Response) -> Self {
        self.response = Some(Box::new(response));
        self
    }

    pub(crate) fn attach_options(&mut self, options: &Arc<NormalizedOptions>) {
        if self.options.is_none() {
            self.options = Some(Arc::clone(options));
        }
    }

    pub(crate) fn attach_timings(&mut self, timings: Timings) {
        if self.timings.is_none() {
            self.timings = Some(timings);
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Error")
            .field("code", &self.code())
            .field("kind", &self.kind)
            .field("has_response", &self.response.is_some())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, formatter)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.kind)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl serde::Serialize for Error {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Error", 3)?;
        state.serialize_field("code", self.code().as_str())?;
        state.serialize_field("message", &self.kind.to_string())?;
        state.serialize_field(
            "transport_code",
            &self.transport_code().map(TransportErrorKind::as_str),
        )?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_wrapping_keeps_library_errors() {
        let original = Error::validation("bad header");
        let wrapped = Error::hook(Box::new(original) as BoxError);
        assert_eq!(wrapped.code(), ErrorCode::Validation);

        let foreign = Error::hook("boom");
        assert!(matches!(foreign.kind(), ErrorKind::Hook { .. }));
        assert_eq!(foreign.code(), ErrorCode::Request);
    }

    #[test]
    fn timeouts_report_etimedout() {
        let error = Error::timeout(
            TimeoutPhase::Request,
            Duration::from_millis(50),
            Duration::from_millis(51),
        );
        assert_eq!(error.transport_code(), Some(TransportErrorKind::TimedOut));
        assert_eq!(error.timeout_phase(), Some(TimeoutPhase::Request));
        assert_eq!(error.to_string(), "timeout awaiting 'request' for 50ms");
    }

    #[test]
    fn serialization_skips_attachments() {
        let error = Error::new(ErrorKind::UnsupportedProtocol {
            protocol: "ftp:".to_owned(),
        });
        let value = serde_json::to_value(&error).expect("serialize error");
        let object = value.as_object().expect("error serializes to an object");
        assert_eq!(object.len(), 3);
        assert_eq!(object["code"], "unsupported_protocol");
        assert!(object.get("options").is_none());
        assert!(object.get("response").is_none());
    }

    #[test]
    fn io_errors_map_to_errno_codes() {
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(
            TransportErrorKind::from_io(&reset),
            TransportErrorKind::ConnectionReset
        );
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(TransportErrorKind::from_io(&refused).as_str(), "ECONNREFUSED");
    }
}
