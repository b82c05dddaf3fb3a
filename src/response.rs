use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use base64::Engine as _;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{Error, ErrorKind};
use crate::options::NormalizedOptions;
use crate::timings::Timings;

/// What a promise-style session parses the body into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseType {
    #[default]
    Text,
    Json,
    Buffer,
}

impl ResponseType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
            Self::Buffer => "buffer",
        }
    }
}

/// Text encoding used when a body is rendered as a string.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
    Ascii,
    Hex,
    Base64,
}

impl Encoding {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Latin1 => "latin1",
            Self::Ascii => "ascii",
            Self::Hex => "hex",
            Self::Base64 => "base64",
        }
    }

    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().map(|byte| char::from(*byte)).collect(),
            Self::Ascii => bytes.iter().map(|byte| char::from(byte & 0x7f)).collect(),
            Self::Hex => bytes.iter().map(|byte| format!("{byte:02x}")).collect(),
            Self::Base64 => base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        match label.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Self::Utf8),
            "latin1" | "binary" => Ok(Self::Latin1),
            "ascii" => Ok(Self::Ascii),
            "hex" => Ok(Self::Hex),
            "base64" => Ok(Self::Base64),
            other => Err(Error::validation(format!("unknown encoding `{other}`"))),
        }
    }
}

/// Status line, headers and session metadata of a received response.
#[derive(Clone, Debug)]
pub struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) url: Url,
    pub(crate) request_url: Url,
    pub(crate) redirect_urls: Vec<Url>,
    pub(crate) retry_count: u32,
    pub(crate) is_from_cache: bool,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) timings: Timings,
}

impl ResponseHead {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Final URL after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// URL the session was started with.
    pub fn request_url(&self) -> &Url {
        &self.request_url
    }

    pub fn redirect_urls(&self) -> &[Url] {
        &self.redirect_urls
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn is_from_cache(&self) -> bool {
        self.is_from_cache
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }
}

/// A fully buffered response.
#[derive(Clone)]
pub struct Response {
    head: ResponseHead,
    raw_body: Bytes,
    body: Bytes,
    options: Arc<NormalizedOptions>,
}

impl Response {
    pub(crate) fn new(
        head: ResponseHead,
        raw_body: Bytes,
        body: Bytes,
        options: Arc<NormalizedOptions>,
    ) -> Self {
        Self {
            head,
            raw_body,
            body,
            options,
        }
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.head.headers
    }

    pub fn url(&self) -> &Url {
        &self.head.url
    }

    pub fn request_url(&self) -> &Url {
        &self.head.request_url
    }

    pub fn redirect_urls(&self) -> &[Url] {
        &self.head.redirect_urls
    }

    pub fn retry_count(&self) -> u32 {
        self.head.retry_count
    }

    pub fn is_from_cache(&self) -> bool {
        self.head.is_from_cache
    }

    pub fn timings(&self) -> &Timings {
        &self.head.timings
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.head.remote_addr
    }

    pub fn options(&self) -> &NormalizedOptions {
        &self.options
    }

    /// Decoded body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body bytes as received, before content decoding.
    pub fn raw_body(&self) -> &Bytes {
        &self.raw_body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Body rendered with the session's configured encoding.
    pub fn text(&self) -> String {
        self.options.encoding().decode(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.body).map_err(|source| {
            Error::new(ErrorKind::Parse {
                response_type: ResponseType::Json.as_str(),
                source: Box::new(source),
            })
        })
    }

    /// 2xx, or 304, or any 3xx when redirects are not being followed.
    pub fn is_ok(&self) -> bool {
        is_response_ok(self.head.status, self.options.redirect().follow())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Response")
            .field("status", &self.head.status)
            .field("url", &self.head.url.as_str())
            .field("retry_count", &self.head.retry_count)
            .field("is_from_cache", &self.head.is_from_cache)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

pub(crate) fn is_response_ok(status: StatusCode, follow_redirect: bool) -> bool {
    let limit = if follow_redirect { 299 } else { 399 };
    (200..=limit).contains(&status.as_u16()) || status == StatusCode::NOT_MODIFIED
}

/// Synthetic response returned by an `init` or `beforeRequest` hook.
#[derive(Clone, Debug)]
pub struct ResponseLike {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ResponseLike {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}
