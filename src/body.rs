use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use http::HeaderValue;

use crate::content_encoding::{IncrementalDecoder, decode_content_encoded_body};
use crate::error::BoxError;
use crate::util::lock_unpoisoned;

pub type BodyStream = BoxStream<'static, Result<Bytes, BoxError>>;

/// A streaming request body that can be consumed exactly once.
///
/// Clones share the same underlying stream, so a session that copies its
/// options for a redirect or retry sees the stream as already consumed.
#[derive(Clone)]
pub struct OneShotStream {
    slot: Arc<Mutex<Option<BodyStream>>>,
}

impl OneShotStream {
    pub(crate) fn take(&self) -> Option<BodyStream> {
        lock_unpoisoned(&self.slot).take()
    }

    pub fn is_consumed(&self) -> bool {
        lock_unpoisoned(&self.slot).is_none()
    }
}

impl fmt::Debug for OneShotStream {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("OneShotStream")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum Body {
    Bytes(Bytes),
    Stream(OneShotStream),
}

impl Body {
    pub fn from_stream<S, E>(body: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let body = body.map(|item| item.map_err(Into::into)).boxed();
        Self::Stream(OneShotStream {
            slot: Arc::new(Mutex::new(Some(body))),
        })
    }

    pub fn is_replayable(&self) -> bool {
        matches!(self, Self::Bytes(_))
    }

    pub fn len(&self) -> Option<u64> {
        match self {
            Self::Bytes(bytes) => Some(bytes.len() as u64),
            Self::Stream(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Produces the bytes to send for one attempt, or `None` when a stream was
    /// already consumed by an earlier attempt.
    pub(crate) fn open(&self) -> Option<BodyStream> {
        match self {
            Self::Bytes(bytes) if bytes.is_empty() => Some(stream::empty().boxed()),
            Self::Bytes(bytes) => Some(stream::once(std::future::ready(Ok(bytes.clone()))).boxed()),
            Self::Stream(stream) => stream.take(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Self::Bytes(Bytes::from(text))
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

#[derive(Clone, Debug)]
pub struct EncodedBody {
    pub bytes: Bytes,
    pub content_type: HeaderValue,
}

/// Incremental response decoder handed out by a [`BodyCodec`].
pub trait ContentDecoder: Send {
    fn push(&mut self, chunk: &[u8]) -> Result<Bytes, BoxError>;
    fn finish(&mut self) -> Result<Bytes, BoxError>;
}

impl ContentDecoder for IncrementalDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<Bytes, BoxError> {
        IncrementalDecoder::push(self, chunk).map_err(Into::into)
    }

    fn finish(&mut self) -> Result<Bytes, BoxError> {
        IncrementalDecoder::finish(self).map_err(Into::into)
    }
}

/// Body encoding for `json`/`form` options and response decompression.
pub trait BodyCodec: Send + Sync {
    fn encode_json(&self, value: &serde_json::Value) -> Result<EncodedBody, BoxError>;

    fn encode_form(&self, pairs: &[(String, String)]) -> Result<EncodedBody, BoxError>;

    fn decode(&self, content_encoding: &str, body: Bytes) -> Result<Bytes, BoxError>;

    fn decoder(&self, content_encoding: &str) -> Result<Box<dyn ContentDecoder>, BoxError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StandardBodyCodec;

impl BodyCodec for StandardBodyCodec {
    fn encode_json(&self, value: &serde_json::Value) -> Result<EncodedBody, BoxError> {
        Ok(EncodedBody {
            bytes: Bytes::from(serde_json::to_vec(value)?),
            content_type: HeaderValue::from_static("application/json"),
        })
    }

    fn encode_form(&self, pairs: &[(String, String)]) -> Result<EncodedBody, BoxError> {
        Ok(EncodedBody {
            bytes: Bytes::from(serde_urlencoded::to_string(pairs)?),
            content_type: HeaderValue::from_static("application/x-www-form-urlencoded"),
        })
    }

    fn decode(&self, content_encoding: &str, body: Bytes) -> Result<Bytes, BoxError> {
        decode_content_encoded_body(body, content_encoding).map_err(Into::into)
    }

    fn decoder(&self, content_encoding: &str) -> Result<Box<dyn ContentDecoder>, BoxError> {
        Ok(Box::new(IncrementalDecoder::new(content_encoding)?))
    }
}
