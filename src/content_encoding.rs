use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{Method, StatusCode};

use crate::util::lock_unpoisoned;

#[derive(Debug, thiserror::Error)]
#[error("failed to decode content-encoding {encoding}: {message}")]
pub struct DecodeContentEncodingError {
    pub encoding: String,
    pub message: String,
}

impl DecodeContentEncodingError {
    fn new(encoding: &str, error: impl ToString) -> Self {
        Self {
            encoding: encoding.to_owned(),
            message: error.to_string(),
        }
    }
}

pub(crate) fn should_decode_content_encoded_body(method: &Method, status: StatusCode) -> bool {
    if *method == Method::HEAD {
        return false;
    }
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Splits a `Content-Encoding` value into codings in the order they must be undone.
fn decoding_order(content_encoding: &str) -> Vec<String> {
    let mut codings = content_encoding
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>();
    codings.reverse();
    codings
}

fn read_all<R: Read>(reader: &mut R, encoding: &str) -> Result<Vec<u8>, DecodeContentEncodingError> {
    let mut decoded = Vec::new();
    reader
        .read_to_end(&mut decoded)
        .map_err(|error| DecodeContentEncodingError::new(encoding, error))?;
    Ok(decoded)
}

pub(crate) fn decode_content_encoded_body(
    mut body: Bytes,
    content_encoding: &str,
) -> Result<Bytes, DecodeContentEncodingError> {
    if body.is_empty() {
        return Ok(body);
    }
    for encoding in decoding_order(content_encoding) {
        let decoded = match encoding.as_str() {
            "identity" => continue,
            "gzip" | "x-gzip" => {
                read_all(&mut flate2::read::GzDecoder::new(body.as_ref()), &encoding)?
            }
            "deflate" => read_all(&mut flate2::read::ZlibDecoder::new(body.as_ref()), &encoding)?,
            "br" => read_all(&mut brotli::Decompressor::new(body.as_ref(), 4096), &encoding)?,
            "zstd" => {
                let mut decoder = zstd::stream::read::Decoder::new(body.as_ref())
                    .map_err(|error| DecodeContentEncodingError::new(&encoding, error))?;
                read_all(&mut decoder, &encoding)?
            }
            other => {
                return Err(DecodeContentEncodingError::new(
                    other,
                    "unsupported content-encoding",
                ));
            }
        };
        body = Bytes::from(decoded);
    }
    Ok(body)
}

/// Output buffer shared between a write-side decoder and its owner.
#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *lock_unpoisoned(&self.0))
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock_unpoisoned(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Stage {
    Gzip(flate2::write::GzDecoder<SharedSink>),
    Deflate(flate2::write::ZlibDecoder<SharedSink>),
    Brotli(Box<brotli::DecompressorWriter<SharedSink>>),
    Zstd(zstd::stream::write::Decoder<'static, SharedSink>),
}

struct StageDecoder {
    encoding: String,
    stage: Stage,
    sink: SharedSink,
}

impl StageDecoder {
    fn new(encoding: &str) -> Result<Option<Self>, DecodeContentEncodingError> {
        let sink = SharedSink::default();
        let stage = match encoding {
            "identity" => return Ok(None),
            "gzip" | "x-gzip" => Stage::Gzip(flate2::write::GzDecoder::new(sink.clone())),
            "deflate" => Stage::Deflate(flate2::write::ZlibDecoder::new(sink.clone())),
            "br" => Stage::Brotli(Box::new(brotli::DecompressorWriter::new(sink.clone(), 4096))),
            "zstd" => Stage::Zstd(
                zstd::stream::write::Decoder::new(sink.clone())
                    .map_err(|error| DecodeContentEncodingError::new(encoding, error))?,
            ),
            other => {
                return Err(DecodeContentEncodingError::new(
                    other,
                    "unsupported content-encoding",
                ));
            }
        };
        Ok(Some(Self {
            encoding: encoding.to_owned(),
            stage,
            sink,
        }))
    }

    fn push(&mut self, input: &[u8]) -> Result<Vec<u8>, DecodeContentEncodingError> {
        let result = match &mut self.stage {
            Stage::Gzip(decoder) => decoder.write_all(input),
            Stage::Deflate(decoder) => decoder.write_all(input),
            Stage::Brotli(decoder) => decoder.write_all(input),
            Stage::Zstd(decoder) => decoder.write_all(input),
        };
        result.map_err(|error| DecodeContentEncodingError::new(&self.encoding, error))?;
        Ok(self.sink.drain())
    }

    fn finish(&mut self) -> Result<Vec<u8>, DecodeContentEncodingError> {
        let result = match &mut self.stage {
            Stage::Gzip(decoder) => decoder.try_finish(),
            Stage::Deflate(decoder) => decoder.try_finish(),
            Stage::Brotli(decoder) => decoder.flush(),
            Stage::Zstd(decoder) => decoder.flush(),
        };
        result.map_err(|error| DecodeContentEncodingError::new(&self.encoding, error))?;
        Ok(self.sink.drain())
    }
}

/// Chunk-at-a-time decoder used by stream-style sessions.
pub struct IncrementalDecoder {
    stages: Vec<StageDecoder>,
}

impl IncrementalDecoder {
    pub fn new(content_encoding: &str) -> Result<Self, DecodeContentEncodingError> {
        let mut stages = Vec::new();
        for encoding in decoding_order(content_encoding) {
            if let Some(stage) = StageDecoder::new(&encoding)? {
                stages.push(stage);
            }
        }
        Ok(Self { stages })
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Bytes, DecodeContentEncodingError> {
        let mut data = chunk.to_vec();
        for stage in &mut self.stages {
            data = stage.push(&data)?;
        }
        Ok(Bytes::from(data))
    }

    pub fn finish(&mut self) -> Result<Bytes, DecodeContentEncodingError> {
        let mut pending = Vec::new();
        for stage in &mut self.stages {
            let mut data = stage.push(&pending)?;
            data.extend(stage.finish()?);
            pending = data;
        }
        Ok(Bytes::from(pending))
    }
}
