//! Incremental request decoding.
//!
//! [`RequestCodec`] is the framing state machine, a `tokio_util` [`Decoder`]
//! that turns a byte buffer into a [`DecodedRequest`]: head first, then the
//! body declared by `Content-Length`, spilled to disk past the configured
//! threshold. [`RequestDecoder`] wraps it with the buffer of one connection and
//! the one-shot contract the multiplexer relies on: [`RequestDecoder::decode`]
//! reports completion exactly once, and bytes past the request are handed back
//! through [`RequestDecoder::take_remaining`] for the next decoder.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use micro_poll::codec::{DecoderConfig, RequestDecoder};
//!
//! let mut decoder = RequestDecoder::new(Arc::new(DecoderConfig::default()));
//! assert!(!decoder.decode(b"GET /index?page=2 HTTP/1.1\r\n").unwrap());
//! assert!(decoder.decode(b"Host: localhost\r\n\r\n").unwrap());
//!
//! let request = decoder.take_request().unwrap();
//! assert_eq!(request.header.uri().path(), "/index");
//! assert_eq!(request.header.uri().query(), Some("page=2"));
//! ```
//!
//! Form and multipart parameters are not parsed here: the network thread only
//! frames the body, parsing happens on the worker through
//! [`HttpRequest`](crate::protocol::HttpRequest).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::body::{LengthDecoder, SpillBuffer};
use crate::codec::header::{DecodedHead, HeaderDecoder};
use crate::ensure;
use crate::protocol::{ParseError, PayloadItem, PayloadSize, RequestBody, RequestHeader, TempFiles};

const DEFAULT_MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_SPILL_THRESHOLD: usize = 1024 * 1024;

/// Limits and storage used while decoding request bodies.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Largest accepted `Content-Length`, larger declarations fail with 413.
    pub max_body_size: u64,
    /// Body bytes kept in memory before spilling to a temp file.
    pub spill_threshold: usize,
    /// Directory for spilled bodies and uploads, the system temp dir when `None`.
    pub temp_dir: Option<PathBuf>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self { max_body_size: DEFAULT_MAX_BODY_SIZE, spill_threshold: DEFAULT_SPILL_THRESHOLD, temp_dir: None }
    }
}

/// Everything decoded from one request.
#[derive(Debug)]
pub struct DecodedRequest {
    pub header: RequestHeader,
    /// The head bytes exactly as received.
    pub raw_head: Bytes,
    pub body: RequestBody,
    /// Owner of the spilled body file.
    pub temp_files: TempFiles,
}

#[derive(Debug)]
struct BodyState {
    head: DecodedHead,
    length_decoder: LengthDecoder,
    buffer: SpillBuffer,
}

/// Framing state machine for one request at a time.
#[derive(Debug)]
pub struct RequestCodec {
    config: Arc<DecoderConfig>,
    body: Option<BodyState>,
}

impl RequestCodec {
    pub fn new(config: Arc<DecoderConfig>) -> Self {
        Self { config, body: None }
    }

    /// Whether the head was decoded and the body is still arriving.
    pub fn in_body(&self) -> bool {
        self.body.is_some()
    }

    fn start_body(&mut self, head: DecodedHead) -> Result<Option<DecodedRequest>, ParseError> {
        match head.payload_size {
            PayloadSize::Chunked => Err(ParseError::invalid_body("chunked request bodies are not supported")),
            PayloadSize::Length(length) if length > self.config.max_body_size => {
                Err(ParseError::payload_too_large(length, self.config.max_body_size))
            }
            PayloadSize::Length(length) if length > 0 => {
                trace!(length, "waiting for request body");
                let buffer = SpillBuffer::new(self.config.spill_threshold, self.config.temp_dir.clone(), length);
                self.body = Some(BodyState { head, length_decoder: LengthDecoder::new(length), buffer });
                Ok(None)
            }
            _ => {
                let buffer = SpillBuffer::new(self.config.spill_threshold, None, 0);
                self.finish(head, buffer).map(Some)
            }
        }
    }

    fn finish(&self, head: DecodedHead, buffer: SpillBuffer) -> Result<DecodedRequest, ParseError> {
        let DecodedHead { header, raw, .. } = head;
        let (body, body_path) = buffer.finish().map_err(ParseError::io)?;

        let mut temp_files = TempFiles::default();
        if let Some(path) = body_path {
            temp_files.push(path);
        }

        Ok(DecodedRequest { header, raw_head: raw, body, temp_files })
    }
}

impl Decoder for RequestCodec {
    type Item = DecodedRequest;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.body.is_none() {
            let Some(head) = HeaderDecoder.decode(src)? else {
                return Ok(None);
            };
            if let Some(request) = self.start_body(head)? {
                return Ok(Some(request));
            }
        }

        let Some(state) = self.body.as_mut() else {
            return Ok(None);
        };

        while let Some(item) = state.length_decoder.decode(src)? {
            match item {
                PayloadItem::Chunk(bytes) => {
                    ensure!(
                        state.buffer.len() + bytes.len() as u64 <= self.config.max_body_size,
                        ParseError::payload_too_large(state.buffer.len() + bytes.len() as u64, self.config.max_body_size)
                    );
                    state.buffer.push(&bytes).map_err(ParseError::io)?;
                }
                PayloadItem::Eof => {
                    let Some(BodyState { head, buffer, .. }) = self.body.take() else {
                        return Ok(None);
                    };
                    return self.finish(head, buffer).map(Some);
                }
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(request) = self.decode(src)? {
            return Ok(Some(request));
        }
        match &self.body {
            Some(state) => {
                let expected = state.buffer.len() + state.length_decoder.remaining();
                Err(ParseError::unexpected_eof(expected, state.buffer.len()))
            }
            None if src.is_empty() => Ok(None),
            None => Err(ParseError::invalid_header("stream ended inside the request head")),
        }
    }
}

/// The decoder of one connection.
#[derive(Debug)]
pub struct RequestDecoder {
    codec: RequestCodec,
    buf: BytesMut,
    completed: Option<DecodedRequest>,
    started: Option<Instant>,
    done: bool,
    failed: bool,
}

impl RequestDecoder {
    pub fn new(config: Arc<DecoderConfig>) -> Self {
        Self {
            codec: RequestCodec::new(config),
            buf: BytesMut::new(),
            completed: None,
            started: None,
            done: false,
            failed: false,
        }
    }

    /// Appends `bytes` and advances decoding.
    ///
    /// Returns `Ok(true)` exactly once, when the head and the declared body are
    /// complete; `Ok(false)` while more bytes are needed. Bytes fed after
    /// completion are kept for [`take_remaining`](Self::take_remaining). An
    /// error is terminal: the decoder rejects everything afterwards.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<bool, ParseError> {
        ensure!(!self.failed, ParseError::invalid_body("decoder already failed"));
        self.buf.extend_from_slice(bytes);
        if self.done {
            return Ok(false);
        }
        if self.started.is_none() && !self.buf.is_empty() {
            self.started = Some(Instant::now());
        }

        match self.codec.decode(&mut self.buf) {
            Ok(Some(request)) => {
                self.completed = Some(request);
                self.done = true;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    /// Signals that the peer closed its side of the connection.
    ///
    /// Succeeds when no request is partially decoded, otherwise fails with the
    /// truncation error.
    pub fn decode_eof(&mut self) -> Result<(), ParseError> {
        if self.done || self.failed {
            return Ok(());
        }
        match self.codec.decode_eof(&mut self.buf) {
            Ok(Some(request)) => {
                self.completed = Some(request);
                self.done = true;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.done
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Whether some bytes of an unfinished request were received.
    pub fn has_partial(&self) -> bool {
        !self.done && (self.codec.in_body() || !self.buf.is_empty())
    }

    /// When the first byte of the unfinished request arrived.
    pub fn started(&self) -> Option<Instant> {
        self.started
    }

    /// The decoded request, once.
    pub fn take_request(&mut self) -> Option<DecodedRequest> {
        self.completed.take()
    }

    /// Bytes received past the completed request.
    pub fn take_remaining(&mut self) -> BytesMut {
        self.buf.split()
    }

    fn fail(&mut self) {
        self.failed = true;
        self.buf.clear();
        // drops any spilled body, removing its file
        self.codec.body = None;
    }
}
