//! Decoder for the request line and header section.
//!
//! The head is parsed with `httparse`, then converted to an owned
//! [`RequestHeader`] sharing the raw head bytes. The raw bytes are kept so the
//! request model can expose the complete request when body recording is on.
//!
//! # Limits
//!
//! - Maximum number of headers: 64
//! - Maximum header size: 8KB
//! - Only HTTP/1.0 and HTTP/1.1
//! - Only the methods in [`SUPPORTED_METHODS`]

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHeader};

/// Maximum number of headers allowed in a request
pub const MAX_HEADER_NUM: usize = 64;

/// Maximum size in bytes allowed for the entire header section
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// The request methods the server accepts, anything else is a protocol error.
pub const SUPPORTED_METHODS: [Method; 9] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
    Method::PATCH,
    Method::TRACE,
    Method::CONNECT,
];

/// A fully parsed request head.
#[derive(Debug)]
pub struct DecodedHead {
    pub header: RequestHeader,
    pub payload_size: PayloadSize,
    /// The head exactly as received, request line through the blank line.
    pub raw: Bytes,
}

/// Decoder for HTTP request heads implementing the [`Decoder`] trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderDecoder;

impl Decoder for HeaderDecoder {
    type Item = DecodedHead;
    type Error = ParseError;

    /// Returns `Ok(None)` until the blank line ending the head is buffered.
    ///
    /// On success the head bytes are split off `src`, leaving any body bytes.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut req = httparse::Request::new(&mut headers);

        let parsed_result = req.parse(src).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            Error::Version => ParseError::InvalidVersion(None),
            e => ParseError::invalid_header(e.to_string()),
        });

        match parsed_result? {
            Status::Complete(body_offset) => {
                trace!(head_size = body_offset, "parsed request head");
                ensure!(body_offset <= MAX_HEADER_BYTES, ParseError::too_large_header(body_offset, MAX_HEADER_BYTES));

                let method_str = req.method.ok_or_else(|| ParseError::unsupported_method(""))?;
                let method = SUPPORTED_METHODS
                    .iter()
                    .find(|m| m.as_str() == method_str)
                    .cloned()
                    .ok_or_else(|| ParseError::unsupported_method(method_str))?;

                let version = match req.version {
                    Some(0) => http::Version::HTTP_10,
                    Some(1) => http::Version::HTTP_11,
                    v => return Err(ParseError::InvalidVersion(v)),
                };

                let path = req.path.ok_or(ParseError::InvalidUri)?;
                let uri = Uri::try_from(path).map_err(|_| ParseError::InvalidUri)?;

                let header_count = req.headers.len();
                let mut header_index: [HeaderIndex; MAX_HEADER_NUM] = EMPTY_HEADER_INDEX_ARRAY;
                HeaderIndex::record(src, req.headers, &mut header_index);

                let raw = src.split_to(body_offset).freeze();

                let mut header_map = HeaderMap::with_capacity(header_count);
                for index in &header_index[..header_count] {
                    let name = HeaderName::from_bytes(&raw[index.name.0..index.name.1])
                        .map_err(|e| ParseError::invalid_header(e.to_string()))?;
                    let value = HeaderValue::from_maybe_shared(raw.slice(index.value.0..index.value.1))
                        .map_err(|e| ParseError::invalid_header(e.to_string()))?;
                    header_map.append(name, value);
                }

                let mut request = Request::builder()
                    .method(method)
                    .uri(uri)
                    .version(version)
                    .body(())
                    .map_err(|e| ParseError::invalid_header(e.to_string()))?;
                *request.headers_mut() = header_map;

                let header = RequestHeader::from(request);
                let payload_size = parse_payload(&header)?;

                Ok(Some(DecodedHead { header, payload_size, raw }))
            }
            Status::Partial => {
                ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                Ok(None)
            }
        }
    }
}

/// Byte ranges of a header's name and value within the head buffer.
#[derive(Clone, Copy)]
struct HeaderIndex {
    name: (usize, usize),
    value: (usize, usize),
}

const EMPTY_HEADER_INDEX: HeaderIndex = HeaderIndex { name: (0, 0), value: (0, 0) };

const EMPTY_HEADER_INDEX_ARRAY: [HeaderIndex; MAX_HEADER_NUM] = [EMPTY_HEADER_INDEX; MAX_HEADER_NUM];

impl HeaderIndex {
    fn record(bytes: &[u8], headers: &[httparse::Header<'_>], indices: &mut [HeaderIndex]) {
        let bytes_ptr = bytes.as_ptr() as usize;
        for (header, indices) in headers.iter().zip(indices.iter_mut()) {
            let name_start = header.name.as_ptr() as usize - bytes_ptr;
            let name_end = name_start + header.name.len();
            indices.name = (name_start, name_end);
            let value_start = header.value.as_ptr() as usize - bytes_ptr;
            let value_end = value_start + header.value.len();
            indices.value = (value_start, value_end);
        }
    }
}

/// Determines the body framing from Content-Length and Transfer-Encoding,
/// whatever the method.
///
/// Framing that two parties could read differently is refused: both headers
/// together, differing lengths, or a transfer coding other than chunked.
///
/// refer: <https://www.rfc-editor.org/rfc/rfc9112.html#name-message-body-length>
fn parse_payload(header: &RequestHeader) -> Result<PayloadSize, ParseError> {
    let headers = header.headers();
    let transfer_encoding = headers.get_all(http::header::TRANSFER_ENCODING).iter().last();
    let content_length = content_length(headers)?;

    match (transfer_encoding, content_length) {
        (None, None) => Ok(PayloadSize::Empty),
        (None, Some(length)) => Ok(PayloadSize::Length(length)),
        (Some(_), Some(_)) => {
            Err(ParseError::invalid_content_length("transfer-encoding and content-length both present"))
        }
        (te_value @ Some(_), None) => {
            ensure!(is_chunked(te_value), ParseError::invalid_header("unsupported transfer-encoding"));
            Ok(PayloadSize::Chunked)
        }
    }
}

/// The length declared by every `Content-Length` field, which must all agree.
fn content_length(headers: &HeaderMap) -> Result<Option<u64>, ParseError> {
    let mut declared = None;
    for value in headers.get_all(http::header::CONTENT_LENGTH) {
        let value = value.to_str().map_err(|_| ParseError::invalid_content_length("value is not visible ascii"))?;
        for item in value.split(',').map(str::trim) {
            ensure!(
                !item.is_empty() && item.bytes().all(|b| b.is_ascii_digit()),
                ParseError::invalid_content_length(format!("`{item}` is not a decimal length"))
            );
            let length = item
                .parse::<u64>()
                .map_err(|_| ParseError::invalid_content_length(format!("`{item}` is out of range")))?;
            match declared {
                Some(previous) if previous != length => {
                    return Err(ParseError::invalid_content_length(format!(
                        "conflicting lengths {previous} and {length}"
                    )));
                }
                _ => declared = Some(length),
            }
        }
    }
    Ok(declared)
}

/// Chunked must be the last coding when present.
fn is_chunked(header_value: Option<&HeaderValue>) -> bool {
    const CHUNKED: &[u8] = b"chunked";
    if let Some(value) = header_value
        && let Some(bytes) = value.as_bytes().rsplit(|b| *b == b',').next()
    {
        return bytes.trim_ascii().eq_ignore_ascii_case(CHUNKED);
    }
    false
}
