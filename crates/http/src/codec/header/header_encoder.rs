//! Serializes a response head: status line, header fields, blank line.
//!
//! `Content-Length` is always written from the [`PayloadSize`], overriding any
//! value set by the application.

use bytes::{BufMut, BytesMut};
use http::{HeaderValue, Version, header};
use tokio_util::codec::Encoder;
use tracing::error;

use crate::protocol::{PayloadSize, ResponseHead, SendError};

/// Room reserved for a typical head before writing.
const HEAD_RESERVE: usize = 512;

/// Encoder for response heads implementing the [`Encoder`] trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderEncoder;

impl Encoder<(ResponseHead, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (ResponseHead, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut head, payload_size) = item;
        if head.version() != Version::HTTP_11 {
            error!(http_version = ?head.version(), "unsupported response version");
            return Err(SendError::unsupported("response version other than HTTP/1.1"));
        }

        let length = match payload_size {
            PayloadSize::Length(n) => HeaderValue::from(n),
            PayloadSize::Empty => HeaderValue::from_static("0"),
            PayloadSize::Chunked => return Err(SendError::unsupported("chunked response body")),
        };
        let headers = head.headers_mut();
        headers.remove(header::TRANSFER_ENCODING);
        headers.insert(header::CONTENT_LENGTH, length);

        let status = head.status();
        dst.reserve(HEAD_RESERVE);
        dst.put_slice(b"HTTP/1.1 ");
        dst.put_slice(status.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
        dst.put_slice(b"\r\n");

        for (name, value) in head.headers() {
            dst.put_slice(name.as_str().as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
