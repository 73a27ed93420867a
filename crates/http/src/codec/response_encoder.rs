use bytes::{Bytes, BytesMut};
use tokio_util::codec::Encoder;

use crate::codec::header::HeaderEncoder;
use crate::protocol::{PayloadSize, ResponseHead, SendError};

/// Encodes a complete response, head and body, into one buffer.
///
/// Responses to HEAD requests keep the `Content-Length` of the body they would
/// have carried but omit the body bytes.
#[derive(Debug, Default)]
pub struct ResponseEncoder {
    header_encoder: HeaderEncoder,
    head_only: bool,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head_only() -> Self {
        Self { header_encoder: HeaderEncoder, head_only: true }
    }
}

impl Encoder<(ResponseHead, Bytes)> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (ResponseHead, Bytes), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (head, body) = item;
        let payload_size = if body.is_empty() { PayloadSize::Empty } else { PayloadSize::Length(body.len() as u64) };

        dst.reserve(body.len());
        self.header_encoder.encode((head, payload_size), dst)?;
        if !self.head_only {
            dst.extend_from_slice(&body);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Response, StatusCode};

    fn head() -> ResponseHead {
        Response::builder().status(StatusCode::OK).header("content-type", "text/plain").body(()).unwrap()
    }

    #[test]
    fn encodes_head_and_body() {
        let mut dst = BytesMut::new();
        ResponseEncoder::new().encode((head(), Bytes::from_static(b"hello")), &mut dst).unwrap();

        assert_eq!(&dst[..], b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 5\r\n\r\nhello");
    }

    #[test]
    fn head_only_omits_body() {
        let mut dst = BytesMut::new();
        ResponseEncoder::head_only().encode((head(), Bytes::from_static(b"hello")), &mut dst).unwrap();

        assert_eq!(&dst[..], b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 5\r\n\r\n");
    }
}
