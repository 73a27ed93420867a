//! Wire format of requests and responses.
//!
//! - Request side: [`RequestDecoder`] turns the bytes of one connection into
//!   [`DecodedRequest`]s, built from [`RequestCodec`], the head decoder and the
//!   body decoders.
//! - Response side: [`ResponseEncoder`] serializes a response head and its body.
//!
//! All of them implement the `tokio_util::codec` traits, so they can also be
//! used with framed streams.

mod body;
mod header;
mod request_decoder;
mod response_encoder;

pub use body::{LengthDecoder, MultipartParts, SpillBuffer, parse_boundary, read_multipart};
pub use header::{DecodedHead, HeaderDecoder, HeaderEncoder, MAX_HEADER_BYTES, MAX_HEADER_NUM, SUPPORTED_METHODS};
pub use request_decoder::{DecodedRequest, DecoderConfig, RequestCodec, RequestDecoder};
pub use response_encoder::ResponseEncoder;
