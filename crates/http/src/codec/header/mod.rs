//! Request head decoding and response head encoding.

mod header_decoder;
mod header_encoder;

pub use header_decoder::DecodedHead;
pub use header_decoder::HeaderDecoder;
pub use header_decoder::{MAX_HEADER_BYTES, MAX_HEADER_NUM, SUPPORTED_METHODS};
pub use header_encoder::HeaderEncoder;
