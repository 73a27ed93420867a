//! Request body handling: length framing, spill-to-disk buffering and
//! `multipart/form-data` splitting.

mod length_decoder;
mod multipart;
mod spill_buffer;

pub use length_decoder::LengthDecoder;
pub use multipart::{MultipartParts, parse_boundary, read_multipart};
pub use spill_buffer::SpillBuffer;
