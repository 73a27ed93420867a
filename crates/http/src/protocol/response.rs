//! Response head type.
//!
//! A response head is an `http::Response<()>`, the body travels next to it
//! through the encoder.

use http::Response;

/// The status line and header fields of a response.
pub type ResponseHead = Response<()>;
