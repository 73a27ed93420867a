use std::io;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

/// Why an exchange ended without the application's own response.
///
/// Each variant maps to the status sent to the peer when a response can still
/// be written.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed request: {source}")]
    Parse {
        #[from]
        source: ParseError,
    },

    #[error("failed to send response: {source}")]
    Send {
        #[from]
        source: SendError,
    },

    #[error("handler failed: {reason}")]
    Application { reason: String },

    #[error("no response within {elapsed:?}")]
    TimedOut { elapsed: Duration },
}

impl HttpError {
    pub fn application<S: ToString>(reason: S) -> Self {
        Self::Application { reason: reason.to_string() }
    }

    pub fn timed_out(elapsed: Duration) -> Self {
        Self::TimedOut { elapsed }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Parse { source } => source.status_code(),
            Self::Send { .. } | Self::Application { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

/// Terminal decode failures. Every variant closes the connection.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("request head is {current_size} bytes, limit is {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("more than {max_num} header fields")]
    TooManyHeaders { max_num: usize },

    #[error("malformed head: {reason}")]
    InvalidHeader { reason: String },

    #[error("unknown http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("method `{method}` is not served")]
    UnsupportedMethod { method: String },

    #[error("malformed request target")]
    InvalidUri,

    #[error("bad content-length: {reason}")]
    InvalidContentLength { reason: String },

    #[error("body of {length} bytes exceeds the limit of {max_size}")]
    PayloadTooLarge { length: u64, max_size: u64 },

    #[error("connection closed after {received} of {expected} body bytes")]
    UnexpectedEof { expected: u64, received: u64 },

    #[error("malformed body: {reason}")]
    InvalidBody { reason: String },

    #[error("body storage failed: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(reason: S) -> Self {
        Self::InvalidHeader { reason: reason.to_string() }
    }

    pub fn unsupported_method<S: ToString>(method: S) -> Self {
        Self::UnsupportedMethod { method: method.to_string() }
    }

    pub fn invalid_body<S: ToString>(reason: S) -> Self {
        Self::InvalidBody { reason: reason.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(reason: S) -> Self {
        Self::InvalidContentLength { reason: reason.to_string() }
    }

    pub fn payload_too_large(length: u64, max_size: u64) -> Self {
        Self::PayloadTooLarge { length, max_size }
    }

    pub fn unexpected_eof(expected: u64, received: u64) -> Self {
        Self::UnexpectedEof { expected, received }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// The status code of the response synthesized for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Failures of writing a response.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("a response was already sent for this request")]
    Committed,

    #[error("connection is closed")]
    Closed,

    #[error("header value rejected: {reason}")]
    InvalidHeader { reason: String },

    #[error("cannot encode {what}")]
    Unsupported { what: &'static str },

    #[error("write failed: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_header<S: ToString>(reason: S) -> Self {
        Self::InvalidHeader { reason: reason.to_string() }
    }

    pub fn unsupported(what: &'static str) -> Self {
        Self::Unsupported { what }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Failures of the request accessors.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("parameter `{key}` has malformed value `{value}`: {reason}")]
    InvalidParam { key: String, value: String, reason: String },

    #[error("request body recording is disabled, enable `record_request_body` to read the raw request")]
    BodyNotRecorded,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl RequestError {
    pub fn invalid_param<S: ToString>(key: &str, value: &str, reason: S) -> Self {
        Self::InvalidParam { key: key.to_string(), value: value.to_string(), reason: reason.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_map_to_status() {
        assert_eq!(ParseError::unsupported_method("BREW").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ParseError::unexpected_eof(10, 5).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ParseError::payload_too_large(11, 10).status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(ParseError::too_many_headers(64).status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn http_errors_map_to_status() {
        assert_eq!(HttpError::from(ParseError::payload_too_large(2, 1)).status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(HttpError::application("boom").status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(HttpError::timed_out(Duration::from_secs(3)).status_code(), StatusCode::GATEWAY_TIMEOUT);
    }
}
