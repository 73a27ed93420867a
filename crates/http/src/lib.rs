//! A readiness-driven HTTP/1.x server core.
//!
//! One network thread multiplexes every connection over a single `mio` poll:
//! it accepts, reads whatever is available, and feeds the bytes to the
//! connection's incremental decoder. Completed requests run on a worker pool,
//! where request listeners and an interceptor chain produce the response.
//! Responses are written in request order, so pipelined requests are answered
//! correctly.
//!
//! # Features
//!
//! - HTTP/1.0 and HTTP/1.1 with keep-alive and pipelining
//! - Request bodies spilled to temp files past a threshold
//! - `application/x-www-form-urlencoded` and `multipart/form-data` parameters
//! - Cookies and sessions backed by a pluggable [`protocol::SessionStore`]
//! - Per-request timeouts answered with 504
//! - Decode failures answered with 400 or 413 before the connection closes
//!
//! # Example
//!
//! ```no_run
//! use http::StatusCode;
//! use micro_poll::handler::{BoxError, Interceptors};
//! use micro_poll::protocol::{HttpRequest, HttpResponse};
//! use micro_poll::server::Server;
//!
//! fn hello(request: &HttpRequest, response: &HttpResponse) -> Result<bool, BoxError> {
//!     let name = request.param("name").unwrap_or("world");
//!     response.render_text(StatusCode::OK, format!("hello {name}\r\n"))?;
//!     Ok(false)
//! }
//!
//! let interceptors = Interceptors::builder().add_last(hello).build();
//! let server = Server::builder().address("127.0.0.1", 8080).interceptors(interceptors).build();
//! server.start().expect("start server").join();
//! ```
//!
//! # Architecture
//!
//! - [`codec`]: the incremental request decoder and the response encoder
//! - [`protocol`]: the request and response model
//! - [`connection`]: channels with ordered writes, and the connection registry
//! - [`handler`]: listeners, interceptors and the per-request lifecycle
//! - [`server`]: configuration, the network loop, sweepers and startup
//!
//! # Limitations
//!
//! - No HTTP/2, HTTP/3 or TLS
//! - Chunked request bodies are rejected
//! - At most 64 request headers and 8KB of request head

pub mod codec;
pub mod connection;
pub mod handler;
pub mod protocol;
pub mod server;

mod utils;
pub(crate) use utils::ensure;
