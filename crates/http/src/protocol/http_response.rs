//! The response side of one exchange.
//!
//! An [`HttpResponse`] is write-once: the first successful `write` commits it
//! and every later attempt fails with [`SendError::Committed`]. The whole
//! message is encoded up front and written to the connection in the order its
//! request was received.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{self, HeaderName};
use http::{HeaderMap, HeaderValue, Method, Response, StatusCode, Version};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::codec::Encoder;
use tracing::{debug, trace};

use crate::codec::ResponseEncoder;
use crate::connection::Channel;
use crate::protocol::{HttpRequest, SendError};
use crate::server::ResponseConfig;

/// The response bound to one [`HttpRequest`].
pub struct HttpResponse {
    request: Arc<HttpRequest>,
    channel: Arc<Channel>,
    sequence: u64,
    headers: Mutex<HeaderMap>,
    status: Mutex<StatusCode>,
    committed: AtomicBool,
    config: Arc<ResponseConfig>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    status: u16,
    error: &'a str,
    message: String,
    path: &'a str,
}

impl HttpResponse {
    pub(crate) fn new(
        request: Arc<HttpRequest>,
        channel: Arc<Channel>,
        sequence: u64,
        config: Arc<ResponseConfig>,
    ) -> Self {
        let mut headers = HeaderMap::new();
        let request_header = request.request_header();
        if request_header.wants_close() {
            headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        } else if request.version() == Version::HTTP_10 {
            headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        }

        Self {
            request,
            channel,
            sequence,
            headers: Mutex::new(headers),
            status: Mutex::new(StatusCode::OK),
            committed: AtomicBool::new(false),
            config,
        }
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn status(&self) -> StatusCode {
        *self.status.lock()
    }

    pub fn set_status(&self, status: StatusCode) {
        *self.status.lock() = status;
    }

    /// Sets header `name`, replacing earlier values. Names are case-insensitive.
    pub fn set_header(&self, name: &str, value: &str) -> Result<(), SendError> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(SendError::invalid_header)?;
        let value = HeaderValue::from_str(value).map_err(SendError::invalid_header)?;
        self.headers.lock().insert(name, value);
        Ok(())
    }

    /// Adds a value to header `name`, keeping earlier ones.
    pub fn append_header(&self, name: &str, value: &str) -> Result<(), SendError> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(SendError::invalid_header)?;
        let value = HeaderValue::from_str(value).map_err(SendError::invalid_header)?;
        self.headers.lock().append(name, value);
        Ok(())
    }

    pub fn header(&self, name: &str) -> Option<String> {
        let headers = self.headers.lock();
        headers.get(name.to_ascii_lowercase().as_str()).and_then(|v| v.to_str().ok()).map(str::to_string)
    }

    pub fn remove_header(&self, name: &str) -> Option<String> {
        let mut headers = self.headers.lock();
        headers.remove(name.to_ascii_lowercase().as_str()).and_then(|v| v.to_str().ok().map(str::to_string))
    }

    /// Whether the connection stays open after this response.
    pub fn is_keep_alive(&self) -> bool {
        !self
            .headers
            .lock()
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    /// Writes the whole response. Fails if a response was already written.
    pub fn write<B: Into<Bytes>>(&self, status: StatusCode, content_type: &str, body: B) -> Result<(), SendError> {
        self.commit(status, content_type, body.into(), None)
    }

    /// A small HTML page naming `status`.
    pub fn render_code(&self, status: StatusCode) -> Result<(), SendError> {
        let title = format!("{} {}", status.as_u16(), status.canonical_reason().unwrap_or("Unknown"));
        let page = format!("<html><head><title>{title}</title></head><body><h1>{title}</h1></body></html>");
        self.write(status, "text/html; charset=utf-8", page)
    }

    pub fn render_text<S: Into<String>>(&self, status: StatusCode, text: S) -> Result<(), SendError> {
        self.write(status, "text/plain; charset=utf-8", text.into())
    }

    pub fn render_json<T: Serialize + ?Sized>(&self, status: StatusCode, value: &T) -> Result<(), SendError> {
        let body = serde_json::to_vec(value).map_err(SendError::io)?;
        self.write(status, mime::APPLICATION_JSON.as_ref(), body)
    }

    /// A JSON diagnostic for `error`.
    pub fn render_error(&self, status: StatusCode, error: &(dyn Error + '_)) -> Result<(), SendError> {
        let body = ErrorBody {
            status: status.as_u16(),
            error: status.canonical_reason().unwrap_or("Unknown"),
            message: error.to_string(),
            path: self.request.path(),
        };
        self.render_json(status, &body)
    }

    /// Writes a bare error response for a request that has run too long.
    ///
    /// Waits at most `max_wait` for earlier responses on the connection, then
    /// writes anyway.
    pub(crate) fn render_timeout(&self, max_wait: Duration) -> Result<(), SendError> {
        let status = StatusCode::GATEWAY_TIMEOUT;
        let title = format!("{} {}", status.as_u16(), status.canonical_reason().unwrap_or("Unknown"));
        self.headers.lock().insert(header::CONNECTION, HeaderValue::from_static("close"));
        self.commit(status, "text/plain; charset=utf-8", Bytes::from(title), Some(max_wait))
    }

    fn commit(
        &self,
        status: StatusCode,
        content_type: &str,
        body: Bytes,
        max_wait: Option<Duration>,
    ) -> Result<(), SendError> {
        if self.committed.swap(true, Ordering::SeqCst) {
            return Err(SendError::Committed);
        }
        if self.channel.is_closed() {
            self.channel.release(self.sequence);
            return Err(SendError::Closed);
        }
        self.set_status(status);

        let result = self.encode(status, content_type, body).and_then(|buf| {
            trace!(status = status.as_u16(), path = self.request.path(), "writing response");
            self.channel.write_in_turn(self.sequence, &buf, max_wait).map_err(SendError::io)
        });
        self.channel.release(self.sequence);

        if let Err(e) = &result {
            debug!(cause = %e, path = self.request.path(), "write response failed");
        }
        result
    }

    fn encode(&self, status: StatusCode, content_type: &str, body: Bytes) -> Result<BytesMut, SendError> {
        let mut head = Response::new(());
        *head.status_mut() = status;
        *head.headers_mut() = self.headers.lock().clone();

        let headers = head.headers_mut();
        if !content_type.is_empty() {
            let value = HeaderValue::from_str(content_type).map_err(SendError::invalid_header)?;
            headers.insert(header::CONTENT_TYPE, value);
        }
        if !self.config.server_name.is_empty() && !headers.contains_key(header::SERVER) {
            let value = HeaderValue::from_str(&self.config.server_name).map_err(SendError::invalid_header)?;
            headers.insert(header::SERVER, value);
        }
        if !self.config.disable_cookie {
            for cookie in self.request.fresh_cookies() {
                let value = HeaderValue::from_str(&cookie.to_set_cookie()).map_err(SendError::invalid_header)?;
                headers.append(header::SET_COOKIE, value);
            }
        }

        let mut encoder = if self.request.method() == Method::HEAD {
            ResponseEncoder::head_only()
        } else {
            ResponseEncoder::new()
        };
        let mut buf = BytesMut::with_capacity(body.len() + 256);
        encoder.encode((head, body), &mut buf)?;
        Ok(buf)
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status())
            .field("sequence", &self.sequence)
            .field("committed", &self.is_committed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::http_request::tests::decode;
    use crate::protocol::{MemorySessionStore, SessionStore};
    use crate::server::RequestConfig;
    use mio::Token;
    use std::io::Read;
    use std::net::TcpStream;

    fn connect() -> (Arc<Channel>, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (Arc::new(Channel::new(Token(3), mio::net::TcpStream::from_std(server), peer)), client)
    }

    fn new_response(raw: &str, config: ResponseConfig) -> (HttpResponse, TcpStream) {
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let request = Arc::new(decode(raw.as_bytes(), RequestConfig::default(), store));
        let (channel, client) = connect();
        let sequence = channel.begin_request();
        (HttpResponse::new(request, channel, sequence, Arc::new(config)), client)
    }

    fn read_response(client: &mut TcpStream, response: HttpResponse) -> String {
        response.channel.close();
        let mut text = String::new();
        client.read_to_string(&mut text).unwrap();
        text
    }

    #[test]
    fn writes_once() {
        let (response, mut client) = new_response("GET / HTTP/1.1\r\n\r\n", ResponseConfig::default());

        response.render_text(StatusCode::OK, "hi").unwrap();
        assert!(response.is_committed());
        assert!(matches!(response.render_text(StatusCode::OK, "again"), Err(SendError::Committed)));

        let text = read_response(&mut client, response);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("server: micro-poll\r\n"));
        assert!(text.contains("content-length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[test]
    fn connection_close_preset() {
        let (response, _client) = new_response("GET / HTTP/1.1\r\nConnection: close\r\n\r\n", ResponseConfig::default());
        assert!(!response.is_keep_alive());
        assert_eq!(response.header("Connection").as_deref(), Some("close"));

        let (response, _client) = new_response("GET / HTTP/1.0\r\n\r\n", ResponseConfig::default());
        assert!(!response.is_keep_alive());

        let (response, _client) = new_response("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", ResponseConfig::default());
        assert!(response.is_keep_alive());

        let (response, _client) = new_response("GET / HTTP/1.1\r\n\r\n", ResponseConfig::default());
        assert!(response.is_keep_alive());
        response.set_header("CONNECTION", "close").unwrap();
        assert!(!response.is_keep_alive());
    }

    #[test]
    fn session_cookie_is_sent() {
        let (response, mut client) = new_response("GET / HTTP/1.1\r\n\r\n", ResponseConfig::default());
        let session = response.request().session().unwrap();
        response.render_code(StatusCode::NOT_FOUND).unwrap();

        let text = read_response(&mut client, response);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains(&format!("set-cookie: SESSIONID={}; Path=/; HttpOnly\r\n", session.id())));
        assert!(text.contains("<h1>404 Not Found</h1>"));
    }

    #[test]
    fn head_response_has_no_body() {
        let (response, mut client) = new_response("HEAD /x HTTP/1.1\r\n\r\n", ResponseConfig::default());
        response.render_text(StatusCode::OK, "hidden").unwrap();

        let text = read_response(&mut client, response);
        assert!(text.contains("content-length: 6\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn error_diagnostic_is_json() {
        let config = ResponseConfig { server_name: String::new(), ..ResponseConfig::default() };
        let (response, mut client) = new_response("GET /fail HTTP/1.1\r\n\r\n", config);
        let error = std::io::Error::other("boom");
        response.render_error(StatusCode::INTERNAL_SERVER_ERROR, &error).unwrap();

        let text = read_response(&mut client, response);
        assert!(!text.contains("server:"));
        assert!(text.contains("content-type: application/json\r\n"));
        let body = text.split("\r\n\r\n").nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["status"], 500);
        assert_eq!(json["message"], "boom");
        assert_eq!(json["path"], "/fail");
    }

    #[test]
    fn write_after_close_fails() {
        let (response, _client) = new_response("GET / HTTP/1.1\r\n\r\n", ResponseConfig::default());
        response.channel.close();
        assert!(matches!(response.render_text(StatusCode::OK, "x"), Err(SendError::Closed)));
    }
}
