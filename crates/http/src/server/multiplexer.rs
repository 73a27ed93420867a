//! The network loop.
//!
//! One thread owns the poll: it accepts connections, reads what each readable
//! connection has, feeds the bytes to the connection's decoder and hands every
//! completed request to the executor. It never writes to a connection, error
//! responses for rejected requests are written by an executor task.

use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use http::{HeaderValue, Method, Response, StatusCode, header};
use mio::net::TcpListener;
use mio::{Events, Poll, Token};
use tokio_util::codec::Encoder;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{DecodedRequest, RequestDecoder, ResponseEncoder};
use crate::connection::Channel;
use crate::handler::RequestHandler;
use crate::protocol::{HttpRequest, ParseError, SendError};
use crate::server::{ResponseConfig, ServerContext};

pub(crate) const LISTENER: Token = Token(0);
pub(crate) const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

const READ_BUFFER_SIZE: usize = 16 * 1024;
const EVENTS_CAPACITY: usize = 1024;

enum ReadOutcome {
    /// Nothing more to read for now.
    Pending,
    /// The peer finished sending.
    Eof,
    /// The bytes received do not form a valid request.
    Rejected(ParseError),
    /// The connection failed.
    Broken(io::Error),
}

pub(crate) struct Multiplexer {
    poll: Poll,
    listener: TcpListener,
    context: Arc<ServerContext>,
    shutdown: Arc<AtomicBool>,
    next_token: usize,
    buf: Vec<u8>,
}

impl Multiplexer {
    pub(crate) fn new(
        poll: Poll,
        listener: TcpListener,
        context: Arc<ServerContext>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self { poll, listener, context, shutdown, next_token: FIRST_CONNECTION, buf: vec![0; READ_BUFFER_SIZE] }
    }

    /// Runs until shutdown is requested, then closes every connection.
    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() != ErrorKind::Interrupted {
                    error!(cause = %e, "poll failed");
                }
                continue;
            }

            for event in &events {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => trace!("network loop woken"),
                    token => self.readable(token),
                }
            }
        }

        self.context.registry().close_all();
        info!("network loop stopped");
    }

    fn accept(&mut self) {
        loop {
            let (stream, peer_addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    return;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                trace!(cause = %e, "set nodelay failed");
            }
            let token = Token(self.next_token);
            self.next_token += 1;

            let channel = Arc::new(Channel::new(token, stream, peer_addr));
            match self.context.registry().register(Arc::clone(&channel)) {
                Ok(()) => trace!(token = token.0, peer = %peer_addr, "accepted connection"),
                Err(e) => {
                    warn!(cause = %e, peer = %peer_addr, "register connection failed");
                    channel.close();
                }
            }
        }
    }

    fn readable(&mut self, token: Token) {
        let context = Arc::clone(&self.context);
        let registry = context.registry();
        let Some(channel) = registry.channel(token) else {
            return;
        };
        let mut decoder =
            registry.take_decoder(token).unwrap_or_else(|| RequestDecoder::new(Arc::clone(context.decoder_config())));
        if decoder.is_failed() {
            registry.put_decoder(token, decoder);
            return;
        }

        match self.drain(&channel, &mut decoder) {
            ReadOutcome::Pending => self.keep_decoder(&channel, decoder),
            ReadOutcome::Eof => {
                channel.set_read_closed();
                if decoder.has_partial() {
                    let e = match decoder.decode_eof() {
                        Err(e) => e,
                        Ok(()) => ParseError::invalid_header("stream ended inside the request"),
                    };
                    self.reject(&channel, decoder, e);
                } else if channel.in_flight() == 0 {
                    trace!(token = token.0, "peer closed idle connection");
                    registry.close_channel(&channel);
                } else {
                    self.keep_decoder(&channel, decoder);
                }
            }
            ReadOutcome::Rejected(e) => self.reject(&channel, decoder, e),
            ReadOutcome::Broken(e) => {
                debug!(cause = %e, token = token.0, "read connection failed");
                registry.close_channel(&channel);
            }
        }
    }

    /// Reads until the socket would block, dispatching every completed request.
    fn drain(&mut self, channel: &Arc<Channel>, decoder: &mut RequestDecoder) -> ReadOutcome {
        loop {
            let n = match channel.read(&mut self.buf) {
                Ok(0) => return ReadOutcome::Eof,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return ReadOutcome::Pending,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return ReadOutcome::Broken(e),
            };
            trace!(token = channel.token().0, n, "read bytes");
            if let Err(e) = feed(&self.context, channel, decoder, &self.buf[..n]) {
                return ReadOutcome::Rejected(e);
            }
        }
    }

    fn keep_decoder(&self, channel: &Channel, decoder: RequestDecoder) {
        let registry = self.context.registry();
        registry.put_decoder(channel.token(), decoder);
        // a worker may have closed the channel while the decoder was out
        if channel.is_closed() {
            registry.remove_decoder(channel.token());
        }
    }

    /// Keeps the failed decoder so nothing more is read, and answers with the
    /// error status from a worker before closing.
    fn reject(&self, channel: &Arc<Channel>, decoder: RequestDecoder, e: ParseError) {
        info!(cause = %e, peer = %channel.peer_addr(), "rejecting request");
        self.keep_decoder(channel, decoder);

        let sequence = channel.next_sequence();
        let bytes = match encode_error_response(e.status_code(), self.context.response_config()) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(cause = %e, "encode error response failed");
                self.context.registry().close_channel(channel);
                return;
            }
        };

        let channel = Arc::clone(channel);
        let context = Arc::clone(&self.context);
        self.context.executor().execute(Box::new(move || {
            if let Err(e) = channel.write_in_turn(sequence, &bytes, None) {
                debug!(cause = %e, "write error response failed");
            }
            channel.release(sequence);
            context.registry().close_channel(&channel);
        }));
    }
}

/// Decodes `bytes`, dispatching each request they complete.
///
/// Bytes past a completed request start the next one. After a CONNECT request
/// the decoder stays complete and further bytes are dropped.
fn feed(
    context: &Arc<ServerContext>,
    channel: &Arc<Channel>,
    decoder: &mut RequestDecoder,
    bytes: &[u8],
) -> Result<(), ParseError> {
    if decoder.is_complete() {
        return Ok(());
    }

    let mut completed = decoder.decode(bytes)?;
    while completed {
        let Some(decoded) = decoder.take_request() else {
            break;
        };
        let connect = decoded.header.method() == Method::CONNECT;
        dispatch(context, channel, decoded);
        if connect {
            return Ok(());
        }

        let remaining = decoder.take_remaining();
        *decoder = RequestDecoder::new(Arc::clone(context.decoder_config()));
        if remaining.is_empty() {
            break;
        }
        completed = decoder.decode(&remaining)?;
    }
    Ok(())
}

fn dispatch(context: &Arc<ServerContext>, channel: &Arc<Channel>, decoded: DecodedRequest) {
    let sequence = channel.begin_request();
    let request = HttpRequest::new(
        decoded,
        channel.peer_addr(),
        Arc::clone(context.request_config()),
        Arc::clone(context.session_store()),
    );
    debug!(method = %request.method(), uri = %request.uri(), sequence, "dispatching request");

    let handler = Arc::new(RequestHandler::new(request, Arc::clone(channel), sequence, Arc::clone(context)));
    if context.has_listeners() {
        context.registry().track_listeners(Arc::clone(&handler));
    }
    if context.config().timeout().is_some() {
        context.registry().track_timeout(Arc::clone(&handler));
    }
    context.executor().execute(Box::new(move || handler.run()));
}

/// A bare response for a request that could not be decoded.
fn encode_error_response(status: StatusCode, config: &ResponseConfig) -> Result<BytesMut, SendError> {
    let mut head = Response::new(());
    *head.status_mut() = status;
    let headers = head.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    if !config.server_name.is_empty() {
        headers.insert(header::SERVER, HeaderValue::from_str(&config.server_name).map_err(SendError::invalid_header)?);
    }

    let body = Bytes::from(format!("{} {}", status.as_u16(), status.canonical_reason().unwrap_or("Unknown")));
    let mut buf = BytesMut::with_capacity(128);
    ResponseEncoder::new().encode((head, body), &mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_closes() {
        let buf = encode_error_response(StatusCode::PAYLOAD_TOO_LARGE, &ResponseConfig::default()).unwrap();
        let text = std::str::from_utf8(&buf).unwrap();

        assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.contains("server: micro-poll\r\n"));
        assert!(text.ends_with("\r\n\r\n413 Payload Too Large"));
    }
}
