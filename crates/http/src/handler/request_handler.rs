use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use http::StatusCode;
use tracing::{debug, error, info, warn};

use crate::connection::Channel;
use crate::handler::BoxError;
use crate::protocol::{HttpError, HttpRequest, HttpResponse};
use crate::server::ServerContext;

/// How long a forced timeout response waits for earlier responses on its connection.
const TIMEOUT_TURN_WAIT: Duration = Duration::from_millis(200);

/// Runs one request: listeners, interceptors, and the cleanup that follows.
///
/// Completion, destruction and timeout each happen at most once, whichever of
/// the worker, the timeout sweeper and the listener sweeper gets there first.
pub struct RequestHandler {
    request: Arc<HttpRequest>,
    response: Arc<HttpResponse>,
    channel: Arc<Channel>,
    context: Arc<ServerContext>,
    sequence: u64,
    destroyed: AtomicBool,
    completed: AtomicBool,
    timed_out: AtomicBool,
}

impl RequestHandler {
    pub fn new(request: HttpRequest, channel: Arc<Channel>, sequence: u64, context: Arc<ServerContext>) -> Self {
        let request = Arc::new(request);
        let response = Arc::new(HttpResponse::new(
            Arc::clone(&request),
            Arc::clone(&channel),
            sequence,
            Arc::clone(context.response_config()),
        ));
        Self {
            request,
            response,
            channel,
            context,
            sequence,
            destroyed: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
        }
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// Runs the request on the current thread. Never panics.
    pub fn run(&self) {
        match panic::catch_unwind(AssertUnwindSafe(|| self.invoke())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(cause = %e, path = self.request.path(), "request failed");
                self.render_failure(&HttpError::application(e));
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(cause = %reason, path = self.request.path(), "request panicked");
                self.render_failure(&HttpError::application(reason));
            }
        }
        self.complete();
    }

    fn invoke(&self) -> Result<(), BoxError> {
        for listener in self.context.listeners() {
            listener.create(&self.request, &self.response);
        }
        if let Err(e) = self.request.resolve_form() {
            info!(cause = %e, path = self.request.path(), "malformed request body");
            self.render_failure(&HttpError::from(e));
            return Ok(());
        }
        self.context.interceptors().run(&self.request, &self.response)?;
        Ok(())
    }

    fn render_failure(&self, e: &HttpError) {
        if self.response.is_committed() || self.channel.is_closed() {
            return;
        }
        if let Err(send_error) = self.response.render_error(e.status_code(), e) {
            debug!(cause = %send_error, "write error response failed");
        }
    }

    /// Finishes the request and decides whether its connection stays open.
    pub fn complete(&self) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }

        if !self.response.is_committed()
            && !self.request.is_connect()
            && !self.channel.is_closed()
            && let Err(e) = self.response.render_code(StatusCode::NOT_FOUND)
        {
            debug!(cause = %e, "write not found response failed");
        }

        self.request.delete_temp_files();
        self.channel.release(self.sequence);

        let keep_alive = !self.request.is_connect() && self.response.is_keep_alive();
        let remaining = self.channel.end_request();
        self.context.registry().untrack_timeout(self);

        if !keep_alive || (remaining == 0 && self.channel.is_read_closed()) {
            self.close();
        } else {
            self.destroy();
        }
    }

    /// Closes the connection of this request and destroys it.
    pub fn close(&self) {
        self.request.delete_temp_files();
        self.context.registry().close_channel(&self.channel);
        self.destroy();
    }

    /// Fires the destroy listeners, once.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.request.delete_temp_files();
        for listener in self.context.listeners() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| listener.destroy(&self.request, &self.response)));
            if let Err(payload) = result {
                error!(cause = %panic_message(payload.as_ref()), "destroy listener panicked");
            }
        }
    }

    /// Forces a 504 and closes the connection. Returns `false` if the request
    /// already completed or timed out.
    pub fn time_out(&self) -> bool {
        if self.is_completed() || self.timed_out.swap(true, Ordering::SeqCst) {
            return false;
        }

        let error = HttpError::timed_out(self.request.elapsed());
        warn!(cause = %error, path = self.request.path(), "request timed out");
        if !self.response.is_committed()
            && let Err(e) = self.response.render_timeout(TIMEOUT_TURN_WAIT)
        {
            debug!(cause = %e, "write timeout response failed");
        }
        self.close();
        true
    }
}

impl fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandler")
            .field("request", &self.request)
            .field("sequence", &self.sequence)
            .field("completed", &self.is_completed())
            .field("destroyed", &self.is_destroyed())
            .field("timed_out", &self.is_timed_out())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DecoderConfig, RequestDecoder};
    use crate::handler::{Interceptors, RequestListener};
    use crate::protocol::MemorySessionStore;
    use crate::server::{InlineExecutor, ServerConfig};
    use mio::{Poll, Token};
    use std::io::Read;
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        created: AtomicUsize,
        destroyed: AtomicUsize,
    }

    impl RequestListener for Arc<Counting> {
        fn create(&self, _request: &HttpRequest, _response: &HttpResponse) {
            self.created.fetch_add(1, Ordering::SeqCst);
        }

        fn destroy(&self, _request: &HttpRequest, _response: &HttpResponse) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        _poll: Poll,
        context: Arc<ServerContext>,
        counting: Arc<Counting>,
    }

    fn fixture(interceptors: Interceptors) -> Fixture {
        let poll = Poll::new().unwrap();
        let counting = Arc::new(Counting::default());
        let context = ServerContext::new(
            ServerConfig::default(),
            vec![Box::new(Arc::clone(&counting))],
            interceptors,
            Arc::new(InlineExecutor),
            Arc::new(MemorySessionStore::new()),
            poll.registry().try_clone().unwrap(),
        );
        Fixture { _poll: poll, context: Arc::new(context), counting }
    }

    fn handler(fixture: &Fixture, raw: &str) -> (RequestHandler, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let channel = Arc::new(Channel::new(Token(5), mio::net::TcpStream::from_std(server), peer));
        fixture.context.registry().register(Arc::clone(&channel)).unwrap();

        let mut decoder = RequestDecoder::new(Arc::new(DecoderConfig::default()));
        assert!(decoder.decode(raw.as_bytes()).unwrap());
        let request = HttpRequest::new(
            decoder.take_request().unwrap(),
            peer,
            Arc::clone(fixture.context.request_config()),
            Arc::clone(fixture.context.session_store()),
        );
        let sequence = channel.begin_request();
        (RequestHandler::new(request, channel, sequence, Arc::clone(&fixture.context)), client)
    }

    fn drain(handler: &RequestHandler, client: &mut TcpStream) -> String {
        handler.channel().close();
        let mut text = String::new();
        client.read_to_string(&mut text).unwrap();
        text
    }

    #[test]
    fn unanswered_request_gets_404_and_stays_open() {
        let fixture = fixture(Interceptors::default());
        let (handler, mut client) = handler(&fixture, "GET /missing HTTP/1.1\r\n\r\n");

        handler.run();
        assert!(handler.is_completed());
        assert!(!handler.channel().is_closed());
        assert_eq!(fixture.counting.created.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.counting.destroyed.load(Ordering::SeqCst), 1);

        assert!(drain(&handler, &mut client).starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn chain_stops_on_false() {
        let interceptors = Interceptors::builder()
            .add_last(|_: &HttpRequest, response: &HttpResponse| -> Result<bool, BoxError> {
                response.render_text(StatusCode::OK, "first")?;
                Ok(false)
            })
            .add_last(|_: &HttpRequest, _: &HttpResponse| -> Result<bool, BoxError> { panic!("never runs") })
            .build();
        let fixture = fixture(interceptors);
        let (handler, mut client) = handler(&fixture, "GET / HTTP/1.1\r\n\r\n");

        handler.run();
        assert!(drain(&handler, &mut client).ends_with("\r\n\r\nfirst"));
    }

    #[test]
    fn connection_close_closes_after_completion() {
        let fixture = fixture(Interceptors::default());
        let (handler, _client) = handler(&fixture, "GET / HTTP/1.1\r\nConnection: close\r\n\r\n");

        handler.run();
        assert!(handler.channel().is_closed());
        assert_eq!(fixture.context.registry().channel_count(), 0);
        assert_eq!(fixture.counting.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn malformed_form_body_is_400() {
        let interceptors = Interceptors::builder()
            .add_last(|_: &HttpRequest, _: &HttpResponse| -> Result<bool, BoxError> { panic!("never runs") })
            .build();
        let fixture = fixture(interceptors);
        let raw = "POST /up HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=b\r\nContent-Length: 9\r\n\r\n--b\r\njunk";
        let (handler, mut client) = handler(&fixture, raw);

        handler.run();
        assert!(handler.is_completed());
        assert!(drain(&handler, &mut client).starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn connect_always_closes() {
        let interceptors = Interceptors::builder()
            .add_last(|_: &HttpRequest, response: &HttpResponse| -> Result<bool, BoxError> {
                response.render_text(StatusCode::OK, "tunnel")?;
                Ok(true)
            })
            .build();
        let fixture = fixture(interceptors);
        let (handler, _client) = handler(&fixture, "CONNECT example.com:443 HTTP/1.1\r\n\r\n");

        handler.run();
        assert!(handler.channel().is_closed());
    }

    #[test]
    fn failure_becomes_500_diagnostic() {
        let interceptors = Interceptors::builder()
            .add_last(|_: &HttpRequest, _: &HttpResponse| -> Result<bool, BoxError> { Err("broken".into()) })
            .build();
        let fixture = fixture(interceptors);
        let (handler, mut client) = handler(&fixture, "GET /err HTTP/1.1\r\n\r\n");

        handler.run();
        let text = drain(&handler, &mut client);
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("broken"));
    }

    #[test]
    fn panic_becomes_500_diagnostic() {
        let interceptors = Interceptors::builder()
            .add_last(|_: &HttpRequest, _: &HttpResponse| -> Result<bool, BoxError> { panic!("exploded") })
            .build();
        let fixture = fixture(interceptors);
        let (handler, mut client) = handler(&fixture, "GET /panic HTTP/1.1\r\n\r\n");

        handler.run();
        let text = drain(&handler, &mut client);
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("exploded"));
    }

    #[test]
    fn time_out_once_under_concurrent_sweeps() {
        let fixture = fixture(Interceptors::default());
        let (handler, mut client) = handler(&fixture, "GET /slow HTTP/1.1\r\n\r\n");
        let handler = Arc::new(handler);

        let fired: usize = (0..4)
            .map(|_| {
                let handler = Arc::clone(&handler);
                std::thread::spawn(move || handler.time_out())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| usize::from(t.join().unwrap()))
            .sum();
        assert_eq!(fired, 1);
        assert!(handler.channel().is_closed());

        handler.complete();
        assert_eq!(fixture.counting.destroyed.load(Ordering::SeqCst), 1);

        let mut text = String::new();
        client.read_to_string(&mut text).unwrap();
        assert_eq!(text.matches("HTTP/1.1 504 Gateway Timeout").count(), 1);
    }
}
