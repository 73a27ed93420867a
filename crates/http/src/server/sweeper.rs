//! Periodic sweeps over the connection registry.
//!
//! The timeout sweep forces a 504 on requests running past the timeout, and
//! the stall sweep closes connections that never finish sending a request
//! within it. The listener sweep fires destroy listeners for requests whose
//! connection died before they completed. Each runs on a [`BackgroundTask`].

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::Token;
use tracing::{debug, error, trace};

use crate::connection::ConnectionRegistry;
use crate::handler::RequestHandler;

/// A named thread calling a function every `period` until stopped.
pub struct BackgroundTask {
    name: String,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    pub fn spawn<F>(name: &str, period: Duration, mut task: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let thread_name = name.to_string();
        let thread = thread::Builder::new().name(name.to_string()).spawn(move || {
            loop {
                match stopped.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(&mut task)) {
                            error!(task = %thread_name, ?payload, "background task panicked");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(task = %thread_name, "background task stopped");
        })?;

        Ok(Self { name: name.to_string(), stop: Some(stop), thread: Some(thread) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the task and waits for its thread. Later calls do nothing.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            // a send error means the thread already ended
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!(task = %self.name, "background task thread panicked");
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundTask").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Times out tracked requests older than `timeout`, returning how many.
///
/// Entries whose request completed or whose connection closed are dropped.
pub fn sweep_timeouts(registry: &ConnectionRegistry, timeout: Duration) -> usize {
    let snapshot: Vec<Arc<RequestHandler>> = registry.timeouts().lock().clone();
    if snapshot.is_empty() {
        return 0;
    }

    let mut finished = HashSet::new();
    let mut timed_out = 0;
    for handler in &snapshot {
        if handler.is_completed() || handler.channel().is_closed() {
            finished.insert(Arc::as_ptr(handler));
        } else if handler.request().elapsed() >= timeout {
            if handler.time_out() {
                timed_out += 1;
            }
            finished.insert(Arc::as_ptr(handler));
        }
    }

    if !finished.is_empty() {
        registry.timeouts().lock().retain(|h| !finished.contains(&Arc::as_ptr(h)));
        trace!(finished = finished.len(), timed_out, "timeout sweep");
    }
    timed_out
}

/// Closes connections whose partly received request is older than `timeout`,
/// returning how many. Nothing is written, there is no request to answer yet.
pub fn sweep_stalled(registry: &ConnectionRegistry, timeout: Duration) -> usize {
    let stalled = registry.stalled_channels(timeout);
    for channel in &stalled {
        debug!(token = channel.token().0, peer = %channel.peer_addr(), "closing connection stalled mid-request");
        registry.close_channel(channel);
    }
    stalled.len()
}

/// Destroys the tracked requests of closed connections, returning how many
/// connections were dropped.
pub fn sweep_listeners(registry: &ConnectionRegistry) -> usize {
    let tracked = registry.tracked();
    let closed: Vec<Token> = tracked
        .iter()
        .filter(|entry| entry.value().iter().any(|h| h.channel().is_closed()))
        .map(|entry| *entry.key())
        .collect();

    for token in &closed {
        if let Some((_, handlers)) = tracked.remove(token) {
            for handler in handlers {
                handler.destroy();
            }
        }
    }

    tracked.retain(|_, handlers| {
        handlers.retain(|h| !h.is_destroyed());
        !handlers.is_empty()
    });
    closed.len()
}

/// Destroys every tracked request and forgets every timeout entry.
pub(crate) fn destroy_all(registry: &ConnectionRegistry) {
    let tokens: Vec<Token> = registry.tracked().iter().map(|entry| *entry.key()).collect();
    for token in tokens {
        if let Some((_, handlers)) = registry.tracked().remove(&token) {
            handlers.iter().for_each(|h| h.destroy());
        }
    }
    registry.timeouts().lock().clear();
}
