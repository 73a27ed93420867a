//! The connection registry shared by the network thread, workers and sweepers.
//!
//! Holds the open channels, the one decoder of every connection, the handlers
//! tracked for listener cleanup and the handlers tracked for timeouts. It is
//! owned by the server context and passed around by `Arc`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::codec::RequestDecoder;
use crate::connection::Channel;
use crate::handler::RequestHandler;

pub struct ConnectionRegistry {
    poll_registry: Registry,
    channels: DashMap<Token, Arc<Channel>>,
    decoders: DashMap<Token, RequestDecoder>,
    tracked: DashMap<Token, Vec<Arc<RequestHandler>>>,
    timeouts: Mutex<Vec<Arc<RequestHandler>>>,
}

impl ConnectionRegistry {
    pub fn new(poll_registry: Registry) -> Self {
        Self {
            poll_registry,
            channels: DashMap::new(),
            decoders: DashMap::new(),
            tracked: DashMap::new(),
            timeouts: Mutex::new(Vec::new()),
        }
    }

    /// Adds an accepted channel and starts watching it for reads.
    pub fn register(&self, channel: Arc<Channel>) -> std::io::Result<()> {
        let token = channel.token();
        self.poll_registry.register(&mut SourceFd(&channel.raw_fd()), token, Interest::READABLE)?;
        self.channels.insert(token, channel);
        Ok(())
    }

    pub fn channel(&self, token: Token) -> Option<Arc<Channel>> {
        self.channels.get(&token).map(|entry| Arc::clone(entry.value()))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Takes the decoder of `token` out of the table for exclusive use.
    pub fn take_decoder(&self, token: Token) -> Option<RequestDecoder> {
        self.decoders.remove(&token).map(|(_, decoder)| decoder)
    }

    pub fn put_decoder(&self, token: Token, decoder: RequestDecoder) {
        self.decoders.insert(token, decoder);
    }

    pub fn remove_decoder(&self, token: Token) {
        self.decoders.remove(&token);
    }

    pub fn has_decoder(&self, token: Token) -> bool {
        self.decoders.contains_key(&token)
    }

    /// Channels whose unfinished request started `max_age` or more ago.
    ///
    /// Decoders held by the network thread at the time are not seen.
    pub(crate) fn stalled_channels(&self, max_age: Duration) -> Vec<Arc<Channel>> {
        let tokens: Vec<Token> = self
            .decoders
            .iter()
            .filter(|entry| {
                let decoder = entry.value();
                decoder.has_partial() && decoder.started().is_some_and(|at| at.elapsed() >= max_age)
            })
            .map(|entry| *entry.key())
            .collect();
        tokens.into_iter().filter_map(|token| self.channel(token)).collect()
    }

    /// Records a handler whose destroy listeners must fire if its connection dies.
    pub fn track_listeners(&self, handler: Arc<RequestHandler>) {
        self.tracked.entry(handler.channel().token()).or_default().push(handler);
    }

    pub fn track_timeout(&self, handler: Arc<RequestHandler>) {
        self.timeouts.lock().push(handler);
    }

    pub fn untrack_timeout(&self, handler: &RequestHandler) {
        self.timeouts.lock().retain(|h| !std::ptr::eq(Arc::as_ptr(h), handler));
    }

    pub(crate) fn timeouts(&self) -> &Mutex<Vec<Arc<RequestHandler>>> {
        &self.timeouts
    }

    pub(crate) fn tracked(&self) -> &DashMap<Token, Vec<Arc<RequestHandler>>> {
        &self.tracked
    }

    /// Closes `channel` and forgets it. Safe to call any number of times.
    pub fn close_channel(&self, channel: &Channel) {
        let token = channel.token();
        let first = channel.close();
        self.decoders.remove(&token);
        if self.channels.remove(&token).is_some() {
            // the fd is still open while `channel` is borrowed
            if let Err(e) = self.poll_registry.deregister(&mut SourceFd(&channel.raw_fd())) {
                trace!(cause = %e, token = token.0, "deregister connection failed");
            }
        }
        if first {
            debug!(token = token.0, peer = %channel.peer_addr(), "connection closed");
        }
    }

    /// Closes every open channel.
    pub fn close_all(&self) {
        let channels: Vec<Arc<Channel>> = self.channels.iter().map(|entry| Arc::clone(entry.value())).collect();
        for channel in channels {
            self.close_channel(&channel);
        }
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("channels", &self.channels.len())
            .field("decoders", &self.decoders.len())
            .field("tracked", &self.tracked.len())
            .field("timeouts", &self.timeouts.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DecoderConfig;
    use mio::Poll;

    fn channel(token: usize) -> (Arc<Channel>, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (Arc::new(Channel::new(Token(token), mio::net::TcpStream::from_std(server), peer)), client)
    }

    #[test]
    fn close_channel_forgets_everything_once() {
        let poll = Poll::new().unwrap();
        let registry = ConnectionRegistry::new(poll.registry().try_clone().unwrap());
        let (channel, _client) = channel(10);

        registry.register(Arc::clone(&channel)).unwrap();
        registry.put_decoder(Token(10), RequestDecoder::new(Arc::new(DecoderConfig::default())));
        assert_eq!(registry.channel_count(), 1);
        assert!(registry.has_decoder(Token(10)));

        registry.close_channel(&channel);
        assert!(channel.is_closed());
        assert_eq!(registry.channel_count(), 0);
        assert!(!registry.has_decoder(Token(10)));

        registry.put_decoder(Token(10), RequestDecoder::new(Arc::new(DecoderConfig::default())));
        registry.close_channel(&channel);
        assert!(!registry.has_decoder(Token(10)));
    }

    #[test]
    fn close_all_closes_open_channels() {
        let poll = Poll::new().unwrap();
        let registry = ConnectionRegistry::new(poll.registry().try_clone().unwrap());
        let (first, _c1) = channel(20);
        let (second, _c2) = channel(21);
        registry.register(Arc::clone(&first)).unwrap();
        registry.register(Arc::clone(&second)).unwrap();

        registry.close_all();
        assert!(first.is_closed() && second.is_closed());
        assert_eq!(registry.channel_count(), 0);
    }
}
