//! One accepted connection, shared between the network thread and workers.
//!
//! Reads happen only on the network thread. Writes happen on workers, one
//! whole response at a time and in dispatch order: every dispatched request
//! takes a sequence number, and its response waits until all earlier
//! sequences were released.

use std::collections::BTreeSet;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

/// How long a blocked write waits for the socket to drain.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Wake-up period of a writer waiting for its turn, to notice closes.
const TURN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

const WRITE_TOKEN: Token = Token(0);

#[derive(Debug, Default)]
struct WriterState {
    /// The sequence allowed to write next.
    next: u64,
    /// Released sequences above `next`.
    done: BTreeSet<u64>,
    /// Lazily created poll used to wait for writability.
    poll: Option<Poll>,
}

/// A non-blocking TCP connection with ordered, serialized writes.
#[derive(Debug)]
pub struct Channel {
    token: Token,
    stream: TcpStream,
    peer_addr: SocketAddr,
    closed: AtomicBool,
    read_closed: AtomicBool,
    in_flight: AtomicUsize,
    dispatched: AtomicU64,
    writer: Mutex<WriterState>,
    turn: Condvar,
}

impl Channel {
    pub fn new(token: Token, stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            token,
            stream,
            peer_addr,
            closed: AtomicBool::new(false),
            read_closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            dispatched: AtomicU64::new(0),
            writer: Mutex::new(WriterState::default()),
            turn: Condvar::new(),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Reads what is available without blocking.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks that the peer finished sending.
    pub fn set_read_closed(&self) {
        self.read_closed.store(true, Ordering::SeqCst);
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed.load(Ordering::SeqCst)
    }

    /// Registers a dispatched request and returns its write sequence.
    pub fn begin_request(&self) -> u64 {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.dispatched.fetch_add(1, Ordering::SeqCst)
    }

    /// Takes a write sequence for a response that belongs to no dispatched request.
    pub fn next_sequence(&self) -> u64 {
        self.dispatched.fetch_add(1, Ordering::SeqCst)
    }

    /// Ends a dispatched request, returning how many are still in flight.
    pub fn end_request(&self) -> usize {
        let previous = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        previous.saturating_sub(1)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Writes `bytes` once every earlier sequence was released.
    ///
    /// With `max_wait`, gives up waiting after that long and writes anyway,
    /// still as one uninterrupted message.
    pub fn write_in_turn(&self, sequence: u64, bytes: &[u8], max_wait: Option<Duration>) -> io::Result<()> {
        let mut writer = self.writer.lock();
        let deadline = max_wait.map(|wait| Instant::now() + wait);

        while writer.next < sequence && !self.is_closed() {
            match deadline {
                Some(deadline) => {
                    if self.turn.wait_until(&mut writer, deadline).timed_out() {
                        debug!(token = self.token.0, sequence, "write turn not reached, writing out of order");
                        break;
                    }
                }
                None => {
                    self.turn.wait_for(&mut writer, TURN_CHECK_INTERVAL);
                }
            }
        }

        if self.is_closed() {
            return Err(io::Error::new(ErrorKind::NotConnected, "connection already closed"));
        }

        trace!(token = self.token.0, sequence, len = bytes.len(), "writing response");
        self.write_all(&mut writer, bytes)
    }

    /// Lets the sequences after `sequence` write.
    pub fn release(&self, sequence: u64) {
        let mut writer = self.writer.lock();
        if sequence < writer.next {
            return;
        }
        let state = &mut *writer;
        state.done.insert(sequence);
        while state.done.remove(&state.next) {
            state.next += 1;
        }
        drop(writer);
        self.turn.notify_all();
    }

    /// Shuts the socket down. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both)
            && e.kind() != ErrorKind::NotConnected
        {
            debug!(cause = %e, token = self.token.0, "shutdown connection failed");
        }
        self.turn.notify_all();
        true
    }

    fn write_all(&self, writer: &mut WriterState, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            match (&self.stream).write(bytes) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => self.wait_writable(writer)?,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn wait_writable(&self, writer: &mut WriterState) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(ErrorKind::NotConnected, "connection already closed"));
        }

        if writer.poll.is_none() {
            let poll = Poll::new()?;
            poll.registry().register(&mut SourceFd(&self.raw_fd()), WRITE_TOKEN, Interest::WRITABLE)?;
            writer.poll = Some(poll);
        }
        let Some(poll) = writer.poll.as_mut() else {
            return Err(ErrorKind::Other.into());
        };

        let mut events = Events::with_capacity(4);
        loop {
            match poll.poll(&mut events, Some(WRITE_TIMEOUT)) {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if events.is_empty() {
            return Err(io::Error::new(ErrorKind::TimedOut, "timed out waiting for the peer to read"));
        }
        Ok(())
    }
}
