use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use mio::net::TcpListener;
use mio::{Interest, Poll, Waker};
use tracing::{error, info, warn};

use crate::handler::{Interceptors, RequestListener};
use crate::protocol::{MemorySessionStore, SessionStore};
use crate::server::multiplexer::{LISTENER, Multiplexer, WAKER};
use crate::server::sweeper::{BackgroundTask, destroy_all, sweep_listeners, sweep_stalled, sweep_timeouts};
use crate::server::{Executor, RuntimeExecutor, ServerConfig, ServerContext, ServerError};

pub struct ServerBuilder {
    config: ServerConfig,
    listeners: Vec<Box<dyn RequestListener>>,
    interceptors: Interceptors,
    executor: Option<Arc<dyn Executor>>,
    session_store: Option<Arc<dyn SessionStore>>,
}

impl ServerBuilder {
    fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            listeners: vec![],
            interceptors: Interceptors::default(),
            executor: None,
            session_store: None,
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn address<H: Into<String>>(mut self, host: H, port: u16) -> Self {
        self.config.host = host.into();
        self.config.port = port;
        self
    }

    pub fn listener<L: RequestListener + 'static>(mut self, listener: L) -> Self {
        self.listeners.push(Box::new(listener));
        self
    }

    pub fn interceptors(mut self, interceptors: Interceptors) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Runs requests on `executor` instead of a runtime owned by the server.
    pub fn executor<E: Executor + 'static>(mut self, executor: E) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    pub fn session_store<S: SessionStore + 'static>(mut self, session_store: Arc<S>) -> Self {
        self.session_store = Some(session_store);
        self
    }

    pub fn build(self) -> Server {
        Server {
            config: self.config,
            listeners: self.listeners,
            interceptors: self.interceptors,
            executor: self.executor,
            session_store: self.session_store.unwrap_or_else(|| Arc::new(MemorySessionStore::new())),
        }
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("listeners", &self.listeners.len())
            .field("interceptors", &self.interceptors)
            .finish_non_exhaustive()
    }
}

pub struct Server {
    config: ServerConfig,
    listeners: Vec<Box<dyn RequestListener>>,
    interceptors: Interceptors,
    executor: Option<Arc<dyn Executor>>,
    session_store: Arc<dyn SessionStore>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Binds the listen address and starts the server threads.
    pub fn start(self) -> Result<RunningServer, ServerError> {
        let config = self.config;
        let addr = config.socket_addr().map_err(|e| ServerError::resolve(&config.host, config.port, e))?;
        let mut listener = TcpListener::bind(addr).map_err(|e| ServerError::bind(addr, e))?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let executor: Arc<dyn Executor> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(RuntimeExecutor::new(config.worker_threads())?),
        };

        if let Some(pid_file) = &config.pid_file {
            write_pid_file(pid_file);
        }

        let timeout = config.timeout();
        let sweep_interval = config.sweep_interval();
        let context = Arc::new(ServerContext::new(
            config,
            self.listeners,
            self.interceptors,
            executor,
            self.session_store,
            poll.registry().try_clone()?,
        ));

        let mut sweepers = Vec::new();
        if let Some(timeout) = timeout {
            let context = Arc::clone(&context);
            sweepers.push(BackgroundTask::spawn("micro-poll-timeout", sweep_interval, move || {
                sweep_timeouts(context.registry(), timeout);
                sweep_stalled(context.registry(), timeout);
            })?);
        }
        if context.has_listeners() {
            let context = Arc::clone(&context);
            sweepers.push(BackgroundTask::spawn("micro-poll-listener", sweep_interval, move || {
                sweep_listeners(context.registry());
            })?);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let multiplexer = Multiplexer::new(poll, listener, Arc::clone(&context), Arc::clone(&shutdown));
        let network = thread::Builder::new().name("micro-poll-network".to_string()).spawn(move || multiplexer.run())?;

        info!(%local_addr, "server started");
        Ok(RunningServer { local_addr, context, waker, shutdown, sweepers, network: Some(network) })
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server").field("config", &self.config).finish_non_exhaustive()
    }
}

/// A started server. Dropping it shuts the server down.
pub struct RunningServer {
    local_addr: std::net::SocketAddr,
    context: Arc<ServerContext>,
    waker: Waker,
    shutdown: Arc<AtomicBool>,
    sweepers: Vec<BackgroundTask>,
    network: Option<JoinHandle<()>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Blocks until the network thread ends.
    pub fn join(mut self) {
        if let Some(network) = self.network.take()
            && network.join().is_err()
        {
            error!("network thread panicked");
        }
    }

    /// Stops accepting, closes every connection and stops the sweepers.
    ///
    /// Requests still running finish on their workers, their writes fail.
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(local_addr = %self.local_addr, "shutting down");

        if let Err(e) = self.waker.wake() {
            error!(cause = %e, "wake network thread failed");
        }
        if let Some(network) = self.network.take()
            && network.join().is_err()
        {
            error!("network thread panicked");
        }

        for sweeper in &mut self.sweepers {
            sweeper.stop();
        }
        let registry = self.context.registry();
        registry.close_all();
        destroy_all(registry);

        if let Some(pid_file) = &self.context.config().pid_file
            && let Err(e) = std::fs::remove_file(pid_file)
        {
            warn!(cause = %e, path = %pid_file.display(), "remove pid file failed");
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RunningServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningServer").field("local_addr", &self.local_addr).finish_non_exhaustive()
    }
}

fn write_pid_file(path: &Path) {
    match std::fs::write(path, std::process::id().to_string()) {
        Ok(()) => info!(path = %path.display(), "pid file written"),
        Err(e) => warn!(cause = %e, path = %path.display(), "write pid file failed"),
    }
}
