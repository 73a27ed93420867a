use std::fmt;
use std::sync::Arc;

use mio::Registry;

use crate::codec::DecoderConfig;
use crate::connection::ConnectionRegistry;
use crate::handler::{Interceptors, RequestListener};
use crate::protocol::SessionStore;
use crate::server::{Executor, RequestConfig, ResponseConfig, ServerConfig};

/// Everything a running server shares between its threads.
pub struct ServerContext {
    config: ServerConfig,
    decoder_config: Arc<DecoderConfig>,
    request_config: Arc<RequestConfig>,
    response_config: Arc<ResponseConfig>,
    registry: ConnectionRegistry,
    listeners: Vec<Box<dyn RequestListener>>,
    interceptors: Interceptors,
    executor: Arc<dyn Executor>,
    session_store: Arc<dyn SessionStore>,
}

impl ServerContext {
    pub fn new(
        config: ServerConfig,
        listeners: Vec<Box<dyn RequestListener>>,
        interceptors: Interceptors,
        executor: Arc<dyn Executor>,
        session_store: Arc<dyn SessionStore>,
        poll_registry: Registry,
    ) -> Self {
        Self {
            decoder_config: Arc::new(config.decoder_config()),
            request_config: Arc::new(config.request_config()),
            response_config: Arc::new(config.response_config()),
            config,
            registry: ConnectionRegistry::new(poll_registry),
            listeners,
            interceptors,
            executor,
            session_store,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn decoder_config(&self) -> &Arc<DecoderConfig> {
        &self.decoder_config
    }

    pub fn request_config(&self) -> &Arc<RequestConfig> {
        &self.request_config
    }

    pub fn response_config(&self) -> &Arc<ResponseConfig> {
        &self.response_config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn listeners(&self) -> &[Box<dyn RequestListener>] {
        &self.listeners
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    pub fn interceptors(&self) -> &Interceptors {
        &self.interceptors
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    pub fn session_store(&self) -> &Arc<dyn SessionStore> {
        &self.session_store
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("listeners", &self.listeners.len())
            .field("interceptors", &self.interceptors)
            .finish_non_exhaustive()
    }
}
