use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Failures starting a server.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("cannot resolve listen address {host}:{port}: {source}")]
    Resolve { host: String, port: u16, source: io::Error },

    #[error("bind {addr} error: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("server start error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ServerError {
    pub fn resolve<S: ToString>(host: S, port: u16, source: io::Error) -> Self {
        Self::Resolve { host: host.to_string(), port, source }
    }

    pub fn bind(addr: SocketAddr, source: io::Error) -> Self {
        Self::Bind { addr, source }
    }
}
