//! Server configuration.
//!
//! [`ServerConfig`] is plain data with a default for every field, so an
//! embedding application can deserialize it from whatever format it uses.
//! The per-request views ([`RequestConfig`], [`ResponseConfig`] and the
//! decoder's [`DecoderConfig`]) are derived from it once at startup.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DecoderConfig;

pub const DEFAULT_SESSION_COOKIE: &str = "SESSIONID";
pub const DEFAULT_SERVER_NAME: &str = "micro-poll";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds a request may run before a 504 is forced, 0 disables the timeout.
    pub timeout: u64,
    pub max_body_size: u64,
    /// Body bytes kept in memory before spilling to a temp file.
    pub spill_threshold: usize,
    pub temp_dir: Option<PathBuf>,
    pub disable_cookie: bool,
    pub record_request_body: bool,
    pub session_cookie_name: String,
    /// Worker threads, 0 uses the available parallelism.
    pub worker_threads: usize,
    pub pid_file: Option<PathBuf>,
    /// Period of the timeout and listener sweeps, in milliseconds.
    pub sweep_interval: u64,
    pub server_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let decoder = DecoderConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            timeout: 30,
            max_body_size: decoder.max_body_size,
            spill_threshold: decoder.spill_threshold,
            temp_dir: None,
            disable_cookie: false,
            record_request_body: false,
            session_cookie_name: DEFAULT_SESSION_COOKIE.to_string(),
            worker_threads: 0,
            pid_file: None,
            sweep_interval: 50,
            server_name: DEFAULT_SERVER_NAME.to_string(),
        }
    }
}

impl ServerConfig {
    /// The request timeout, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval.max(1))
    }

    pub fn worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        std::thread::available_parallelism().map(usize::from).unwrap_or(4)
    }

    /// Resolves `host:port` to the first matching socket address.
    pub fn socket_addr(&self) -> io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("cannot resolve host {}", self.host)))
    }

    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            max_body_size: self.max_body_size,
            spill_threshold: self.spill_threshold,
            temp_dir: self.temp_dir.clone(),
        }
    }

    pub fn request_config(&self) -> RequestConfig {
        RequestConfig {
            disable_cookie: self.disable_cookie,
            record_request_body: self.record_request_body,
            session_cookie_name: self.session_cookie_name.clone(),
            temp_dir: self.temp_dir.clone(),
        }
    }

    pub fn response_config(&self) -> ResponseConfig {
        ResponseConfig { disable_cookie: self.disable_cookie, server_name: self.server_name.clone() }
    }
}

/// The knobs of the request model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestConfig {
    pub disable_cookie: bool,
    pub record_request_body: bool,
    pub session_cookie_name: String,
    /// Directory for uploaded files, the system temp dir when `None`.
    pub temp_dir: Option<PathBuf>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            disable_cookie: false,
            record_request_body: false,
            session_cookie_name: DEFAULT_SESSION_COOKIE.to_string(),
            temp_dir: None,
        }
    }
}

/// The knobs of the response model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseConfig {
    pub disable_cookie: bool,
    /// Value of the `Server` header, empty to omit it.
    pub server_name: String,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self { disable_cookie: false, server_name: DEFAULT_SERVER_NAME.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{"port": 9000, "timeout": 0, "disable_cookie": true}"#).unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.timeout(), None);
        assert_eq!(config.max_body_size, 10 * 1024 * 1024);
        assert_eq!(config.sweep_interval(), Duration::from_millis(50));
        assert!(config.request_config().disable_cookie);
        assert!(config.response_config().disable_cookie);
        assert_eq!(config.request_config().session_cookie_name, "SESSIONID");
    }

    #[test]
    fn derived_configs() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            spill_threshold: 16,
            worker_threads: 3,
            ..ServerConfig::default()
        };

        assert_eq!(config.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.decoder_config().spill_threshold, 16);
        assert_eq!(config.worker_threads(), 3);
        assert_eq!(config.socket_addr().unwrap(), "127.0.0.1:0".parse().unwrap());
    }
}
