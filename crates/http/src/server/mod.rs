//! Server assembly and the threads that run it.
//!
//! [`Server::builder`] collects the configuration and the collaborators,
//! [`Server::start`] binds and starts:
//!
//! - the network thread running the multiplexer loop
//! - the worker [`Executor`] running one task per request
//! - the timeout sweeper, when a timeout is configured
//! - the listener sweeper, when a request listener is registered

mod config;
pub use config::RequestConfig;
pub use config::ResponseConfig;
pub use config::ServerConfig;

mod context;
pub use context::ServerContext;

mod error;
pub use error::ServerError;

mod executor;
pub use executor::Executor;
pub use executor::InlineExecutor;
pub use executor::RuntimeExecutor;
pub use executor::Task;

mod multiplexer;

mod sweeper;
pub use sweeper::BackgroundTask;
pub use sweeper::sweep_listeners;
pub use sweeper::sweep_stalled;
pub use sweeper::sweep_timeouts;

#[allow(clippy::module_inception, reason = "the server type lives in its own file")]
mod server;
pub use server::RunningServer;
pub use server::Server;
pub use server::ServerBuilder;
