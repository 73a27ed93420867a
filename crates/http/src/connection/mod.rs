//! Connection state shared between the network thread and the workers.
//!
//! - [`Channel`]: one accepted socket with ordered, serialized response writes
//! - [`ConnectionRegistry`]: channels, decoders and tracked handlers by token

mod channel;
mod registry;

pub use channel::Channel;
pub use channel::WRITE_TIMEOUT;
pub use registry::ConnectionRegistry;
