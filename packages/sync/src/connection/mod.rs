//! Connection lifecycle: one shared socket, reconnect with backoff, an
//! outbound queue while disconnected.

mod backoff;
mod manager;
mod policy;
mod queue;
mod types;

pub use backoff::Backoff;
pub use manager::ConnectionManager;
pub use policy::{Failure, is_fatal, should_attempt_reconnect};
pub use queue::OutboundQueue;
pub use types::{ConnectionCommand, ConnectionEvent, ConnectionHandle};

#[cfg(test)]
pub(crate) use types::drain_emitted;
