//! Presence: the local announcement, the merged presence map and the
//! best-effort persistence outbox.

mod channel;
mod outbox;

pub use channel::PresenceChannel;
pub use outbox::{OfflineMarker, PersistenceOutbox};
