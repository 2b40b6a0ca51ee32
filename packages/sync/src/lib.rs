//! Client-resident real-time synchronization for kizuna.
//!
//! One [`ChatSession`] owns a single socket and the components layered on
//! it: connection lifecycle, presence, activity heartbeat, message delivery
//! and typing indicators. UIs drive it through a cloneable [`SessionHandle`]
//! and observe it through [`SyncEvent`]s.

pub mod activity;
pub mod config;
pub mod connection;
pub mod domain;
pub mod error;
pub mod events;
pub mod infrastructure;
pub mod messaging;
pub mod presence;
pub mod scheduler;
pub mod session;
pub mod typing;

pub use activity::{ActivitySignal, ActivityTracker, HeartbeatScheduler};
pub use config::{ConnectionConfig, MessagingConfig, PresenceConfig, SyncConfig, TypingConfig};
pub use connection::{ConnectionHandle, ConnectionManager};
pub use error::SyncError;
pub use events::{EventSink, SyncEvent};
pub use messaging::{MessageSyncEngine, SendHandle};
pub use presence::PresenceChannel;
pub use session::{ChatSession, SessionHandle, SessionParts};
pub use typing::TypingCoordinator;
