//! Message synchronisation: optimistic sends, reconciliation and ordering.

mod buffer;
mod engine;
mod handle;
mod timeline;

pub use buffer::{Mutation, MutationBuffer};
pub use engine::MessageSyncEngine;
pub use handle::SendHandle;
pub use timeline::ConversationTimeline;
