//! REST adapters for the out-of-band collaborators.

mod history;
mod presence_store;

pub use history::HttpHistoryRepository;
pub use presence_store::HttpPresenceStore;
