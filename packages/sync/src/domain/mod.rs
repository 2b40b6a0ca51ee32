//! Domain layer: value objects, entities and collaborator interfaces.

pub mod connection_state;
pub mod message;
pub mod presence;
pub mod repository;
pub mod value_object;

pub use connection_state::ConnectionState;
pub use message::{
    Attachment, DeleteScope, DeliveryState, EntryIdentity, IncomingMessage, OrderKey,
    TimelineEntry,
};
pub use presence::{PresenceRecord, PresenceStatus, PresenceView};
pub use repository::{
    CredentialProvider, HistoryPage, HistoryRepository, NoopPresenceStore, PresenceStore,
    StaticCredential,
};
pub use value_object::{
    CanonicalId, ConversationKey, ConversationKind, LocalId, SubjectId, Timestamp,
    ValueObjectError,
};

#[cfg(test)]
pub use repository::{MockCredentialProvider, MockHistoryRepository, MockPresenceStore};
