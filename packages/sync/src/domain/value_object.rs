//! Value objects: identifiers and timestamps used throughout the sync core.
//!
//! Identifiers are opaque, non-empty strings with a length limit. They are
//! validated once at the boundary (DTO conversion, public API) and are
//! infallible to use afterwards.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Maximum identifier length accepted from the wire.
pub const MAX_ID_LEN: usize = 256;

/// Validation errors for value objects
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueObjectError {
    #[error("{kind} must not be empty")]
    Empty { kind: &'static str },

    #[error("{kind} exceeds {max} characters (got {len})")]
    TooLong {
        kind: &'static str,
        len: usize,
        max: usize,
    },
}

fn validate_id(kind: &'static str, value: &str) -> Result<(), ValueObjectError> {
    if value.trim().is_empty() {
        return Err(ValueObjectError::Empty { kind });
    }
    let len = value.chars().count();
    if len > MAX_ID_LEN {
        return Err(ValueObjectError::TooLong {
            kind,
            len,
            max: MAX_ID_LEN,
        });
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, ValueObjectError> {
                let value = value.into();
                validate_id($kind, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ValueObjectError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = ValueObjectError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// A user whose presence and messages this client observes.
    SubjectId,
    "subject id"
);

string_id!(
    /// Server-assigned message identity. Unique per message across conversations.
    CanonicalId,
    "canonical id"
);

string_id!(
    /// Client-generated identity of one send attempt, stable until confirmed.
    LocalId,
    "local id"
);

string_id!(
    /// Identifies a conversation timeline.
    ///
    /// `group:<id>` and `thread:<parent message id>` keys address group and
    /// thread conversations; anything else is a direct conversation.
    ConversationKey,
    "conversation key"
);

impl LocalId {
    /// Generate a fresh random local id.
    pub fn generate() -> Self {
        Self(format!("local-{}", Uuid::new_v4()))
    }
}

const GROUP_PREFIX: &str = "group:";
const THREAD_PREFIX: &str = "thread:";

/// How a conversation key routes outbound traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKind<'a> {
    Direct,
    Group(&'a str),
    Thread(&'a str),
}

impl ConversationKey {
    pub fn group(group_id: &str) -> Result<Self, ValueObjectError> {
        validate_id("group id", group_id)?;
        Self::new(format!("{GROUP_PREFIX}{group_id}"))
    }

    pub fn thread(parent: &CanonicalId) -> Result<Self, ValueObjectError> {
        Self::new(format!("{THREAD_PREFIX}{parent}"))
    }

    pub fn kind(&self) -> ConversationKind<'_> {
        if let Some(group) = self.0.strip_prefix(GROUP_PREFIX).filter(|g| !g.is_empty()) {
            ConversationKind::Group(group)
        } else if let Some(parent) = self.0.strip_prefix(THREAD_PREFIX).filter(|p| !p.is_empty()) {
            ConversationKind::Thread(parent)
        } else {
            ConversationKind::Direct
        }
    }
}

/// Unix timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn new(millis: i64) -> Self {
        Self(millis)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// Milliseconds elapsed from `earlier` to `self`, saturating at zero.
    pub fn millis_since(&self, earlier: Timestamp) -> u64 {
        u64::try_from(self.0.saturating_sub(earlier.0)).unwrap_or(0)
    }

    pub fn plus_millis(&self, millis: u64) -> Timestamp {
        let millis = i64::try_from(millis).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_add(millis))
    }
}
