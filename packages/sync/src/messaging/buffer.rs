//! Mutations that arrived before the message they target.

use std::collections::HashMap;

use crate::domain::{CanonicalId, DeleteScope, SubjectId, TimelineEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Edit(String),
    Delete(DeleteScope),
    ReadByPeer,
    Reaction {
        emoji: String,
        subject: SubjectId,
        added: bool,
    },
    ReplyCount(u32),
}

impl Mutation {
    /// Returns whether the entry changed.
    pub fn apply(self, entry: &mut TimelineEntry) -> bool {
        match self {
            Mutation::Edit(content) => {
                let before = (entry.content.clone(), entry.edited);
                entry.apply_edit(content);
                before != (entry.content.clone(), entry.edited)
            }
            Mutation::Delete(scope) => {
                let before = entry.deleted;
                entry.apply_delete(scope);
                before != entry.deleted
            }
            Mutation::ReadByPeer => !std::mem::replace(&mut entry.read_by_peer, true),
            Mutation::Reaction {
                emoji,
                subject,
                added,
            } => entry.apply_reaction(&emoji, &subject, added),
            Mutation::ReplyCount(count) => {
                std::mem::replace(&mut entry.reply_count, count) != count
            }
        }
    }
}

/// Held mutations per canonical id, replayed in arrival order.
#[derive(Debug, Default)]
pub struct MutationBuffer {
    held: HashMap<CanonicalId, Vec<Mutation>>,
}

impl MutationBuffer {
    /// Returns `true` for the first mutation held for `id`, when the caller
    /// should start its grace timer.
    pub fn hold(&mut self, id: CanonicalId, mutation: Mutation) -> bool {
        let held = self.held.entry(id).or_default();
        held.push(mutation);
        held.len() == 1
    }

    pub fn take(&mut self, id: &CanonicalId) -> Vec<Mutation> {
        self.held.remove(id).unwrap_or_default()
    }

    /// Drop what is still held for `id` after its grace period.
    pub fn expire(&mut self, id: &CanonicalId) -> usize {
        self.held.remove(id).map_or(0, |held| held.len())
    }

    pub fn len(&self) -> usize {
        self.held.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
