//! Per-conversation timeline storage.

use std::collections::HashSet;

use crate::domain::{CanonicalId, LocalId, TimelineEntry};

/// Confirmed entries in server order, followed by unconfirmed local echoes in
/// submission order.
///
/// Insertion walks back from the tail, so an in-order arrival costs O(1) and
/// a late confirmation only shifts the entries it lands behind.
#[derive(Debug, Default, Clone)]
pub struct ConversationTimeline {
    confirmed: Vec<TimelineEntry>,
    unconfirmed: Vec<TimelineEntry>,
    ids: HashSet<CanonicalId>,
}

impl ConversationTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.confirmed.len() + self.unconfirmed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> impl Iterator<Item = &TimelineEntry> {
        self.confirmed.iter().chain(self.unconfirmed.iter())
    }

    pub fn snapshot(&self) -> Vec<TimelineEntry> {
        self.entries().cloned().collect()
    }

    pub fn contains(&self, id: &CanonicalId) -> bool {
        self.ids.contains(id)
    }

    /// Oldest confirmed entry, the cursor for the next history page.
    pub fn oldest(&self) -> Option<&CanonicalId> {
        self.confirmed.first().and_then(TimelineEntry::canonical_id)
    }

    pub fn push_unconfirmed(&mut self, entry: TimelineEntry) {
        self.unconfirmed.push(entry);
    }

    /// Insert a confirmed entry at its server position. Returns `false`
    /// (and drops the entry) when the canonical id is already present.
    pub fn insert_confirmed(&mut self, entry: TimelineEntry) -> bool {
        let Some(id) = entry.canonical_id().cloned() else {
            return false;
        };
        if self.ids.contains(&id) {
            return false;
        }
        let index = {
            let key = entry.order_key();
            let mut index = self.confirmed.len();
            while index > 0 && self.confirmed[index - 1].order_key() > key {
                index -= 1;
            }
            index
        };
        self.confirmed.insert(index, entry);
        self.ids.insert(id);
        true
    }

    pub fn get(&self, id: &CanonicalId) -> Option<&TimelineEntry> {
        if !self.ids.contains(id) {
            return None;
        }
        self.confirmed
            .iter()
            .rev()
            .find(|entry| entry.canonical_id() == Some(id))
    }

    pub fn get_mut(&mut self, id: &CanonicalId) -> Option<&mut TimelineEntry> {
        if !self.ids.contains(id) {
            return None;
        }
        self.confirmed
            .iter_mut()
            .rev()
            .find(|entry| entry.canonical_id() == Some(id))
    }

    pub fn unconfirmed(&self, local_id: &LocalId) -> Option<&TimelineEntry> {
        self.unconfirmed
            .iter()
            .find(|entry| entry.local_id() == Some(local_id))
    }

    pub fn unconfirmed_mut(&mut self, local_id: &LocalId) -> Option<&mut TimelineEntry> {
        self.unconfirmed
            .iter_mut()
            .find(|entry| entry.local_id() == Some(local_id))
    }

    pub fn take_unconfirmed(&mut self, local_id: &LocalId) -> Option<TimelineEntry> {
        let index = self
            .unconfirmed
            .iter()
            .position(|entry| entry.local_id() == Some(local_id))?;
        Some(self.unconfirmed.remove(index))
    }

    pub fn unconfirmed_entries(&self) -> &[TimelineEntry] {
        &self.unconfirmed
    }
}
