//! Named, cancellable timers for one session.
//!
//! Timers never touch component state. A firing is delivered as a
//! [`TimerFired`] into the session loop, which passes it through
//! [`Scheduler::accept`] before acting on it. `accept` rejects firings of
//! timers that were cancelled or re-scheduled after the firing was sent, so a
//! stale timeout can never mutate state.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};

use crate::domain::{CanonicalId, ConversationKey, LocalId, SubjectId};

/// Every timer a session can own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Presence heartbeat interval.
    Heartbeat,
    /// Acknowledgment deadline of one send attempt.
    AckTimeout(LocalId),
    /// Local typing inactivity, emits `typing:stop`.
    TypingStop(ConversationKey),
    /// Remote typing indicator lifetime.
    TypingExpiry(ConversationKey, SubjectId),
    /// Grace period of buffered out-of-order mutations.
    MutationExpiry(CanonicalId),
}

/// A timer firing on its way to the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    key: TimerKey,
    id: u64,
}

struct ScheduledTask {
    id: u64,
    repeating: bool,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TaskTable {
    next_id: u64,
    tasks: HashMap<TimerKey, ScheduledTask>,
}

/// Cloneable handle to the session's timer table.
#[derive(Clone)]
pub struct Scheduler {
    table: Arc<Mutex<TaskTable>>,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
}

impl Scheduler {
    /// Create a scheduler and the receiver its firings are delivered to.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            table: Arc::new(Mutex::new(TaskTable::default())),
            fired_tx,
        };
        (scheduler, fired_rx)
    }

    fn table(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fire `key` once after `delay`, replacing any timer with the same key.
    pub fn schedule_once(&self, key: TimerKey, delay: Duration) {
        let mut table = self.table();
        let id = table.allocate_id();
        let tx = self.fired_tx.clone();
        let fired = TimerFired {
            key: key.clone(),
            id,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(fired);
        });
        table.replace(key, id, false, handle);
    }

    /// Fire `key` every `period`, first after one period.
    pub fn schedule_repeating(&self, key: TimerKey, period: Duration) {
        let mut table = self.table();
        let id = table.allocate_id();
        let tx = self.fired_tx.clone();
        let fired = TimerFired {
            key: key.clone(),
            id,
        };
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tx.send(fired.clone()).is_err() {
                    break;
                }
            }
        });
        table.replace(key, id, true, handle);
    }

    /// Cancel `key`. Returns whether it was scheduled.
    pub fn cancel(&self, key: &TimerKey) -> bool {
        match self.table().tasks.remove(key) {
            Some(task) => {
                task.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer owned by this session.
    pub fn cancel_all(&self) {
        let mut table = self.table();
        let count = table.tasks.len();
        for (_, task) in table.tasks.drain() {
            task.handle.abort();
        }
        tracing::debug!(count, "Cancelled all session timers");
    }

    pub fn is_scheduled(&self, key: &TimerKey) -> bool {
        self.table().tasks.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.table().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate a firing. Returns the key if the timer is still current.
    ///
    /// One-shot timers are removed from the table once accepted.
    pub fn accept(&self, fired: TimerFired) -> Option<TimerKey> {
        let mut table = self.table();
        let current = table
            .tasks
            .get(&fired.key)
            .map(|task| (task.id, task.repeating));
        match current {
            Some((id, repeating)) if id == fired.id => {
                if !repeating {
                    table.tasks.remove(&fired.key);
                }
                Some(fired.key)
            }
            _ => {
                tracing::trace!(key = ?fired.key, "Ignoring stale timer firing");
                None
            }
        }
    }
}

impl TaskTable {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn replace(&mut self, key: TimerKey, id: u64, repeating: bool, handle: JoinHandle<()>) {
        let task = ScheduledTask {
            id,
            repeating,
            handle,
        };
        if let Some(previous) = self.tasks.insert(key, task) {
            previous.handle.abort();
        }
    }
}
