//! Keyed deadline scheduling.
//!
//! [`DeadlineSet`] is the schedule/cancel primitive behind reconnect backoff
//! and delayed price-level removal. Nothing runs on its own: the owning event
//! loop sleeps until [`DeadlineSet::next_deadline`] and then drains the keys
//! whose deadline has passed. Cancelling a key removes it from the arena and
//! invalidates its index entry, so a cancelled timer can never fire.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use tokio::time::{Duration, Instant};

/// Identity of one scheduled deadline. Rescheduling a key yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

#[derive(Debug, Clone, Copy)]
struct Slot {
    deadline: Instant,
    id: TimerId,
}

#[derive(Debug)]
pub struct DeadlineSet<K> {
    slots: HashMap<K, Slot>,
    queue: BTreeMap<(Instant, TimerId), K>,
    next_id: u64,
}

impl<K> Default for DeadlineSet<K> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            queue: BTreeMap::new(),
            next_id: 0,
        }
    }
}

impl<K> DeadlineSet<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `key` to expire `delay` after `now`, replacing any deadline
    /// already pending for the same key.
    pub fn schedule(&mut self, key: K, delay: Duration, now: Instant) -> TimerId {
        self.cancel(&key);

        self.next_id = self.next_id.wrapping_add(1);
        let id = TimerId(self.next_id);
        let deadline = now + delay;
        self.queue.insert((deadline, id), key.clone());
        self.slots.insert(key, Slot { deadline, id });
        id
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        match self.slots.remove(key) {
            Some(slot) => {
                self.queue.remove(&(slot.deadline, slot.id));
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.slots.len();
        self.slots.clear();
        self.queue.clear();
        cancelled
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every key whose deadline is at or before `now`,
    /// earliest first.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let key = entry.remove();
            self.slots.remove(&key);
            expired.push(key);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
