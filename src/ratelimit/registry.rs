//! Bounded client registry.
//!
//! Maps client keys to their sliding windows and keeps the number of tracked
//! clients at or below a fixed ceiling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::key::ClientKey;
use super::window::{ClientWindow, WindowOutcome};

/// What happened to the registry while evaluating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Evaluation {
    pub outcome: WindowOutcome,
    /// A new record was created for the key.
    pub created: bool,
    /// Records evicted to make room for the new one.
    pub evicted: usize,
}

/// Client windows keyed by client, capped at `capacity` entries.
///
/// Locking is per DashMap shard: evaluating a key holds only that key's shard
/// lock, so unrelated clients rarely contend. The count-then-append sequence for
/// one key always runs under its shard write lock.
///
/// Capacity is enforced with slot reservations: a slot is claimed from
/// `reserved` before a record is inserted and returned after it is removed, so
/// `records.len() <= reserved <= capacity` holds at every instant.
///
/// Eviction takes the oldest inserted record still present. This approximates
/// least-recently-used order without touching shared state on every request.
/// Two callers racing to create the same key can each evict a record before one
/// of them finds the key already inserted, so a burst of new-key races may evict
/// one more client than strictly needed.
pub(crate) struct Registry {
    records: DashMap<ClientKey, ClientWindow>,
    reserved: AtomicUsize,
    capacity: usize,
    /// Insertion order as `(key, generation)`. Entries whose record was purged or
    /// replaced are skipped on eviction and dropped on compaction.
    insertion_order: Mutex<VecDeque<(ClientKey, u64)>>,
    next_generation: AtomicU64,
}

impl Registry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            records: DashMap::new(),
            reserved: AtomicUsize::new(0),
            capacity,
            insertion_order: Mutex::new(VecDeque::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tracked clients.
    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// Timestamps counted for `key` after `window_start`, if tracked.
    pub(crate) fn count_after(&self, key: &str, window_start: u64) -> Option<usize> {
        self.records
            .get(key)
            .map(|record| record.count_after(window_start))
    }

    /// Evaluate one request for `key` at `now`, creating the record if needed.
    ///
    /// `key` must already be validated.
    pub(crate) fn evaluate(
        &self,
        key: &str,
        now: u64,
        window_ms: u64,
        max_requests: u32,
    ) -> Evaluation {
        let mut evicted = 0;
        loop {
            if let Some(mut record) = self.records.get_mut(key) {
                return Evaluation {
                    outcome: record.evaluate(now, window_ms, max_requests),
                    created: false,
                    evicted,
                };
            }
            if self.reserve_slot(key, &mut evicted) {
                break;
            }
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let client = ClientKey::from_validated(key);

        let (outcome, created) = match self.records.entry(client.clone()) {
            Entry::Occupied(mut occupied) => {
                // Lost the race to another caller inserting the same key
                self.release_slots(1);
                (occupied.get_mut().evaluate(now, window_ms, max_requests), false)
            }
            Entry::Vacant(vacant) => {
                let mut record = ClientWindow::new(max_requests, generation);
                let outcome = record.evaluate(now, window_ms, max_requests);
                vacant.insert(record);
                (outcome, true)
            }
        };

        if created {
            let queued = {
                let mut order = self.insertion_order.lock();
                order.push_back((client, generation));
                order.len()
            };
            if queued > self.capacity.saturating_mul(2) {
                self.compact_order();
            }
        }

        Evaluation {
            outcome,
            created,
            evicted,
        }
    }

    /// Drop stale timestamps everywhere and remove records left empty.
    ///
    /// Returns the number of removed records.
    pub(crate) fn purge(&self, window_start: u64) -> usize {
        let mut removed = 0;
        self.records.retain(|_, record| {
            record.evict_expired(window_start);
            if record.is_empty() {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            self.release_slots(removed);
            self.compact_order();
        }
        removed
    }

    /// Remove every record. Returns the number removed.
    ///
    /// Records inserted while the sweep runs may survive it; their queue entries
    /// are kept so they stay evictable.
    pub(crate) fn clear(&self) -> usize {
        let mut removed = 0;
        self.records.retain(|_, _| {
            removed += 1;
            false
        });
        self.release_slots(removed);
        self.compact_order();
        removed
    }

    /// Claim a slot for a new record for `key`, evicting until one is free.
    ///
    /// Returns `false` without claiming when `key` shows up in the map while
    /// waiting, so the caller can evaluate the existing record instead.
    /// `evicted` accumulates the number of records evicted.
    fn reserve_slot(&self, key: &str, evicted: &mut usize) -> bool {
        loop {
            let claimed = self
                .reserved
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                    (reserved < self.capacity).then_some(reserved + 1)
                });
            if claimed.is_ok() {
                return true;
            }
            if self.records.contains_key(key) {
                return false;
            }

            if self.evict_oldest() {
                *evicted += 1;
            } else if !self.rebuild_order() {
                // Every slot belongs to an insert that has not reached the map yet
                std::thread::yield_now();
            }
        }
    }

    /// Re-queue tracked records missing from an empty eviction queue, oldest
    /// generation first. Returns whether anything was queued.
    ///
    /// Records whose queue entry is still in flight end up queued twice; the
    /// duplicate is skipped on eviction like any other stale entry.
    fn rebuild_order(&self) -> bool {
        if !self.insertion_order.lock().is_empty() {
            return true;
        }

        let mut tracked: Vec<(ClientKey, u64)> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().generation()))
            .collect();
        if tracked.is_empty() {
            return false;
        }
        tracked.sort_unstable_by_key(|(_, generation)| *generation);

        debug!(
            records = tracked.len(),
            "Rebuilt eviction queue from tracked clients"
        );
        let mut order = self.insertion_order.lock();
        let newer = std::mem::replace(&mut *order, tracked.into());
        order.extend(newer);
        true
    }

    fn release_slots(&self, count: usize) {
        self.reserved.fetch_sub(count, Ordering::AcqRel);
    }

    /// Evict the oldest inserted record that is still tracked.
    fn evict_oldest(&self) -> bool {
        loop {
            let candidate = self.insertion_order.lock().pop_front();
            let Some((key, generation)) = candidate else {
                return false;
            };

            let removed = self
                .records
                .remove_if(&key, |_, record| record.generation() == generation);
            if removed.is_some() {
                self.release_slots(1);
                debug!(key = %key, "Evicted client to stay under the tracked client ceiling");
                return true;
            }
        }
    }

    /// Drop queue entries whose record is gone or was replaced.
    ///
    /// The queue is detached while it is filtered so that no registry shard lock
    /// is taken with the queue lock held.
    fn compact_order(&self) {
        let detached = std::mem::take(&mut *self.insertion_order.lock());
        let live: VecDeque<_> = detached
            .into_iter()
            .filter(|(key, generation)| {
                self.records
                    .get(key)
                    .is_some_and(|record| record.generation() == *generation)
            })
            .collect();

        let mut order = self.insertion_order.lock();
        let newer = std::mem::replace(&mut *order, live);
        order.extend(newer);
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.insertion_order.lock().len()
    }
}
