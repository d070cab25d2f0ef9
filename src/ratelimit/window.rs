//! Per-client sliding window of admission timestamps.

use std::collections::VecDeque;

/// Upper bound on the slots allocated up front for a new window.
const INITIAL_SLOTS: usize = 8;

/// Result of evaluating one request against a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WindowOutcome {
    /// The request was recorded; `remaining` more fit in the window.
    Admitted { remaining: u32 },
    /// The window is full; the oldest counted request expires in `retry_after_ms`.
    Full { retry_after_ms: u64 },
}

/// Timestamps (milliseconds) of the admissions a client made inside the current
/// window, oldest first.
///
/// The window never holds more than `max_requests` entries: a request is only
/// recorded when there is room for it, so memory per client is bounded no matter
/// how fast the client calls.
#[derive(Debug)]
pub(crate) struct ClientWindow {
    timestamps: VecDeque<u64>,
    /// Registry insertion sequence number, used to recognise this exact record
    /// when it is picked for eviction.
    generation: u64,
}

impl ClientWindow {
    pub(crate) fn new(max_requests: u32, generation: u64) -> Self {
        let slots = (max_requests as usize).min(INITIAL_SLOTS);
        Self {
            timestamps: VecDeque::with_capacity(slots),
            generation,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Oldest counted timestamp.
    pub(crate) fn oldest(&self) -> Option<u64> {
        self.timestamps.front().copied()
    }

    /// Drop every timestamp `t <= window_start`. Returns how many were dropped.
    pub(crate) fn evict_expired(&mut self, window_start: u64) -> usize {
        let mut dropped = 0;
        while let Some(&front) = self.timestamps.front() {
            if front > window_start {
                break;
            }
            self.timestamps.pop_front();
            dropped += 1;
        }
        dropped
    }

    /// Number of timestamps strictly after `window_start`, without mutating.
    pub(crate) fn count_after(&self, window_start: u64) -> usize {
        let expired = self
            .timestamps
            .iter()
            .take_while(|&&t| t <= window_start)
            .count();
        self.timestamps.len() - expired
    }

    /// Age out stale entries, then record `now` if there is room.
    pub(crate) fn evaluate(&mut self, now: u64, window_ms: u64, max_requests: u32) -> WindowOutcome {
        self.evict_expired(now.saturating_sub(window_ms));

        let count = self.timestamps.len();
        if count >= max_requests as usize {
            // Window is full, so it is non-empty
            let oldest = self.oldest().unwrap_or(now);
            return WindowOutcome::Full {
                retry_after_ms: oldest.saturating_add(window_ms).saturating_sub(now),
            };
        }

        self.insert(now);
        WindowOutcome::Admitted {
            remaining: max_requests - count as u32 - 1,
        }
    }

    /// Insert keeping the deque sorted. `now` is almost always the newest value,
    /// so the scan from the back stops immediately; it only walks further when the
    /// clock stepped backwards.
    fn insert(&mut self, now: u64) {
        let mut idx = self.timestamps.len();
        while idx > 0 && self.timestamps[idx - 1] > now {
            idx -= 1;
        }
        self.timestamps.insert(idx, now);
    }
}
