//! Core admission controller implementation.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::clock::{Clock, MonotonicClock};
use super::key::ClientKey;
use super::policy::Policy;
use super::registry::Registry;
use super::window::WindowOutcome;
use crate::error::{Result, TurnstileError};

/// Default ceiling on the number of clients a controller tracks.
pub const DEFAULT_MAX_TRACKED_CLIENTS: usize = 10_000;
/// Default chance that an `admit` call is followed by a purge sweep.
pub const DEFAULT_PURGE_PROBABILITY: f64 = 0.01;

/// Outcome code of an admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    /// The request may proceed
    Ok,
    /// The client used up its window
    OverLimit,
    /// The client key was empty or malformed; nothing was recorded
    InvalidKey,
}

impl Code {
    /// Stable lowercase name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "ok",
            Code::OverLimit => "over_limit",
            Code::InvalidKey => "invalid_key",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The answer to one admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Outcome code
    pub code: Code,
    /// The policy's `max_requests`
    pub limit: u32,
    /// Admissions left in the window after this one (0 when rejected)
    pub remaining: u32,
    /// How long until a slot frees up (zero when admitted)
    pub retry_after: Duration,
}

impl Decision {
    fn admitted(limit: u32, remaining: u32) -> Self {
        Self {
            code: Code::Ok,
            limit,
            remaining,
            retry_after: Duration::ZERO,
        }
    }

    fn over_limit(limit: u32, retry_after_ms: u64) -> Self {
        Self {
            code: Code::OverLimit,
            limit,
            remaining: 0,
            retry_after: Duration::from_millis(retry_after_ms),
        }
    }

    fn invalid_key(limit: u32) -> Self {
        Self {
            code: Code::InvalidKey,
            limit,
            remaining: 0,
            retry_after: Duration::ZERO,
        }
    }

    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        self.code == Code::Ok
    }
}

/// Construction options for an [`AdmissionController`].
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Ceiling on tracked clients; the oldest tracked client is evicted to make room
    pub max_tracked_clients: usize,
    /// Chance in `[0, 1]` that an `admit` call triggers a purge sweep; 0 disables
    pub purge_probability: f64,
    /// Time source for [`AdmissionController::admit`]
    pub clock: Arc<dyn Clock>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            max_tracked_clients: DEFAULT_MAX_TRACKED_CLIENTS,
            purge_probability: DEFAULT_PURGE_PROBABILITY,
            clock: Arc::new(MonotonicClock::default()),
        }
    }
}

impl ControllerOptions {
    /// Use `clock` as the time source.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Set the tracked client ceiling.
    pub fn with_max_tracked_clients(mut self, max_tracked_clients: usize) -> Self {
        self.max_tracked_clients = max_tracked_clients;
        self
    }

    /// Set the per-call purge probability.
    pub fn with_purge_probability(mut self, purge_probability: f64) -> Self {
        self.purge_probability = purge_probability;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_tracked_clients == 0 {
            return Err(TurnstileError::Config(
                "max_tracked_clients must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.purge_probability) {
            return Err(TurnstileError::Config(format!(
                "purge_probability must be within [0, 1], got {}",
                self.purge_probability
            )));
        }
        Ok(())
    }
}

/// Cumulative counters and the tracked client gauge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStats {
    pub admitted: u64,
    pub rejected: u64,
    pub invalid: u64,
    pub evicted: u64,
    pub purged: u64,
    pub tracked_clients: usize,
}

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicU64,
    rejected: AtomicU64,
    invalid: AtomicU64,
    evicted: AtomicU64,
    purged: AtomicU64,
}

/// Per-client sliding-window admission controller bound to one [`Policy`].
///
/// A client is admitted while it has fewer than `max_requests` admissions in the
/// last `window`. Rejected attempts are not recorded, so a client hammering a
/// closed window does not extend its own lockout.
///
/// This struct is thread-safe and can be shared across tasks and threads. The
/// check-then-record step for a key is atomic with respect to other calls for the
/// same key.
pub struct AdmissionController {
    name: Arc<str>,
    policy: Policy,
    registry: Registry,
    clock: Arc<dyn Clock>,
    purge_probability: f64,
    counters: Counters,
}

impl AdmissionController {
    /// Create a controller enforcing `policy`.
    pub fn new(policy: Policy, options: ControllerOptions) -> Result<Self> {
        options.validate()?;

        Ok(Self {
            name: Arc::from("default"),
            policy,
            registry: Registry::new(options.max_tracked_clients),
            clock: options.clock,
            purge_probability: options.purge_probability,
            counters: Counters::default(),
        })
    }

    /// Name the controller; the name shows up in log events.
    pub fn with_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Check the request against the window at the clock's current time.
    pub fn admit(&self, key: &str) -> Decision {
        self.admit_at(key, self.clock.now_millis())
    }

    /// Check the request against the window at `now` (milliseconds).
    ///
    /// Admission records `now` for the client; rejection leaves its window as it
    /// was.
    pub fn admit_at(&self, key: &str, now: u64) -> Decision {
        let limit = self.policy.max_requests();

        if let Err(reason) = ClientKey::validate(key) {
            self.counters.invalid.fetch_add(1, Ordering::Relaxed);
            debug!(policy = %self.name, reason = %reason, "Rejected invalid client key");
            return Decision::invalid_key(limit);
        }

        let evaluation = self
            .registry
            .evaluate(key, now, self.policy.window_millis(), limit);

        if evaluation.evicted > 0 {
            self.counters
                .evicted
                .fetch_add(evaluation.evicted as u64, Ordering::Relaxed);
        }
        if evaluation.created {
            debug!(
                policy = %self.name,
                key = %key,
                tracked = self.registry.len(),
                "Tracking new client"
            );
        }

        let decision = match evaluation.outcome {
            WindowOutcome::Admitted { remaining } => {
                self.counters.admitted.fetch_add(1, Ordering::Relaxed);
                Decision::admitted(limit, remaining)
            }
            WindowOutcome::Full { retry_after_ms } => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(
                    policy = %self.name,
                    key = %key,
                    retry_after_ms = retry_after_ms,
                    "Rate limit exceeded"
                );
                Decision::over_limit(limit, retry_after_ms)
            }
        };

        trace!(
            policy = %self.name,
            key = %key,
            now = now,
            code = %decision.code,
            remaining = decision.remaining,
            "Admission decision"
        );

        self.maybe_purge(now);
        decision
    }

    /// Purge stale state at the clock's current time.
    pub fn purge(&self) -> usize {
        self.purge_at(self.clock.now_millis())
    }

    /// Drop timestamps at or before `now - window` and forget clients left with
    /// none. Returns the number of forgotten clients.
    ///
    /// Purging never changes a later decision; it only reclaims memory.
    pub fn purge_at(&self, now: u64) -> usize {
        let window_start = now.saturating_sub(self.policy.window_millis());
        let removed = self.registry.purge(window_start);

        if removed > 0 {
            self.counters
                .purged
                .fetch_add(removed as u64, Ordering::Relaxed);
            info!(
                policy = %self.name,
                removed = removed,
                active_clients = self.registry.len(),
                "Purged expired clients"
            );
        }
        removed
    }

    fn maybe_purge(&self, now: u64) {
        if self.purge_probability > 0.0 && rand::random::<f64>() < self.purge_probability {
            self.purge_at(now);
        }
    }

    /// Admissions currently counted for `key` at the clock's current time.
    ///
    /// Returns `None` if the client is not tracked.
    pub fn client_count(&self, key: &str) -> Option<usize> {
        self.count_at(key, self.clock.now_millis())
    }

    /// Admissions counted for `key` at `now`, without modifying state.
    pub fn count_at(&self, key: &str, now: u64) -> Option<usize> {
        let window_start = now.saturating_sub(self.policy.window_millis());
        self.registry.count_after(key, window_start)
    }

    /// Number of tracked clients.
    pub fn tracked_clients(&self) -> usize {
        self.registry.len()
    }

    /// The configured tracked client ceiling.
    pub fn max_tracked_clients(&self) -> usize {
        self.registry.capacity()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            invalid: self.counters.invalid.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            purged: self.counters.purged.load(Ordering::Relaxed),
            tracked_clients: self.registry.len(),
        }
    }

    /// Forget every client.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        let removed = self.registry.clear();
        debug!(policy = %self.name, removed = removed, "Cleared all clients");
    }

    /// The enforced policy.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The controller's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The controller's time source.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("tracked_clients", &self.registry.len())
            .field("max_tracked_clients", &self.registry.capacity())
            .finish()
    }
}
