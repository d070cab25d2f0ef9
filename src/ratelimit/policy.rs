//! Admission policies: how many requests a client may make per window.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Time unit for policy windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// One second
    Second,
    /// One minute
    Minute,
    /// One hour
    Hour,
    /// One day
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }

    /// Duration of `units` consecutive units.
    pub fn times(&self, units: u32) -> Duration {
        self.duration().saturating_mul(units)
    }
}

/// An immutable `(window, max_requests)` pair.
///
/// A client is admitted while it has fewer than `max_requests` admissions whose
/// timestamps fall strictly after `now - window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Policy {
    window: Duration,
    window_ms: u64,
    max_requests: u32,
}

impl Policy {
    /// Create a validated policy.
    ///
    /// Windows are tracked at millisecond resolution, so the window must be at
    /// least one millisecond long.
    pub fn new(window: Duration, max_requests: u32) -> Result<Self> {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        if window_ms == 0 {
            return Err(TurnstileError::InvalidPolicy(format!(
                "window must be at least 1ms, got {:?}",
                window
            )));
        }
        if max_requests == 0 {
            return Err(TurnstileError::InvalidPolicy(
                "max_requests must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            window: Duration::from_millis(window_ms),
            window_ms,
            max_requests,
        })
    }

    /// Shorthand for `max_requests` per `units` of `unit`.
    pub fn per(max_requests: u32, units: u32, unit: TimeUnit) -> Result<Self> {
        Self::new(unit.times(units), max_requests)
    }

    /// The sliding window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// The sliding window length in milliseconds.
    pub fn window_millis(&self) -> u64 {
        self.window_ms
    }

    /// Maximum admissions per window.
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} requests / {:?}", self.max_requests, self.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
        assert_eq!(TimeUnit::Minute.times(15), Duration::from_secs(900));
    }

    #[test]
    fn test_policy_creation() {
        let policy = Policy::new(Duration::from_secs(900), 100).unwrap();
        assert_eq!(policy.window(), Duration::from_secs(900));
        assert_eq!(policy.window_millis(), 900_000);
        assert_eq!(policy.max_requests(), 100);
    }

    #[test]
    fn test_policy_per_unit() {
        let policy = Policy::per(10, 15, TimeUnit::Minute).unwrap();
        assert_eq!(policy.window_millis(), 15 * 60 * 1000);
        assert_eq!(policy.max_requests(), 10);
    }

    #[test]
    fn test_policy_rejects_zero_window() {
        let err = Policy::new(Duration::ZERO, 10).unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidPolicy(_)));

        // Sub-millisecond windows collapse to zero
        assert!(Policy::new(Duration::from_micros(999), 10).is_err());
        assert!(Policy::per(10, 0, TimeUnit::Second).is_err());
    }

    #[test]
    fn test_policy_rejects_zero_limit() {
        let err = Policy::new(Duration::from_secs(1), 0).unwrap_err();
        assert!(matches!(err, TurnstileError::InvalidPolicy(_)));
    }

    #[test]
    fn test_time_unit_deserialize() {
        let unit: TimeUnit = serde_yaml::from_str("minute").unwrap();
        assert_eq!(unit, TimeUnit::Minute);
        assert!(serde_yaml::from_str::<TimeUnit>("fortnight").is_err());
    }
}
