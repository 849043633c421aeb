//! Retry scheduling policy.
//!
//! After a failed attempt the delivery is either dead-lettered (attempts
//! exhausted) or rescheduled `delay + jitter` from now, where the delay comes
//! from a fixed backoff table indexed by the attempt that just failed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_db::FailureDisposition;
use rand::Rng;

/// Maximum delivery attempts, initial send included.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// Backoff schedule (in seconds): 2s, 10s, 30s, 2min, 10min.
const BACKOFF_SCHEDULE_SECS: [u64; 5] = [2, 10, 30, 120, 600];

/// How long to wait between attempts and when to give up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: i32,
    schedule: Vec<Duration>,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            schedule: BACKOFF_SCHEDULE_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum attempts (at least 1).
    #[must_use]
    pub fn with_max_attempts(mut self, max: i32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    /// Replace the backoff table. The last entry repeats for later attempts.
    #[must_use]
    pub fn with_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.schedule = schedule;
        self
    }

    /// Disable jitter (deterministic delays).
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    /// Whether a delivery that just failed `attempt_number` goes to DLQ.
    #[must_use]
    pub fn is_exhausted(&self, attempt_number: i32) -> bool {
        attempt_number >= self.max_attempts
    }

    /// Table delay for the attempt that just failed, before jitter.
    #[must_use]
    pub fn base_delay(&self, attempt_number: i32) -> Duration {
        let Some(last) = self.schedule.last() else {
            return Duration::ZERO;
        };
        // attempt 1 -> index 0, clamped to the last entry
        let idx = usize::try_from(attempt_number.saturating_sub(1)).unwrap_or(0);
        self.schedule.get(idx).copied().unwrap_or(*last)
    }

    /// Delay with jitter drawn uniformly from `[0, base / 2)`.
    #[must_use]
    pub fn delay_for(&self, attempt_number: i32) -> Duration {
        let base = self.base_delay(attempt_number);
        if !self.jitter {
            return base;
        }

        let half_ms = u64::try_from(base.as_millis() / 2).unwrap_or(u64::MAX);
        if half_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..half_ms))
    }

    /// When to retry after `attempt_number` failed, or `None` when exhausted.
    #[must_use]
    pub fn next_retry_at(&self, attempt_number: i32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_exhausted(attempt_number) {
            return None;
        }
        let delay_ms = i64::try_from(self.delay_for(attempt_number).as_millis()).unwrap_or(i64::MAX);
        Some(now + chrono::Duration::milliseconds(delay_ms))
    }

    /// What to do with a row whose attempt `attempt_number` just failed.
    #[must_use]
    pub fn disposition(&self, attempt_number: i32, now: DateTime<Utc>) -> FailureDisposition {
        match self.next_retry_at(attempt_number, now) {
            Some(at) => FailureDisposition::RetryAt(at),
            None => FailureDisposition::DeadLetter,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
