//! Circuit breaker pattern implementation for webhook delivery.
//!
//! Protects failing destinations by counting consecutive failures and
//! rejecting calls outright once the threshold is reached. After the open
//! timeout a single trial call is let through; its outcome closes or reopens
//! the circuit.
//!
//! The breaker wraps any async operation via [`CircuitBreaker::call`]. The
//! [`CircuitBreakerRegistry`] holds one breaker per subscriber for the
//! lifetime of the retry worker.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls proceed.
    #[default]
    Closed,
    /// Circuit tripped - calls rejected immediately.
    Open,
    /// Testing recovery - one trial call in flight.
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Time since the last failure before a trial call is allowed.
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure threshold (at least 1).
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

/// Result of a call through the breaker.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Rejected without invoking the operation.
    #[error("circuit breaker is open")]
    Open,

    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

/// How a finished call counts toward the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallVerdict {
    Success,
    Failure,
    /// The call never reached the destination. A half-open trial slot is
    /// handed back without changing state.
    Neutral,
}

impl<E> CircuitError<E> {
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open)
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    /// Monotonic stamp driving the open timeout.
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// Point-in-time view of a breaker for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Circuit breaker for a single destination.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Clears the trial flag if the trial future is dropped before finishing.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    #[must_use]
    pub fn status(&self) -> CircuitBreakerStatus {
        let s = self.lock();
        CircuitBreakerStatus {
            state: s.state,
            failure_count: s.failure_count,
            failure_threshold: self.config.failure_threshold,
            last_failure_at: s.last_failure_at,
            last_success_at: s.last_success_at,
            opened_at: s.opened_at,
        }
    }

    /// Run `op` through the breaker.
    ///
    /// `Ok` from the operation counts as a success, `Err` as a failure.
    /// Returns [`CircuitError::Open`] without running `op` while the circuit
    /// is open, or while a half-open trial is already in flight.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with(op, |result| {
            if result.is_ok() {
                CallVerdict::Success
            } else {
                CallVerdict::Failure
            }
        })
        .await
    }

    /// Like [`call`](Self::call), with `classify` deciding how the result
    /// counts.
    pub async fn call_with<F, Fut, T, E, C>(
        &self,
        op: F,
        classify: C,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&Result<T, E>) -> CallVerdict,
    {
        let is_trial = self.try_acquire().ok_or(CircuitError::Open)?;
        let mut guard = TrialGuard {
            breaker: self,
            armed: is_trial,
        };

        let result = op().await;
        guard.armed = false;

        match classify(&result) {
            CallVerdict::Success => self.record_success(),
            CallVerdict::Failure => self.record_failure(),
            CallVerdict::Neutral => {
                if is_trial {
                    self.lock().trial_in_flight = false;
                }
            }
        }
        result.map_err(CircuitError::Inner)
    }

    /// `Some(is_trial)` when the call may proceed.
    fn try_acquire(&self) -> Option<bool> {
        let mut s = self.lock();
        match s.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                let timed_out = s
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.config.open_timeout);
                if !timed_out {
                    return None;
                }
                s.state = CircuitState::HalfOpen;
                s.trial_in_flight = true;
                tracing::info!(
                    target: "circuit_breaker",
                    breaker = %self.name,
                    "Circuit breaker transitioning to half-open for trial call"
                );
                Some(true)
            }
            CircuitState::HalfOpen => {
                if s.trial_in_flight {
                    None
                } else {
                    s.trial_in_flight = true;
                    Some(true)
                }
            }
        }
    }

    fn record_success(&self) {
        let mut s = self.lock();
        s.last_success_at = Some(Utc::now());

        match s.state {
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late.
                tracing::debug!(
                    target: "circuit_breaker",
                    breaker = %self.name,
                    "Ignoring late success while circuit is open"
                );
            }
            CircuitState::HalfOpen => {
                s.state = CircuitState::Closed;
                s.failure_count = 0;
                s.trial_in_flight = false;
                s.opened_at = None;
                tracing::info!(
                    target: "circuit_breaker",
                    breaker = %self.name,
                    "Circuit breaker closed after successful trial"
                );
            }
            CircuitState::Closed => {
                s.failure_count = 0;
            }
        }
    }

    fn record_failure(&self) {
        let mut s = self.lock();
        s.failure_count = s.failure_count.saturating_add(1);
        s.last_failure = Some(Instant::now());
        s.last_failure_at = Some(Utc::now());
        s.trial_in_flight = false;

        if s.state != CircuitState::Open && s.failure_count >= self.config.failure_threshold {
            let reopened = s.state == CircuitState::HalfOpen;
            s.state = CircuitState::Open;
            s.opened_at = s.last_failure_at;
            if reopened {
                tracing::warn!(
                    target: "circuit_breaker",
                    breaker = %self.name,
                    "Circuit breaker reopened after failed trial"
                );
            } else {
                tracing::warn!(
                    target: "circuit_breaker",
                    breaker = %self.name,
                    failure_count = s.failure_count,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker opened due to consecutive failures"
                );
            }
        }
    }
}

/// One breaker per destination (subscriber id).
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<Uuid, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Get or create the breaker for a destination.
    #[must_use]
    pub fn get(&self, destination: Uuid) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(destination)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    destination.to_string(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Status of an existing breaker. `None` if the destination was never called.
    #[must_use]
    pub fn status(&self, destination: Uuid) -> Option<CircuitBreakerStatus> {
        self.breakers.get(&destination).map(|cb| cb.status())
    }

    /// Status of every breaker.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(Uuid, CircuitBreakerStatus)> {
        self.breakers
            .iter()
            .map(|entry| (*entry.key(), entry.value().status()))
            .collect()
    }

    /// Drop a destination's breaker (e.g. after the subscriber is deactivated).
    pub fn remove(&self, destination: Uuid) {
        self.breakers.remove(&destination);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
