//! Background retry worker.
//!
//! Each cycle claims the Failed deliveries that are due, retries them
//! concurrently through per-subscriber circuit breakers, then runs
//! housekeeping: purging old successes, promoting exhausted rows to the dead
//! letter queue, and recovering stalled rows. Cycles repeat on a fixed
//! interval until the cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier_db::{Delivery, RetryClaim};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::circuit_breaker::{
    CallVerdict, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitError,
};
use crate::error::WebhookError;
use crate::services::dispatcher::{DispatchOutcome, WebhookDispatcher};

/// Tuning for the retry worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between cycles.
    pub poll_interval: Duration,
    /// Sleep after a cycle that failed unexpectedly.
    pub error_cooldown: Duration,
    /// Maximum deliveries claimed per cycle.
    pub batch_size: i64,
    /// Success rows older than this are purged.
    pub success_retention: Duration,
    pub purge_batch_size: i64,
    pub dlq_batch_size: i64,
    /// How long a claim is held before another worker may take the row.
    pub lease_duration: Duration,
    /// Pending rows older than this are treated as stalled.
    pub stall_threshold: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            error_cooldown: Duration::from_secs(30),
            batch_size: 100,
            success_retention: Duration::from_secs(30 * 24 * 60 * 60),
            purge_batch_size: 1000,
            dlq_batch_size: 100,
            lease_duration: Duration::from_secs(120),
            stall_threshold: Duration::from_secs(300),
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_error_cooldown(mut self, cooldown: Duration) -> Self {
        self.error_cooldown = cooldown;
        self
    }

    /// Set the claim batch size (at least 1).
    #[must_use]
    pub fn with_batch_size(mut self, size: i64) -> Self {
        self.batch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_success_retention(mut self, retention: Duration) -> Self {
        self.success_retention = retention;
        self
    }

    #[must_use]
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    #[must_use]
    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }
}

/// Counts from one worker cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub delivered: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    pub abandoned: usize,
    /// Rows that changed before the retry started.
    pub not_eligible: usize,
    /// Rows skipped because the subscriber's circuit was open.
    pub circuit_open: usize,
    pub errors: usize,
    pub purged: u64,
    pub promoted: u64,
    pub recovered: u64,
}

impl CycleReport {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Delivered => self.delivered += 1,
            DispatchOutcome::RetryScheduled => self.rescheduled += 1,
            DispatchOutcome::DeadLettered => self.dead_lettered += 1,
            DispatchOutcome::Abandoned => self.abandoned += 1,
            DispatchOutcome::NotEligible | DispatchOutcome::AlreadyDispatched => {
                self.not_eligible += 1;
            }
        }
    }
}

/// Failure of a retry as seen by the circuit breaker.
#[derive(Debug, thiserror::Error)]
enum RetryAttemptError {
    #[error("delivery attempt failed ({0:?})")]
    Undelivered(DispatchOutcome),

    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

enum RetryResult {
    Outcome(DispatchOutcome),
    CircuitOpen,
    Error,
}

/// Background worker that retries failed deliveries.
pub struct WebhookWorker {
    dispatcher: WebhookDispatcher,
    breakers: CircuitBreakerRegistry,
    config: WorkerConfig,
    instance_id: Uuid,
}

/// Running worker. Dropping it leaves the task running; call [`stop`](Self::stop).
pub struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal cancellation and wait for the current cycle to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            tracing::error!(target: "webhook_worker", error = %e, "Webhook worker task failed");
        }
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl WebhookWorker {
    #[must_use]
    pub fn new(dispatcher: WebhookDispatcher, config: WorkerConfig) -> Self {
        Self {
            dispatcher,
            breakers: CircuitBreakerRegistry::new(CircuitBreakerConfig::default()),
            config,
            instance_id: Uuid::new_v4(),
        }
    }

    #[must_use]
    pub fn with_circuit_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breakers = CircuitBreakerRegistry::new(config);
        self
    }

    /// Lease owner id written to claimed rows.
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Spawn the worker loop.
    #[must_use]
    pub fn start(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let worker = Arc::new(self);
        let join = tokio::spawn(async move { worker.run(token).await });
        WorkerHandle { cancel, join }
    }

    /// Run cycles until `cancel` fires. Cancellation is observed between
    /// cycles and while sleeping, never during a cycle.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            target: "webhook_worker",
            instance_id = %self.instance_id,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Webhook retry worker started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let pause = match self.run_cycle().await {
                Ok(report) => {
                    if report != CycleReport::default() {
                        tracing::info!(
                            target: "webhook_worker",
                            claimed = report.claimed,
                            delivered = report.delivered,
                            rescheduled = report.rescheduled,
                            dead_lettered = report.dead_lettered,
                            abandoned = report.abandoned,
                            circuit_open = report.circuit_open,
                            errors = report.errors,
                            purged = report.purged,
                            promoted = report.promoted,
                            recovered = report.recovered,
                            "Retry cycle complete"
                        );
                    }
                    self.config.poll_interval
                }
                Err(e) => {
                    tracing::error!(
                        target: "webhook_worker",
                        error = %e,
                        cooldown_secs = self.config.error_cooldown.as_secs(),
                        "Retry cycle failed"
                    );
                    self.config.error_cooldown
                }
            };

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!(
            target: "webhook_worker",
            instance_id = %self.instance_id,
            "Webhook retry worker stopped"
        );
    }

    /// One claim, retry, and housekeeping pass.
    pub async fn run_cycle(&self) -> Result<CycleReport, WebhookError> {
        let store = self.dispatcher.store();
        let max_attempts = self.dispatcher.retry_policy().max_attempts();
        let mut report = CycleReport::default();

        let now = Utc::now();
        let claimed = store
            .claim_due_retries(RetryClaim {
                now,
                max_attempts,
                limit: self.config.batch_size,
                owner: self.instance_id,
                lease_until: now + to_chrono(self.config.lease_duration),
            })
            .await?;
        report.claimed = claimed.len();

        let results = join_all(claimed.iter().map(|d| self.retry_one(d))).await;
        for result in results {
            match result {
                RetryResult::Outcome(outcome) => report.record(outcome),
                RetryResult::CircuitOpen => report.circuit_open += 1,
                RetryResult::Error => report.errors += 1,
            }
        }

        let cutoff = Utc::now() - to_chrono(self.config.success_retention);
        loop {
            let purged = store
                .purge_succeeded_before(cutoff, self.config.purge_batch_size)
                .await?;
            report.purged += purged;
            if purged < batch_len(self.config.purge_batch_size) {
                break;
            }
        }

        loop {
            let promoted = store
                .promote_exhausted_to_dlq(max_attempts, self.config.dlq_batch_size)
                .await?;
            report.promoted += promoted;
            if promoted < batch_len(self.config.dlq_batch_size) {
                break;
            }
        }

        let now = Utc::now();
        report.recovered = store
            .recover_stalled(
                now,
                now - to_chrono(self.config.stall_threshold),
                max_attempts,
                self.config.batch_size,
            )
            .await?;
        if report.recovered > 0 {
            tracing::warn!(
                target: "webhook_worker",
                count = report.recovered,
                "Recovered stalled deliveries"
            );
        }

        Ok(report)
    }

    async fn retry_one(&self, delivery: &Delivery) -> RetryResult {
        let owner = self.instance_id;
        let breaker = self.breakers.get(delivery.subscriber_id);

        let result = breaker
            .call_with(
                || async {
                    match self.dispatcher.process_retry(delivery, Some(owner)).await? {
                        outcome if outcome.is_failed_attempt() => {
                            Err(RetryAttemptError::Undelivered(outcome))
                        }
                        outcome => Ok::<_, RetryAttemptError>(outcome),
                    }
                },
                |result| match result {
                    Ok(outcome) if !outcome.reached_destination() => CallVerdict::Neutral,
                    Ok(_) => CallVerdict::Success,
                    Err(_) => CallVerdict::Failure,
                },
            )
            .await;

        match result {
            Ok(outcome) => RetryResult::Outcome(outcome),
            Err(CircuitError::Inner(RetryAttemptError::Undelivered(outcome))) => {
                RetryResult::Outcome(outcome)
            }
            Err(CircuitError::Inner(RetryAttemptError::Webhook(e))) => {
                tracing::error!(
                    target: "webhook_worker",
                    delivery_id = %delivery.id,
                    error = %e,
                    "Retry attempt could not be recorded"
                );
                RetryResult::Error
            }
            Err(CircuitError::Open) => {
                tracing::debug!(
                    target: "webhook_worker",
                    delivery_id = %delivery.id,
                    subscriber_id = %delivery.subscriber_id,
                    "Circuit open, skipping retry"
                );
                if let Err(e) = self
                    .dispatcher
                    .store()
                    .release_claim(delivery.id, owner)
                    .await
                {
                    tracing::warn!(
                        target: "webhook_worker",
                        delivery_id = %delivery.id,
                        error = %e,
                        "Failed to release claim"
                    );
                }
                RetryResult::CircuitOpen
            }
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn batch_len(limit: i64) -> u64 {
    u64::try_from(limit.max(1)).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.error_cooldown, Duration::from_secs(30));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.success_retention, Duration::from_secs(2_592_000));
        assert_eq!(config.purge_batch_size, 1000);
        assert_eq!(config.dlq_batch_size, 100);
        assert_eq!(config.lease_duration, Duration::from_secs(120));
        assert_eq!(config.stall_threshold, Duration::from_secs(300));
    }

    #[test]
    fn test_batch_size_floor() {
        assert_eq!(WorkerConfig::default().with_batch_size(0).batch_size, 1);
    }

    #[test]
    fn test_report_records_outcomes() {
        let mut report = CycleReport::default();
        report.record(DispatchOutcome::Delivered);
        report.record(DispatchOutcome::RetryScheduled);
        report.record(DispatchOutcome::DeadLettered);
        report.record(DispatchOutcome::NotEligible);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.rescheduled, 1);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.not_eligible, 1);
    }
}
