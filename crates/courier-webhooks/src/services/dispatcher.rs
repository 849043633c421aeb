//! Webhook delivery execution.
//!
//! Creates the delivery row for an (event, subscriber) pair, signs and POSTs
//! the payload, and records the outcome. Failed attempts are scheduled for
//! retry or moved to the dead letter queue according to the [`RetryPolicy`].
//!
//! The unique (event, subscriber) row is the replay guard: dispatching a
//! pair that already has a row is a no-op.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use courier_db::{
    truncate_error, Delivery, DeliveryFailure, DeliverySuccess, Event, FailureDisposition, Store,
    Subscriber,
};
use futures::future::join_all;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use uuid::Uuid;

use crate::crypto::SecretCipher;
use crate::error::WebhookError;
use crate::retry::RetryPolicy;
use crate::signature::{SignatureHeader, EVENT_ID_HEADER, SIGNATURE_HEADER};

/// Per-attempt HTTP timeout.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a started retry owns its row before stalled recovery may reclaim it.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(120);

const USER_AGENT: &str = "courier-webhooks/1.0";

/// What a dispatch or retry call did with the delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The pair already had a delivery row. Nothing was sent.
    AlreadyDispatched,
    /// The row was not in a retryable state (changed under us). Nothing was sent.
    NotEligible,
    /// 2xx received.
    Delivered,
    /// Attempt failed; a retry is scheduled.
    RetryScheduled,
    /// Attempt failed and attempts are exhausted.
    DeadLettered,
    /// Nothing left to send to (event or subscriber gone or inactive).
    Abandoned,
}

impl DispatchOutcome {
    /// Whether an HTTP attempt was made and did not succeed.
    #[must_use]
    pub fn is_failed_attempt(self) -> bool {
        matches!(self, Self::RetryScheduled | Self::DeadLettered)
    }

    /// Whether the call got as far as attempting the destination.
    #[must_use]
    pub fn reached_destination(self) -> bool {
        matches!(self, Self::Delivered | Self::RetryScheduled | Self::DeadLettered)
    }
}

/// Signs, sends, and records webhook deliveries.
#[derive(Clone)]
pub struct WebhookDispatcher {
    store: Arc<dyn Store>,
    cipher: SecretCipher,
    http_client: Client,
    retry_policy: RetryPolicy,
    timeout: Duration,
    lease_duration: Duration,
}

impl WebhookDispatcher {
    /// Create a dispatcher with a shared HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `WebhookError::Internal` if the HTTP client cannot be built.
    pub fn new(store: Arc<dyn Store>, cipher: SecretCipher) -> Result<Self, WebhookError> {
        let http_client = Client::builder()
            .timeout(DEFAULT_DELIVERY_TIMEOUT)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| WebhookError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            store,
            cipher,
            http_client,
            retry_policy: RetryPolicy::default(),
            timeout: DEFAULT_DELIVERY_TIMEOUT,
            lease_duration: DEFAULT_LEASE_DURATION,
        })
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the per-attempt HTTP timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// First delivery of `event` to `subscriber`.
    pub async fn dispatch(
        &self,
        event: &Event,
        subscriber: &Subscriber,
    ) -> Result<DispatchOutcome, WebhookError> {
        let Some(delivery) = self.store.create_delivery(event.id, subscriber.id).await? else {
            tracing::debug!(
                target: "webhook_delivery",
                event_id = %event.id,
                subscriber_id = %subscriber.id,
                "Delivery already exists for pair, skipping"
            );
            return Ok(DispatchOutcome::AlreadyDispatched);
        };

        self.attempt(&delivery, event, subscriber).await
    }

    /// Dispatch `event` to every subscriber concurrently.
    ///
    /// One subscriber's failure does not affect the others.
    pub async fn dispatch_all(
        &self,
        event: &Event,
        subscribers: &[Subscriber],
    ) -> Vec<(Uuid, Result<DispatchOutcome, WebhookError>)> {
        let sends = subscribers.iter().map(|sub| async move {
            let result = self.dispatch(event, sub).await;
            if let Err(ref e) = result {
                tracing::error!(
                    target: "webhook_delivery",
                    event_id = %event.id,
                    subscriber_id = %sub.id,
                    error = %e,
                    "Failed to dispatch event to subscriber"
                );
            }
            (sub.id, result)
        });
        join_all(sends).await
    }

    /// Run the next attempt of a Failed delivery.
    ///
    /// `owner` is the caller's lease id when the row was claimed by a worker.
    pub async fn process_retry(
        &self,
        delivery: &Delivery,
        owner: Option<Uuid>,
    ) -> Result<DispatchOutcome, WebhookError> {
        let now = Utc::now();
        let lease_until = now + chrono_duration(self.lease_duration);

        let Some(current) = self
            .store
            .begin_retry(
                delivery.id,
                owner,
                self.retry_policy.max_attempts(),
                now,
                lease_until,
            )
            .await?
        else {
            tracing::debug!(
                target: "webhook_delivery",
                delivery_id = %delivery.id,
                "Delivery no longer eligible for retry"
            );
            return Ok(DispatchOutcome::NotEligible);
        };

        let event = self.store.find_event(current.event_id).await?;
        let subscriber = self.store.find_subscriber(current.subscriber_id).await?;

        let (event, subscriber) = match (event, subscriber) {
            (Some(event), Some(subscriber)) if subscriber.is_active => (event, subscriber),
            (event, subscriber) => {
                let reason = if event.is_none() {
                    "Event no longer exists"
                } else if subscriber.is_none() {
                    "Subscriber no longer exists"
                } else {
                    "Subscriber is inactive"
                };
                return self.abandon(&current, reason).await;
            }
        };

        self.attempt(&current, &event, &subscriber).await
    }

    async fn abandon(
        &self,
        delivery: &Delivery,
        reason: &str,
    ) -> Result<DispatchOutcome, WebhookError> {
        self.store
            .mark_failed(
                delivery.id,
                DeliveryFailure {
                    http_status_code: None,
                    error_message: reason.to_string(),
                    duration_ms: 0,
                    disposition: FailureDisposition::Abandon,
                },
            )
            .await?;

        tracing::warn!(
            target: "webhook_delivery",
            delivery_id = %delivery.id,
            event_id = %delivery.event_id,
            subscriber_id = %delivery.subscriber_id,
            reason,
            "Delivery abandoned"
        );
        Ok(DispatchOutcome::Abandoned)
    }

    /// Send once and record the result on the row.
    async fn attempt(
        &self,
        delivery: &Delivery,
        event: &Event,
        subscriber: &Subscriber,
    ) -> Result<DispatchOutcome, WebhookError> {
        let start = Instant::now();
        let result = self.send(event, subscriber).await;
        let duration_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);

        match result {
            Ok(status) => {
                self.store
                    .mark_success(
                        delivery.id,
                        DeliverySuccess {
                            http_status_code: i32::from(status),
                            duration_ms,
                        },
                    )
                    .await?;

                tracing::info!(
                    target: "webhook_delivery",
                    delivery_id = %delivery.id,
                    event_id = %event.id,
                    subscriber_id = %subscriber.id,
                    attempt = delivery.attempt_number,
                    status_code = status,
                    duration_ms,
                    "Webhook delivered successfully"
                );
                Ok(DispatchOutcome::Delivered)
            }
            Err(e) => {
                let disposition = self
                    .retry_policy
                    .disposition(delivery.attempt_number, Utc::now());
                let error_message = truncate_error(&e.to_string());

                self.store
                    .mark_failed(
                        delivery.id,
                        DeliveryFailure {
                            http_status_code: e.http_status().map(i32::from),
                            error_message: error_message.clone(),
                            duration_ms,
                            disposition,
                        },
                    )
                    .await?;

                match disposition {
                    FailureDisposition::RetryAt(next_retry_at) => {
                        tracing::warn!(
                            target: "webhook_delivery",
                            delivery_id = %delivery.id,
                            event_id = %event.id,
                            subscriber_id = %subscriber.id,
                            attempt = delivery.attempt_number,
                            error = %error_message,
                            next_retry_at = %next_retry_at,
                            "Webhook delivery failed, will retry"
                        );
                        Ok(DispatchOutcome::RetryScheduled)
                    }
                    FailureDisposition::DeadLetter => {
                        tracing::error!(
                            target: "webhook_delivery",
                            delivery_id = %delivery.id,
                            event_id = %event.id,
                            subscriber_id = %subscriber.id,
                            attempt = delivery.attempt_number,
                            error = %error_message,
                            "Webhook delivery exhausted all retries, moved to DLQ"
                        );
                        Ok(DispatchOutcome::DeadLettered)
                    }
                    FailureDisposition::Abandon => Ok(DispatchOutcome::Abandoned),
                }
            }
        }
    }

    /// Sign and POST the payload. Returns the 2xx status code.
    async fn send(&self, event: &Event, subscriber: &Subscriber) -> Result<u16, WebhookError> {
        let secret = self.cipher.decrypt(&subscriber.secret_encrypted)?;
        let event_id = event.id.to_string();
        let header = SignatureHeader::sign(
            Utc::now().timestamp(),
            &subscriber.key_id,
            &event_id,
            event.payload.as_bytes(),
            &secret,
        )?;

        let response = self
            .http_client
            .post(&subscriber.callback_url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, header.to_string())
            .header(EVENT_ID_HEADER, &event_id)
            .body(event.payload.clone())
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(WebhookError::HttpStatus {
                status: status.as_u16(),
            })
        }
    }

    fn transport_error(&self, e: &reqwest::Error) -> WebhookError {
        if e.is_timeout() {
            WebhookError::Timeout(u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX))
        } else if e.is_connect() {
            WebhookError::Transport(format!("Connection failed: {e}"))
        } else {
            WebhookError::Transport(format!("Request error: {e}"))
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(120))
}
