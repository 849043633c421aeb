//! PostgreSQL store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{
    truncate_error, Delivery, DeliveryFailure, DeliveryFilter, DeliveryListItem, DeliveryPage,
    DeliveryStatus, DeliverySuccess, Event, FailureDisposition, NewEvent, NewSubscriber,
    RetryClaim, Subscriber,
};
use crate::pool::DbPool;
use crate::store::{DeliveryStore, EventStore, SubscriberStore};

/// Recorded on rows recovered from a stalled attempt that left no error.
const STALLED_ERROR: &str = "delivery attempt did not complete";

/// [`Store`](crate::Store) backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn insert_event(&self, input: NewEvent) -> Result<Event, DbError> {
        let event = sqlx::query_as::<_, Event>(
            r#"
            INSERT INTO events (id, tenant_id, event_type, payload, idempotency_key, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.tenant_id)
        .bind(&input.event_type)
        .bind(&input.payload)
        .bind(&input.idempotency_key)
        .fetch_one(self.pool.inner())
        .await?;

        Ok(event)
    }

    async fn find_event(&self, id: Uuid) -> Result<Option<Event>, DbError> {
        let event = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.inner())
            .await?;

        Ok(event)
    }

    async fn find_event_by_idempotency_key(&self, key: &str) -> Result<Option<Event>, DbError> {
        let event = sqlx::query_as::<_, Event>("SELECT * FROM events WHERE idempotency_key = $1")
            .bind(key)
            .fetch_optional(self.pool.inner())
            .await?;

        Ok(event)
    }
}

#[async_trait]
impl SubscriberStore for PgStore {
    async fn insert_subscriber(&self, input: NewSubscriber) -> Result<Subscriber, DbError> {
        let subscriber = sqlx::query_as::<_, Subscriber>(
            r#"
            INSERT INTO subscribers (
                id, tenant_id, callback_url, event_types, secret_encrypted, key_id,
                is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, TRUE, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.tenant_id)
        .bind(&input.callback_url)
        .bind(&input.event_types)
        .bind(&input.secret_encrypted)
        .bind(&input.key_id)
        .fetch_one(self.pool.inner())
        .await?;

        Ok(subscriber)
    }

    async fn find_subscriber(&self, id: Uuid) -> Result<Option<Subscriber>, DbError> {
        let subscriber = sqlx::query_as::<_, Subscriber>("SELECT * FROM subscribers WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.inner())
            .await?;

        Ok(subscriber)
    }

    async fn list_active_subscribers(&self, tenant_id: &str) -> Result<Vec<Subscriber>, DbError> {
        let subscribers = sqlx::query_as::<_, Subscriber>(
            r#"
            SELECT * FROM subscribers
            WHERE tenant_id = $1 AND is_active = TRUE
            ORDER BY created_at
            "#,
        )
        .bind(tenant_id)
        .fetch_all(self.pool.inner())
        .await?;

        Ok(subscribers)
    }

    async fn list_subscribers(&self) -> Result<Vec<Subscriber>, DbError> {
        let subscribers =
            sqlx::query_as::<_, Subscriber>("SELECT * FROM subscribers ORDER BY created_at DESC")
                .fetch_all(self.pool.inner())
                .await?;

        Ok(subscribers)
    }

    async fn rotate_subscriber_secret(
        &self,
        id: Uuid,
        secret_encrypted: &str,
        key_id: &str,
    ) -> Result<Option<Subscriber>, DbError> {
        let subscriber = sqlx::query_as::<_, Subscriber>(
            r#"
            UPDATE subscribers
            SET secret_encrypted = $2, key_id = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(secret_encrypted)
        .bind(key_id)
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(subscriber)
    }

    async fn set_subscriber_active(
        &self,
        id: Uuid,
        is_active: bool,
    ) -> Result<Option<Subscriber>, DbError> {
        let subscriber = sqlx::query_as::<_, Subscriber>(
            r#"
            UPDATE subscribers
            SET is_active = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(is_active)
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(subscriber)
    }
}

#[async_trait]
impl DeliveryStore for PgStore {
    async fn create_delivery(
        &self,
        event_id: Uuid,
        subscriber_id: Uuid,
    ) -> Result<Option<Delivery>, DbError> {
        let delivery = sqlx::query_as::<_, Delivery>(
            r#"
            INSERT INTO deliveries (
                id, event_id, subscriber_id, status, attempt_number, duration_ms, created_at
            )
            VALUES ($1, $2, $3, 'pending', 1, 0, NOW())
            ON CONFLICT (event_id, subscriber_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(subscriber_id)
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(delivery)
    }

    async fn find_delivery(&self, id: Uuid) -> Result<Option<Delivery>, DbError> {
        let delivery = sqlx::query_as::<_, Delivery>("SELECT * FROM deliveries WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.inner())
            .await?;

        Ok(delivery)
    }

    async fn count_deliveries_for_event(&self, event_id: Uuid) -> Result<i64, DbError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM deliveries WHERE event_id = $1")
            .bind(event_id)
            .fetch_one(self.pool.inner())
            .await?;

        Ok(count)
    }

    async fn begin_retry(
        &self,
        id: Uuid,
        owner: Option<Uuid>,
        max_attempts: i32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Delivery>, DbError> {
        let delivery = sqlx::query_as::<_, Delivery>(
            r#"
            UPDATE deliveries
            SET status = 'retrying',
                attempt_number = attempt_number + 1,
                next_retry_at = NULL,
                lease_owner = $2,
                lease_expires_at = $5
            WHERE id = $1
              AND status = 'failed'
              AND attempt_number < $3
              AND (lease_owner IS NULL OR lease_owner = $2 OR lease_expires_at < $4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(owner)
        .bind(max_attempts)
        .bind(now)
        .bind(lease_until)
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(delivery)
    }

    async fn mark_success(&self, id: Uuid, outcome: DeliverySuccess) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE deliveries
            SET status = 'success',
                http_status_code = $2,
                error_message = NULL,
                duration_ms = $3,
                delivered_at = NOW(),
                next_retry_at = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(outcome.http_status_code)
        .bind(outcome.duration_ms)
        .execute(self.pool.inner())
        .await?;

        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, failure: DeliveryFailure) -> Result<(), DbError> {
        let (status, next_retry_at) = match failure.disposition {
            FailureDisposition::RetryAt(at) => (DeliveryStatus::Failed, Some(at)),
            FailureDisposition::DeadLetter => (DeliveryStatus::Dlq, None),
            FailureDisposition::Abandon => (DeliveryStatus::Failed, None),
        };

        sqlx::query(
            r#"
            UPDATE deliveries
            SET status = $2,
                http_status_code = $3,
                error_message = $4,
                duration_ms = $5,
                next_retry_at = $6,
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(failure.http_status_code)
        .bind(truncate_error(&failure.error_message))
        .bind(failure.duration_ms)
        .bind(next_retry_at)
        .execute(self.pool.inner())
        .await?;

        Ok(())
    }

    async fn claim_due_retries(&self, claim: RetryClaim) -> Result<Vec<Delivery>, DbError> {
        let deliveries = sqlx::query_as::<_, Delivery>(
            r#"
            UPDATE deliveries
            SET lease_owner = $1, lease_expires_at = $2
            WHERE id IN (
                SELECT id FROM deliveries
                WHERE status = 'failed'
                  AND next_retry_at IS NOT NULL
                  AND next_retry_at <= $3
                  AND attempt_number < $4
                  AND (lease_owner IS NULL OR lease_owner = $1 OR lease_expires_at < $3)
                ORDER BY next_retry_at
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(claim.owner)
        .bind(claim.lease_until)
        .bind(claim.now)
        .bind(claim.max_attempts)
        .bind(claim.limit)
        .fetch_all(self.pool.inner())
        .await?;

        Ok(deliveries)
    }

    async fn release_claim(&self, id: Uuid, owner: Uuid) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE deliveries
            SET lease_owner = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(self.pool.inner())
        .await?;

        Ok(())
    }

    async fn purge_succeeded_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            DELETE FROM deliveries
            WHERE id IN (
                SELECT id FROM deliveries
                WHERE status = 'success' AND created_at < $1
                ORDER BY created_at
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected())
    }

    async fn promote_exhausted_to_dlq(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE deliveries
            SET status = 'dlq', lease_owner = NULL, lease_expires_at = NULL
            WHERE id IN (
                SELECT id FROM deliveries
                WHERE status = 'failed'
                  AND attempt_number >= $1
                  AND next_retry_at IS NULL
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(max_attempts)
        .bind(limit)
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected())
    }

    async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        pending_before: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE deliveries
            SET status = 'failed',
                next_retry_at = CASE WHEN attempt_number < $3 THEN $1 ELSE NULL END,
                error_message = COALESCE(error_message, $5),
                lease_owner = NULL,
                lease_expires_at = NULL
            WHERE id IN (
                SELECT id FROM deliveries
                WHERE (status = 'retrying' AND lease_expires_at < $1)
                   OR (status = 'pending' AND created_at < $2)
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(now)
        .bind(pending_before)
        .bind(max_attempts)
        .bind(limit)
        .bind(STALLED_ERROR)
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected())
    }

    async fn list_deliveries(&self, filter: &DeliveryFilter) -> Result<DeliveryPage, DbError> {
        let total_count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM deliveries d
            WHERE ($1::uuid IS NULL OR d.event_id = $1)
              AND ($2::uuid IS NULL OR d.subscriber_id = $2)
              AND ($3::varchar IS NULL OR d.status = $3)
              AND ($4::timestamptz IS NULL OR d.created_at >= $4)
              AND ($5::timestamptz IS NULL OR d.created_at <= $5)
            "#,
        )
        .bind(filter.event_id)
        .bind(filter.subscriber_id)
        .bind(filter.status)
        .bind(filter.from)
        .bind(filter.to)
        .fetch_one(self.pool.inner())
        .await?;

        let items = sqlx::query_as::<_, DeliveryListItem>(
            r#"
            SELECT d.*, e.event_type, e.tenant_id, s.callback_url
            FROM deliveries d
            JOIN events e ON e.id = d.event_id
            JOIN subscribers s ON s.id = d.subscriber_id
            WHERE ($1::uuid IS NULL OR d.event_id = $1)
              AND ($2::uuid IS NULL OR d.subscriber_id = $2)
              AND ($3::varchar IS NULL OR d.status = $3)
              AND ($4::timestamptz IS NULL OR d.created_at >= $4)
              AND ($5::timestamptz IS NULL OR d.created_at <= $5)
            ORDER BY d.created_at DESC, d.id
            LIMIT $6 OFFSET $7
            "#,
        )
        .bind(filter.event_id)
        .bind(filter.subscriber_id)
        .bind(filter.status)
        .bind(filter.from)
        .bind(filter.to)
        .bind(filter.page_size())
        .bind(filter.offset())
        .fetch_all(self.pool.inner())
        .await?;

        Ok(DeliveryPage::new(items, total_count, filter))
    }
}
