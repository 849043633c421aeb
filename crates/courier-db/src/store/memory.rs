//! In-process store.
//!
//! Mirrors the PostgreSQL semantics (unique keys, conditional transitions,
//! leases) over maps behind a single lock. Used by tests and local runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{
    truncate_error, Delivery, DeliveryFailure, DeliveryFilter, DeliveryListItem, DeliveryPage,
    DeliveryStatus, DeliverySuccess, Event, FailureDisposition, NewEvent, NewSubscriber,
    RetryClaim, Subscriber,
};
use crate::store::{DeliveryStore, EventStore, SubscriberStore};

const STALLED_ERROR: &str = "delivery attempt did not complete";

#[derive(Debug, Default)]
struct Tables {
    events: HashMap<Uuid, Event>,
    subscribers: HashMap<Uuid, Subscriber>,
    deliveries: HashMap<Uuid, Delivery>,
}

impl Tables {
    fn lease_is_free(delivery: &Delivery, owner: Option<Uuid>, now: DateTime<Utc>) -> bool {
        match delivery.lease_owner {
            None => true,
            Some(current) if Some(current) == owner => true,
            Some(_) => delivery.lease_expires_at.map_or(true, |at| at < now),
        }
    }
}

/// [`Store`](crate::Store) kept in memory. Cloning shares the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All deliveries, in no particular order.
    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.tables.read().await.deliveries.values().cloned().collect()
    }

    /// Number of stored events.
    pub async fn event_count(&self) -> usize {
        self.tables.read().await.events.len()
    }

    /// Overwrite a delivery row as-is. Lets tests stage arbitrary states.
    pub async fn put_delivery(&self, delivery: Delivery) {
        self.tables
            .write()
            .await
            .deliveries
            .insert(delivery.id, delivery);
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event(&self, input: NewEvent) -> Result<Event, DbError> {
        let mut tables = self.tables.write().await;

        if let Some(key) = input.idempotency_key.as_deref() {
            if tables
                .events
                .values()
                .any(|e| e.idempotency_key.as_deref() == Some(key))
            {
                return Err(DbError::Conflict(
                    "violates events_idempotency_key_key".to_string(),
                ));
            }
        }

        let event = Event {
            id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            event_type: input.event_type,
            payload: input.payload,
            idempotency_key: input.idempotency_key,
            created_at: Utc::now(),
        };
        tables.events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn find_event(&self, id: Uuid) -> Result<Option<Event>, DbError> {
        Ok(self.tables.read().await.events.get(&id).cloned())
    }

    async fn find_event_by_idempotency_key(&self, key: &str) -> Result<Option<Event>, DbError> {
        Ok(self
            .tables
            .read()
            .await
            .events
            .values()
            .find(|e| e.idempotency_key.as_deref() == Some(key))
            .cloned())
    }
}

#[async_trait]
impl SubscriberStore for MemoryStore {
    async fn insert_subscriber(&self, input: NewSubscriber) -> Result<Subscriber, DbError> {
        let mut tables = self.tables.write().await;

        if tables.subscribers.values().any(|s| s.key_id == input.key_id) {
            return Err(DbError::Conflict(
                "violates subscribers_key_id_key".to_string(),
            ));
        }

        let now = Utc::now();
        let subscriber = Subscriber {
            id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            callback_url: input.callback_url,
            event_types: input.event_types,
            secret_encrypted: input.secret_encrypted,
            key_id: input.key_id,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        tables.subscribers.insert(subscriber.id, subscriber.clone());
        Ok(subscriber)
    }

    async fn find_subscriber(&self, id: Uuid) -> Result<Option<Subscriber>, DbError> {
        Ok(self.tables.read().await.subscribers.get(&id).cloned())
    }

    async fn list_active_subscribers(&self, tenant_id: &str) -> Result<Vec<Subscriber>, DbError> {
        let tables = self.tables.read().await;
        let mut subscribers: Vec<Subscriber> = tables
            .subscribers
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.is_active)
            .cloned()
            .collect();
        subscribers.sort_by_key(|s| s.created_at);
        Ok(subscribers)
    }

    async fn list_subscribers(&self) -> Result<Vec<Subscriber>, DbError> {
        let tables = self.tables.read().await;
        let mut subscribers: Vec<Subscriber> = tables.subscribers.values().cloned().collect();
        subscribers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subscribers)
    }

    async fn rotate_subscriber_secret(
        &self,
        id: Uuid,
        secret_encrypted: &str,
        key_id: &str,
    ) -> Result<Option<Subscriber>, DbError> {
        let mut tables = self.tables.write().await;

        if tables
            .subscribers
            .values()
            .any(|s| s.id != id && s.key_id == key_id)
        {
            return Err(DbError::Conflict(
                "violates subscribers_key_id_key".to_string(),
            ));
        }

        Ok(tables.subscribers.get_mut(&id).map(|s| {
            s.secret_encrypted = secret_encrypted.to_string();
            s.key_id = key_id.to_string();
            s.updated_at = Utc::now();
            s.clone()
        }))
    }

    async fn set_subscriber_active(
        &self,
        id: Uuid,
        is_active: bool,
    ) -> Result<Option<Subscriber>, DbError> {
        let mut tables = self.tables.write().await;
        Ok(tables.subscribers.get_mut(&id).map(|s| {
            s.is_active = is_active;
            s.updated_at = Utc::now();
            s.clone()
        }))
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn create_delivery(
        &self,
        event_id: Uuid,
        subscriber_id: Uuid,
    ) -> Result<Option<Delivery>, DbError> {
        let mut tables = self.tables.write().await;

        if tables
            .deliveries
            .values()
            .any(|d| d.event_id == event_id && d.subscriber_id == subscriber_id)
        {
            return Ok(None);
        }

        let delivery = Delivery {
            id: Uuid::new_v4(),
            event_id,
            subscriber_id,
            status: DeliveryStatus::Pending,
            attempt_number: 1,
            http_status_code: None,
            error_message: None,
            duration_ms: 0,
            created_at: Utc::now(),
            delivered_at: None,
            next_retry_at: None,
            lease_owner: None,
            lease_expires_at: None,
        };
        tables.deliveries.insert(delivery.id, delivery.clone());
        Ok(Some(delivery))
    }

    async fn find_delivery(&self, id: Uuid) -> Result<Option<Delivery>, DbError> {
        Ok(self.tables.read().await.deliveries.get(&id).cloned())
    }

    async fn count_deliveries_for_event(&self, event_id: Uuid) -> Result<i64, DbError> {
        let tables = self.tables.read().await;
        let count = tables
            .deliveries
            .values()
            .filter(|d| d.event_id == event_id)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn begin_retry(
        &self,
        id: Uuid,
        owner: Option<Uuid>,
        max_attempts: i32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Delivery>, DbError> {
        let mut tables = self.tables.write().await;
        let Some(delivery) = tables.deliveries.get_mut(&id) else {
            return Ok(None);
        };

        if delivery.status != DeliveryStatus::Failed
            || delivery.attempt_number >= max_attempts
            || !Tables::lease_is_free(delivery, owner, now)
        {
            return Ok(None);
        }

        delivery.status = DeliveryStatus::Retrying;
        delivery.attempt_number += 1;
        delivery.next_retry_at = None;
        delivery.lease_owner = owner;
        delivery.lease_expires_at = Some(lease_until);
        Ok(Some(delivery.clone()))
    }

    async fn mark_success(&self, id: Uuid, outcome: DeliverySuccess) -> Result<(), DbError> {
        let mut tables = self.tables.write().await;
        if let Some(delivery) = tables.deliveries.get_mut(&id) {
            delivery.status = DeliveryStatus::Success;
            delivery.http_status_code = Some(outcome.http_status_code);
            delivery.error_message = None;
            delivery.duration_ms = outcome.duration_ms;
            delivery.delivered_at = Some(Utc::now());
            delivery.next_retry_at = None;
            delivery.lease_owner = None;
            delivery.lease_expires_at = None;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, failure: DeliveryFailure) -> Result<(), DbError> {
        let (status, next_retry_at) = match failure.disposition {
            FailureDisposition::RetryAt(at) => (DeliveryStatus::Failed, Some(at)),
            FailureDisposition::DeadLetter => (DeliveryStatus::Dlq, None),
            FailureDisposition::Abandon => (DeliveryStatus::Failed, None),
        };

        let mut tables = self.tables.write().await;
        if let Some(delivery) = tables.deliveries.get_mut(&id) {
            delivery.status = status;
            delivery.http_status_code = failure.http_status_code;
            delivery.error_message = Some(truncate_error(&failure.error_message));
            delivery.duration_ms = failure.duration_ms;
            delivery.next_retry_at = next_retry_at;
            delivery.lease_owner = None;
            delivery.lease_expires_at = None;
        }
        Ok(())
    }

    async fn claim_due_retries(&self, claim: RetryClaim) -> Result<Vec<Delivery>, DbError> {
        let mut tables = self.tables.write().await;

        let mut due: Vec<&mut Delivery> = tables
            .deliveries
            .values_mut()
            .filter(|d| {
                d.status == DeliveryStatus::Failed
                    && d.next_retry_at.is_some_and(|at| at <= claim.now)
                    && d.attempt_number < claim.max_attempts
                    && Tables::lease_is_free(d, Some(claim.owner), claim.now)
            })
            .collect();
        due.sort_by_key(|d| d.next_retry_at);

        let limit = usize::try_from(claim.limit.max(0)).unwrap_or(usize::MAX);
        Ok(due
            .into_iter()
            .take(limit)
            .map(|d| {
                d.lease_owner = Some(claim.owner);
                d.lease_expires_at = Some(claim.lease_until);
                d.clone()
            })
            .collect())
    }

    async fn release_claim(&self, id: Uuid, owner: Uuid) -> Result<(), DbError> {
        let mut tables = self.tables.write().await;
        if let Some(delivery) = tables.deliveries.get_mut(&id) {
            if delivery.lease_owner == Some(owner) {
                delivery.lease_owner = None;
                delivery.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn purge_succeeded_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, DbError> {
        let mut tables = self.tables.write().await;

        let mut expired: Vec<(DateTime<Utc>, Uuid)> = tables
            .deliveries
            .values()
            .filter(|d| d.status == DeliveryStatus::Success && d.created_at < cutoff)
            .map(|d| (d.created_at, d.id))
            .collect();
        expired.sort();

        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        let mut purged = 0;
        for (_, id) in expired.into_iter().take(limit) {
            tables.deliveries.remove(&id);
            purged += 1;
        }
        Ok(purged)
    }

    async fn promote_exhausted_to_dlq(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> Result<u64, DbError> {
        let mut tables = self.tables.write().await;
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);

        let mut promoted = 0;
        for delivery in tables
            .deliveries
            .values_mut()
            .filter(|d| {
                d.status == DeliveryStatus::Failed
                    && d.attempt_number >= max_attempts
                    && d.next_retry_at.is_none()
            })
            .take(limit)
        {
            delivery.status = DeliveryStatus::Dlq;
            delivery.lease_owner = None;
            delivery.lease_expires_at = None;
            promoted += 1;
        }
        Ok(promoted)
    }

    async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        pending_before: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<u64, DbError> {
        let mut tables = self.tables.write().await;
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);

        let mut recovered = 0;
        for delivery in tables
            .deliveries
            .values_mut()
            .filter(|d| match d.status {
                DeliveryStatus::Retrying => d.lease_expires_at.is_some_and(|at| at < now),
                DeliveryStatus::Pending => d.created_at < pending_before,
                _ => false,
            })
            .take(limit)
        {
            delivery.status = DeliveryStatus::Failed;
            delivery.next_retry_at = (delivery.attempt_number < max_attempts).then_some(now);
            if delivery.error_message.is_none() {
                delivery.error_message = Some(STALLED_ERROR.to_string());
            }
            delivery.lease_owner = None;
            delivery.lease_expires_at = None;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn list_deliveries(&self, filter: &DeliveryFilter) -> Result<DeliveryPage, DbError> {
        let tables = self.tables.read().await;

        let mut matching: Vec<DeliveryListItem> = tables
            .deliveries
            .values()
            .filter(|d| filter.matches(d))
            .filter_map(|d| {
                let event = tables.events.get(&d.event_id)?;
                let subscriber = tables.subscribers.get(&d.subscriber_id)?;
                Some(DeliveryListItem {
                    delivery: d.clone(),
                    event_type: event.event_type.clone(),
                    tenant_id: event.tenant_id.clone(),
                    callback_url: subscriber.callback_url.clone(),
                })
            })
            .collect();
        matching.sort_by(|a, b| {
            b.delivery
                .created_at
                .cmp(&a.delivery.created_at)
                .then(a.delivery.id.cmp(&b.delivery.id))
        });

        let total_count = i64::try_from(matching.len()).unwrap_or(i64::MAX);
        let offset = usize::try_from(filter.offset()).unwrap_or(usize::MAX);
        let page_size = usize::try_from(filter.page_size()).unwrap_or(usize::MAX);
        let items = matching.into_iter().skip(offset).take(page_size).collect();

        Ok(DeliveryPage::new(items, total_count, filter))
    }
}
