//! Store traits the delivery engine is written against.
//!
//! Every state transition that must not race is expressed as a single
//! conditional write, so two workers touching the same row cannot both win.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DbError;
use crate::models::{
    Delivery, DeliveryFailure, DeliveryFilter, DeliveryPage, DeliverySuccess, Event, NewEvent,
    NewSubscriber, RetryClaim, Subscriber,
};

pub mod memory;
pub mod postgres;

/// Event persistence.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert a new event.
    ///
    /// Returns `DbError::Conflict` when the idempotency key is already taken.
    async fn insert_event(&self, input: NewEvent) -> Result<Event, DbError>;

    async fn find_event(&self, id: Uuid) -> Result<Option<Event>, DbError>;

    async fn find_event_by_idempotency_key(&self, key: &str) -> Result<Option<Event>, DbError>;
}

/// Subscriber persistence.
#[async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Returns `DbError::Conflict` when the key id is already taken.
    async fn insert_subscriber(&self, input: NewSubscriber) -> Result<Subscriber, DbError>;

    async fn find_subscriber(&self, id: Uuid) -> Result<Option<Subscriber>, DbError>;

    /// Active subscribers of a tenant, any event type.
    async fn list_active_subscribers(&self, tenant_id: &str) -> Result<Vec<Subscriber>, DbError>;

    /// All subscribers, newest first.
    async fn list_subscribers(&self) -> Result<Vec<Subscriber>, DbError>;

    /// Replace the secret and key id. `None` if the subscriber does not exist.
    async fn rotate_subscriber_secret(
        &self,
        id: Uuid,
        secret_encrypted: &str,
        key_id: &str,
    ) -> Result<Option<Subscriber>, DbError>;

    /// `None` if the subscriber does not exist.
    async fn set_subscriber_active(
        &self,
        id: Uuid,
        is_active: bool,
    ) -> Result<Option<Subscriber>, DbError>;
}

/// Delivery persistence.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert the Pending row for an (event, subscriber) pair.
    ///
    /// Returns `None` when the pair already has a row.
    async fn create_delivery(
        &self,
        event_id: Uuid,
        subscriber_id: Uuid,
    ) -> Result<Option<Delivery>, DbError>;

    async fn find_delivery(&self, id: Uuid) -> Result<Option<Delivery>, DbError>;

    async fn count_deliveries_for_event(&self, event_id: Uuid) -> Result<i64, DbError>;

    /// Failed -> Retrying with `attempt_number + 1` and `next_retry_at` cleared.
    ///
    /// Only applies while the row is Failed, below `max_attempts`, and not
    /// leased by another live owner. The row stays leased until
    /// `lease_until` so a crashed attempt can be recovered. Returns `None`
    /// when the transition does not apply.
    async fn begin_retry(
        &self,
        id: Uuid,
        owner: Option<Uuid>,
        max_attempts: i32,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Option<Delivery>, DbError>;

    /// Record a 2xx attempt. Clears the lease.
    async fn mark_success(&self, id: Uuid, outcome: DeliverySuccess) -> Result<(), DbError>;

    /// Record a failed attempt. Clears the lease.
    async fn mark_failed(&self, id: Uuid, failure: DeliveryFailure) -> Result<(), DbError>;

    /// Lease up to `claim.limit` Failed rows that are due and below the
    /// attempt limit, skipping rows leased by another live owner.
    async fn claim_due_retries(&self, claim: RetryClaim) -> Result<Vec<Delivery>, DbError>;

    /// Drop a lease without touching status or `next_retry_at`.
    async fn release_claim(&self, id: Uuid, owner: Uuid) -> Result<(), DbError>;

    /// Delete up to `limit` Success rows created before `cutoff`.
    async fn purge_succeeded_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, DbError>;

    /// Move up to `limit` exhausted Failed rows with no pending retry to DLQ.
    async fn promote_exhausted_to_dlq(&self, max_attempts: i32, limit: i64)
        -> Result<u64, DbError>;

    /// Return stuck rows to Failed.
    ///
    /// Retrying rows with an expired lease and Pending rows created before
    /// `pending_before` become Failed, due at `now` when attempts remain and
    /// with no retry otherwise (left for DLQ promotion).
    async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        pending_before: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<u64, DbError>;

    /// Filtered, paged listing, newest first.
    async fn list_deliveries(&self, filter: &DeliveryFilter) -> Result<DeliveryPage, DbError>;
}

/// Everything the delivery engine needs from persistence.
pub trait Store: EventStore + SubscriberStore + DeliveryStore {}

impl<T: EventStore + SubscriberStore + DeliveryStore> Store for T {}
