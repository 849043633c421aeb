//! Webhook event model.
//!
//! An event is an immutable fact raised by a tenant. It fans out into one
//! delivery per matching subscriber.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A stored event.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,

    /// Tenant that raised the event (at most 100 chars).
    pub tenant_id: String,

    /// Event type, e.g. `order.created` (at most 100 chars).
    pub event_type: String,

    /// JSON document, stored verbatim. These bytes are what gets signed.
    pub payload: String,

    /// Globally unique when present.
    pub idempotency_key: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Input for inserting an event.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub tenant_id: String,
    pub event_type: String,
    pub payload: String,
    pub idempotency_key: Option<String>,
}
