//! Request and response types for the engine's service surface.

use chrono::{DateTime, Utc};
use courier_db::Subscriber;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Publish an event for fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEventRequest {
    pub tenant_id: String,
    pub event_type: String,
    /// Delivered verbatim as the request body.
    pub payload: serde_json::Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEventResponse {
    pub event_id: Uuid,
    pub tenant_id: String,
    pub event_type: String,
    pub created_at: DateTime<Utc>,
    /// Number of subscribers the event was dispatched to.
    pub matched_subscribers: i64,
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubscriberRequest {
    pub tenant_id: String,
    pub callback_url: String,
    pub event_types: Vec<String>,
}

/// Returned once on creation. The plaintext secret is not retrievable later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubscriberResponse {
    pub id: Uuid,
    pub tenant_id: String,
    pub callback_url: String,
    pub event_types: Vec<String>,
    pub secret: String,
    pub key_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateSecretResponse {
    pub id: Uuid,
    pub secret: String,
    pub key_id: String,
    pub rotated_at: DateTime<Utc>,
}

/// Subscriber view without secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberStatusResponse {
    pub id: Uuid,
    pub tenant_id: String,
    pub callback_url: String,
    pub event_types: Vec<String>,
    pub key_id: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Subscriber> for SubscriberStatusResponse {
    fn from(s: Subscriber) -> Self {
        Self {
            id: s.id,
            tenant_id: s.tenant_id,
            callback_url: s.callback_url,
            event_types: s.event_types,
            key_id: s.key_id,
            is_active: s.is_active,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}
