//! Webhook subscriber model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A registered callback endpoint.
///
/// The plaintext signing secret is never stored; `secret_encrypted` holds the
/// base64 AES-256-GCM envelope (nonce prepended).
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: Uuid,
    pub tenant_id: String,
    pub callback_url: String,

    /// Event types this subscriber wants. Matching is exact.
    pub event_types: Vec<String>,

    pub secret_encrypted: String,

    /// Public identifier of the current secret. Sent with every signature.
    pub key_id: String,

    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscriber {
    /// Whether this subscriber's filter contains `event_type` exactly.
    #[must_use]
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|t| t == event_type)
    }
}

/// Input for inserting a subscriber.
#[derive(Debug, Clone)]
pub struct NewSubscriber {
    pub tenant_id: String,
    pub callback_url: String,
    pub event_types: Vec<String>,
    pub secret_encrypted: String,
    pub key_id: String,
}
