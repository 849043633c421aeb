//! Error types for the webhook delivery engine.

use courier_db::DbError;
use uuid::Uuid;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input. Nothing was written.
    Validation,
    NotFound,
    /// Uniqueness violation or duplicate idempotency key.
    Conflict,
    /// Worth retrying later (network, timeout, non-2xx, store unavailable).
    Transient,
    /// Retrying the same input will not help.
    Fatal,
}

/// Webhook engine error variants.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("SSRF protection: {0}")]
    SsrfDetected(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Subscriber not found")]
    SubscriberNotFound,

    #[error("Event not found")]
    EventNotFound,

    #[error("Delivery not found")]
    DeliveryNotFound,

    /// The idempotency key already names an event. Nothing new was created.
    #[error("Event with this idempotency key already exists: {event_id}")]
    DuplicateEvent {
        event_id: Uuid,
        matched_subscribers: i64,
    },

    /// Secret encryption or decryption failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("HTTP transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WebhookError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            WebhookError::Database(e) if e.is_conflict() => ErrorKind::Conflict,
            WebhookError::Database(e) if e.is_not_found() => ErrorKind::NotFound,
            WebhookError::Database(e) if e.is_connection_error() => ErrorKind::Transient,
            WebhookError::Database(_) => ErrorKind::Fatal,
            WebhookError::Cache(_) => ErrorKind::Transient,
            WebhookError::InvalidUrl(_)
            | WebhookError::SsrfDetected(_)
            | WebhookError::Validation(_) => ErrorKind::Validation,
            WebhookError::SubscriberNotFound
            | WebhookError::EventNotFound
            | WebhookError::DeliveryNotFound => ErrorKind::NotFound,
            WebhookError::DuplicateEvent { .. } => ErrorKind::Conflict,
            WebhookError::Crypto(_) | WebhookError::Signing(_) | WebhookError::Internal(_) => {
                ErrorKind::Fatal
            }
            WebhookError::Transport(_)
            | WebhookError::Timeout(_)
            | WebhookError::HttpStatus { .. } => ErrorKind::Transient,
        }
    }

    /// Status code to record for a failed attempt, if the receiver answered.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        match self {
            WebhookError::HttpStatus { status } => Some(*status),
            _ => None,
        }
    }
}

/// Subscriber cache failures. Never fatal to resolution.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("Cache entry is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type WebhookResult<T> = Result<T, WebhookError>;
