//! Webhook delivery model.
//!
//! One row per (event, subscriber) pair. Retries mutate the same row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Stored error messages are cut to this many characters.
pub const MAX_ERROR_MESSAGE_LEN: usize = 1000;

/// Page size used when a query does not ask for one.
pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// Upper bound for a requested page size.
pub const MAX_PAGE_SIZE: i64 = 200;

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Row created, first send not yet resolved.
    Pending,
    /// Receiver answered 2xx.
    Success,
    /// Last attempt failed. Awaiting retry when `next_retry_at` is set.
    Failed,
    /// A retry attempt is in flight.
    Retrying,
    /// Attempts exhausted.
    Dlq,
}

impl DeliveryStatus {
    /// Success and DLQ never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::Dlq)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Success => write!(f, "success"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Retrying => write!(f, "retrying"),
            DeliveryStatus::Dlq => write!(f, "dlq"),
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DeliveryStatus::Pending),
            "success" => Ok(DeliveryStatus::Success),
            "failed" => Ok(DeliveryStatus::Failed),
            "retrying" => Ok(DeliveryStatus::Retrying),
            "dlq" => Ok(DeliveryStatus::Dlq),
            _ => Err(format!("Unknown delivery status: {s}")),
        }
    }
}

/// A delivery row.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Delivery {
    pub id: Uuid,
    pub event_id: Uuid,
    pub subscriber_id: Uuid,
    pub status: DeliveryStatus,

    /// Starts at 1, +1 per retry.
    pub attempt_number: i32,

    /// Status code of the last attempt, if the receiver answered at all.
    pub http_status_code: Option<i32>,

    /// Last error, truncated to [`MAX_ERROR_MESSAGE_LEN`] characters.
    pub error_message: Option<String>,

    /// Duration of the last attempt.
    pub duration_ms: i64,

    pub created_at: DateTime<Utc>,

    /// Set only on success.
    pub delivered_at: Option<DateTime<Utc>>,

    /// Set only while the row is awaiting a retry.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Worker instance currently holding the row.
    pub lease_owner: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// Cut an error message to [`MAX_ERROR_MESSAGE_LEN`] characters.
#[must_use]
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_LEN) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

/// Outcome of a 2xx attempt.
#[derive(Debug, Clone, Copy)]
pub struct DeliverySuccess {
    pub http_status_code: i32,
    pub duration_ms: i64,
}

/// What happens to a row after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Failed, due again at the given instant.
    RetryAt(DateTime<Utc>),
    /// Attempts exhausted.
    DeadLetter,
    /// Failed with nothing left to send. Never scheduled again.
    Abandon,
}

/// Outcome of a failed attempt.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub http_status_code: Option<i32>,
    pub error_message: String,
    pub duration_ms: i64,
    pub disposition: FailureDisposition,
}

/// Parameters for claiming due retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryClaim {
    pub now: DateTime<Utc>,
    pub max_attempts: i32,
    pub limit: i64,
    pub owner: Uuid,
    pub lease_until: DateTime<Utc>,
}

/// Filters for listing deliveries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryFilter {
    pub event_id: Option<Uuid>,
    pub subscriber_id: Option<Uuid>,
    pub status: Option<DeliveryStatus>,
    /// Inclusive lower bound on `created_at`.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub to: Option<DateTime<Utc>>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

impl DeliveryFilter {
    /// 1-based page, at least 1.
    #[must_use]
    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }

    /// Page size clamped to `1..=MAX_PAGE_SIZE`.
    #[must_use]
    pub fn page_size(&self) -> i64 {
        self.page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    #[must_use]
    pub fn offset(&self) -> i64 {
        (self.page() - 1).saturating_mul(self.page_size())
    }

    /// Whether a delivery row passes the non-paging filters.
    #[must_use]
    pub fn matches(&self, delivery: &Delivery) -> bool {
        self.event_id.map_or(true, |id| delivery.event_id == id)
            && self.subscriber_id.map_or(true, |id| delivery.subscriber_id == id)
            && self.status.map_or(true, |s| delivery.status == s)
            && self.from.map_or(true, |from| delivery.created_at >= from)
            && self.to.map_or(true, |to| delivery.created_at <= to)
    }
}

/// A delivery joined with the event and subscriber fields shown in listings.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct DeliveryListItem {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub delivery: Delivery,
    pub event_type: String,
    pub tenant_id: String,
    pub callback_url: String,
}

/// One page of a delivery listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryPage {
    pub items: Vec<DeliveryListItem>,
    pub total_count: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
}

impl DeliveryPage {
    #[must_use]
    pub fn new(items: Vec<DeliveryListItem>, total_count: i64, filter: &DeliveryFilter) -> Self {
        let page_size = filter.page_size();
        Self {
            items,
            total_count,
            page: filter.page(),
            page_size,
            total_pages: (total_count + page_size - 1) / page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_strings() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Success,
            DeliveryStatus::Failed,
            DeliveryStatus::Retrying,
            DeliveryStatus::Dlq,
        ] {
            let parsed: DeliveryStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("done".parse::<DeliveryStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(DeliveryStatus::Success.is_terminal());
        assert!(DeliveryStatus::Dlq.is_terminal());
        assert!(!DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_truncate_error_limits_chars() {
        let long = "x".repeat(MAX_ERROR_MESSAGE_LEN + 50);
        assert_eq!(truncate_error(&long).chars().count(), MAX_ERROR_MESSAGE_LEN);
        assert_eq!(truncate_error("short"), "short");
    }

    #[test]
    fn test_truncate_error_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_MESSAGE_LEN + 1);
        let cut = truncate_error(&long);
        assert_eq!(cut.chars().count(), MAX_ERROR_MESSAGE_LEN);
    }

    #[test]
    fn test_filter_paging_defaults_and_clamps() {
        let filter = DeliveryFilter::default();
        assert_eq!(filter.page(), 1);
        assert_eq!(filter.page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(filter.offset(), 0);

        let filter = DeliveryFilter {
            page: Some(0),
            page_size: Some(10_000),
            ..Default::default()
        };
        assert_eq!(filter.page(), 1);
        assert_eq!(filter.page_size(), MAX_PAGE_SIZE);

        let filter = DeliveryFilter {
            page: Some(3),
            page_size: Some(20),
            ..Default::default()
        };
        assert_eq!(filter.offset(), 40);
    }

    #[test]
    fn test_page_total_pages() {
        let filter = DeliveryFilter {
            page_size: Some(50),
            ..Default::default()
        };
        assert_eq!(DeliveryPage::new(vec![], 0, &filter).total_pages, 0);
        assert_eq!(DeliveryPage::new(vec![], 50, &filter).total_pages, 1);
        assert_eq!(DeliveryPage::new(vec![], 51, &filter).total_pages, 2);
    }
}
