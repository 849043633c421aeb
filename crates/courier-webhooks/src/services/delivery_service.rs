//! Delivery query service.
//!
//! Paged listing of delivery rows with filters, newest first. Each item
//! carries the event type, tenant and callback URL of its pair.

use std::sync::Arc;

use courier_db::models::MAX_PAGE_SIZE;
use courier_db::{Delivery, DeliveryFilter, DeliveryPage, Store};
use uuid::Uuid;

use crate::error::WebhookError;

#[derive(Clone)]
pub struct DeliveryService {
    store: Arc<dyn Store>,
}

impl DeliveryService {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// List deliveries matching `filter`.
    ///
    /// Rejects a page below 1, a page size outside `1..=200`, and a `from`
    /// after `to`.
    pub async fn list_deliveries(
        &self,
        filter: DeliveryFilter,
    ) -> Result<DeliveryPage, WebhookError> {
        validate_filter(&filter)?;
        Ok(self.store.list_deliveries(&filter).await?)
    }

    pub async fn get_delivery(&self, id: Uuid) -> Result<Delivery, WebhookError> {
        self.store
            .find_delivery(id)
            .await?
            .ok_or(WebhookError::DeliveryNotFound)
    }
}

fn validate_filter(filter: &DeliveryFilter) -> Result<(), WebhookError> {
    if let Some(page) = filter.page {
        if page < 1 {
            return Err(WebhookError::Validation(
                "page must be at least 1".to_string(),
            ));
        }
    }
    if let Some(size) = filter.page_size {
        if !(1..=MAX_PAGE_SIZE).contains(&size) {
            return Err(WebhookError::Validation(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
    }
    if let (Some(from), Some(to)) = (filter.from, filter.to) {
        if from > to {
            return Err(WebhookError::Validation(
                "from must not be after to".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_validate_filter_defaults_ok() {
        assert!(validate_filter(&DeliveryFilter::default()).is_ok());
    }

    #[test]
    fn test_validate_filter_rejects_bad_paging() {
        let filter = DeliveryFilter {
            page: Some(0),
            ..Default::default()
        };
        assert!(validate_filter(&filter).is_err());

        for size in [0, MAX_PAGE_SIZE + 1] {
            let filter = DeliveryFilter {
                page_size: Some(size),
                ..Default::default()
            };
            assert!(validate_filter(&filter).is_err(), "size {size}");
        }

        let filter = DeliveryFilter {
            page: Some(3),
            page_size: Some(MAX_PAGE_SIZE),
            ..Default::default()
        };
        assert!(validate_filter(&filter).is_ok());
    }

    #[test]
    fn test_validate_filter_rejects_inverted_range() {
        let now = Utc::now();
        let filter = DeliveryFilter {
            from: Some(now),
            to: Some(now - Duration::hours(1)),
            ..Default::default()
        };
        assert!(matches!(
            validate_filter(&filter),
            Err(WebhookError::Validation(_))
        ));
    }
}
