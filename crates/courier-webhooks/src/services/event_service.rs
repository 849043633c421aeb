//! Event ingestion.
//!
//! Validates the request, enforces the idempotency key, stores the event,
//! and dispatches it to every matching subscriber in parallel.

use std::sync::Arc;

use courier_db::{DbError, Event, NewEvent, Store};
use uuid::Uuid;

use crate::error::WebhookError;
use crate::models::{CreateEventRequest, CreateEventResponse};
use crate::services::dispatcher::{DispatchOutcome, WebhookDispatcher};
use crate::services::subscriber_resolver::SubscriberResolver;
use crate::validation;

/// Service for publishing events.
#[derive(Clone)]
pub struct EventService {
    store: Arc<dyn Store>,
    resolver: SubscriberResolver,
    dispatcher: WebhookDispatcher,
}

impl EventService {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        resolver: SubscriberResolver,
        dispatcher: WebhookDispatcher,
    ) -> Self {
        Self {
            store,
            resolver,
            dispatcher,
        }
    }

    /// Store an event and deliver it to every matching subscriber.
    ///
    /// A known idempotency key returns [`WebhookError::DuplicateEvent`]
    /// naming the existing event. Nothing is stored or sent in that case.
    pub async fn create_event(
        &self,
        request: CreateEventRequest,
    ) -> Result<CreateEventResponse, WebhookError> {
        validation::validate_tenant_id(&request.tenant_id)?;
        validation::validate_event_type(&request.event_type)?;
        validation::validate_idempotency_key(request.idempotency_key.as_deref())?;
        validation::validate_payload(&request.payload)?;

        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) = self.store.find_event_by_idempotency_key(key).await? {
                return Err(self.duplicate(&existing).await?);
            }
        }

        let payload = serde_json::to_string(&request.payload)
            .map_err(|e| WebhookError::Internal(format!("Failed to serialize payload: {e}")))?;

        let subscribers = self
            .resolver
            .resolve(&request.tenant_id, &request.event_type)
            .await?;

        let event = match self
            .store
            .insert_event(NewEvent {
                tenant_id: request.tenant_id,
                event_type: request.event_type,
                payload,
                idempotency_key: request.idempotency_key.clone(),
            })
            .await
        {
            Ok(event) => event,
            // Lost a race with a concurrent request carrying the same key.
            Err(e @ DbError::Conflict(_)) => {
                let existing = match request.idempotency_key.as_deref() {
                    Some(key) => self.store.find_event_by_idempotency_key(key).await?,
                    None => None,
                };
                return match existing {
                    Some(existing) => Err(self.duplicate(&existing).await?),
                    None => Err(e.into()),
                };
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            target: "webhook_delivery",
            event_id = %event.id,
            tenant_id = %event.tenant_id,
            event_type = %event.event_type,
            subscriber_count = subscribers.len(),
            "Event created, dispatching to subscribers"
        );

        let results = self.dispatcher.dispatch_all(&event, &subscribers).await;
        let delivered = results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(DispatchOutcome::Delivered)))
            .count();
        tracing::debug!(
            target: "webhook_delivery",
            event_id = %event.id,
            delivered,
            total = results.len(),
            "Initial dispatch finished"
        );

        Ok(CreateEventResponse {
            event_id: event.id,
            tenant_id: event.tenant_id,
            event_type: event.event_type,
            created_at: event.created_at,
            matched_subscribers: i64::try_from(subscribers.len()).unwrap_or(i64::MAX),
        })
    }

    async fn duplicate(&self, existing: &Event) -> Result<WebhookError, WebhookError> {
        let matched_subscribers = self.store.count_deliveries_for_event(existing.id).await?;
        tracing::info!(
            target: "webhook_delivery",
            event_id = %existing.id,
            matched_subscribers,
            "Duplicate idempotency key, returning existing event"
        );
        Ok(WebhookError::DuplicateEvent {
            event_id: existing.id,
            matched_subscribers,
        })
    }

    /// Look up a stored event.
    pub async fn get_event(&self, id: Uuid) -> Result<Event, WebhookError> {
        self.store
            .find_event(id)
            .await?
            .ok_or(WebhookError::EventNotFound)
    }
}
