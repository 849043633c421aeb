//! Subscriber management service.
//!
//! Creates subscribers with a generated signing secret, rotates and
//! deactivates them, and reports their status. Every mutation invalidates
//! the tenant's cached subscriber list before returning.

use std::sync::Arc;

use courier_db::{DbError, NewSubscriber, Store};
use uuid::Uuid;

use crate::crypto::{self, SecretCipher};
use crate::error::WebhookError;
use crate::models::{
    CreateSubscriberRequest, CreateSubscriberResponse, RotateSecretResponse,
    SubscriberStatusResponse,
};
use crate::services::subscriber_resolver::SubscriberResolver;
use crate::validation::{self, UrlPolicy};

/// Key id length in hex characters.
pub const KEY_ID_LEN: usize = 16;

/// Attempts at drawing a key id that is not taken yet.
const KEY_ID_ATTEMPTS: usize = 3;

/// Random 16-hex-character key id.
#[must_use]
pub fn generate_key_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(KEY_ID_LEN);
    id
}

/// Service for subscriber operations.
#[derive(Clone)]
pub struct SubscriberService {
    store: Arc<dyn Store>,
    cipher: SecretCipher,
    resolver: SubscriberResolver,
    url_policy: UrlPolicy,
}

impl SubscriberService {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, cipher: SecretCipher, resolver: SubscriberResolver) -> Self {
        Self {
            store,
            cipher,
            resolver,
            url_policy: UrlPolicy::default(),
        }
    }

    /// Set which callback URLs are accepted.
    #[must_use]
    pub fn with_url_policy(mut self, policy: UrlPolicy) -> Self {
        self.url_policy = policy;
        self
    }

    /// Register a subscriber. The plaintext secret is only returned here.
    pub async fn create_subscriber(
        &self,
        request: CreateSubscriberRequest,
    ) -> Result<CreateSubscriberResponse, WebhookError> {
        validation::validate_tenant_id(&request.tenant_id)?;
        validation::validate_webhook_url(&request.callback_url, self.url_policy)?;
        validation::validate_event_types(&request.event_types)?;

        let secret = crypto::generate_secret();
        let secret_encrypted = self.cipher.encrypt(&secret)?;

        let mut attempt = 0;
        let subscriber = loop {
            attempt += 1;
            let input = NewSubscriber {
                tenant_id: request.tenant_id.clone(),
                callback_url: request.callback_url.clone(),
                event_types: request.event_types.clone(),
                secret_encrypted: secret_encrypted.clone(),
                key_id: generate_key_id(),
            };
            match self.store.insert_subscriber(input).await {
                Ok(subscriber) => break subscriber,
                Err(DbError::Conflict(_)) if attempt < KEY_ID_ATTEMPTS => continue,
                Err(e) => return Err(e.into()),
            }
        };

        self.resolver.invalidate(&subscriber.tenant_id).await;

        tracing::info!(
            target: "webhook_delivery",
            subscriber_id = %subscriber.id,
            tenant_id = %subscriber.tenant_id,
            key_id = %subscriber.key_id,
            event_types = ?subscriber.event_types,
            "Subscriber created"
        );

        Ok(CreateSubscriberResponse {
            id: subscriber.id,
            tenant_id: subscriber.tenant_id,
            callback_url: subscriber.callback_url,
            event_types: subscriber.event_types,
            secret,
            key_id: subscriber.key_id,
            created_at: subscriber.created_at,
        })
    }

    /// Replace the signing secret and key id. The old secret stops working.
    pub async fn rotate_secret(&self, id: Uuid) -> Result<RotateSecretResponse, WebhookError> {
        let secret = crypto::generate_secret();
        let secret_encrypted = self.cipher.encrypt(&secret)?;

        let mut attempt = 0;
        let subscriber = loop {
            attempt += 1;
            match self
                .store
                .rotate_subscriber_secret(id, &secret_encrypted, &generate_key_id())
                .await
            {
                Ok(Some(subscriber)) => break subscriber,
                Ok(None) => return Err(WebhookError::SubscriberNotFound),
                Err(DbError::Conflict(_)) if attempt < KEY_ID_ATTEMPTS => continue,
                Err(e) => return Err(e.into()),
            }
        };

        self.resolver.invalidate(&subscriber.tenant_id).await;

        tracing::info!(
            target: "webhook_delivery",
            subscriber_id = %subscriber.id,
            key_id = %subscriber.key_id,
            "Subscriber secret rotated"
        );

        Ok(RotateSecretResponse {
            id: subscriber.id,
            secret,
            key_id: subscriber.key_id,
            rotated_at: subscriber.updated_at,
        })
    }

    /// Stop delivering to a subscriber. Pending retries are abandoned.
    pub async fn deactivate(&self, id: Uuid) -> Result<SubscriberStatusResponse, WebhookError> {
        let subscriber = self
            .store
            .set_subscriber_active(id, false)
            .await?
            .ok_or(WebhookError::SubscriberNotFound)?;

        self.resolver.invalidate(&subscriber.tenant_id).await;

        tracing::info!(
            target: "webhook_delivery",
            subscriber_id = %subscriber.id,
            tenant_id = %subscriber.tenant_id,
            "Subscriber deactivated"
        );

        Ok(subscriber.into())
    }

    pub async fn status(&self, id: Uuid) -> Result<SubscriberStatusResponse, WebhookError> {
        self.store
            .find_subscriber(id)
            .await?
            .map(SubscriberStatusResponse::from)
            .ok_or(WebhookError::SubscriberNotFound)
    }

    /// All subscribers, newest first.
    pub async fn list(&self) -> Result<Vec<SubscriberStatusResponse>, WebhookError> {
        Ok(self
            .store
            .list_subscribers()
            .await?
            .into_iter()
            .map(SubscriberStatusResponse::from)
            .collect())
    }
}
