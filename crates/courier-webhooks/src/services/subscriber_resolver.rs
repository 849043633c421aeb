//! Resolves the subscribers an event fans out to.
//!
//! Reads a tenant's active subscribers through the injected cache and
//! filters them by event type. Cache failures are logged and fall back to the
//! store; they never fail resolution.
//!
//! A per-tenant generation counter guards against a load racing an
//! invalidation: a list read before the bump is never left in the cache.
//! The counter is local to this process, so with a shared cache a writer on
//! another instance can still leave a stale list for at most one TTL.

use std::sync::Arc;

use courier_db::{Store, Subscriber};
use dashmap::DashMap;

use crate::cache::SubscriberCache;
use crate::error::WebhookError;

/// Read-through resolver for (tenant, event type).
#[derive(Clone)]
pub struct SubscriberResolver {
    store: Arc<dyn Store>,
    cache: Arc<dyn SubscriberCache>,
    generations: Arc<DashMap<String, u64>>,
}

impl SubscriberResolver {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn SubscriberCache>) -> Self {
        Self {
            store,
            cache,
            generations: Arc::new(DashMap::new()),
        }
    }

    fn generation(&self, tenant_id: &str) -> u64 {
        self.generations.get(tenant_id).map_or(0, |g| *g)
    }

    /// Active subscribers of `tenant_id` listening to `event_type`.
    pub async fn resolve(
        &self,
        tenant_id: &str,
        event_type: &str,
    ) -> Result<Vec<Subscriber>, WebhookError> {
        let active = self.active_for_tenant(tenant_id).await?;
        Ok(active
            .into_iter()
            .filter(|s| s.is_active && s.subscribes_to(event_type))
            .collect())
    }

    async fn active_for_tenant(&self, tenant_id: &str) -> Result<Vec<Subscriber>, WebhookError> {
        match self.cache.get(tenant_id).await {
            Ok(Some(cached)) => return Ok(cached),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    target: "subscriber_cache",
                    tenant_id = %tenant_id,
                    error = %e,
                    "Subscriber cache read failed, reading from store"
                );
            }
        }

        let generation = self.generation(tenant_id);
        let subscribers = self.store.list_active_subscribers(tenant_id).await?;

        if self.generation(tenant_id) != generation {
            tracing::debug!(
                target: "subscriber_cache",
                tenant_id = %tenant_id,
                "Subscribers changed during load, not caching"
            );
            return Ok(subscribers);
        }

        if let Err(e) = self.cache.put(tenant_id, &subscribers).await {
            tracing::warn!(
                target: "subscriber_cache",
                tenant_id = %tenant_id,
                error = %e,
                "Failed to populate subscriber cache"
            );
        }

        // An invalidation may have landed between the check and the put.
        if self.generation(tenant_id) != generation {
            self.drop_cached(tenant_id).await;
        }

        Ok(subscribers)
    }

    /// Drop the cached list for a tenant.
    ///
    /// Call after the store write, so loads that read the old rows are
    /// discarded.
    pub async fn invalidate(&self, tenant_id: &str) {
        *self.generations.entry(tenant_id.to_string()).or_insert(0) += 1;
        self.drop_cached(tenant_id).await;
    }

    async fn drop_cached(&self, tenant_id: &str) {
        if let Err(e) = self.cache.invalidate(tenant_id).await {
            tracing::warn!(
                target: "subscriber_cache",
                tenant_id = %tenant_id,
                error = %e,
                "Failed to invalidate subscriber cache"
            );
        }
    }
}
