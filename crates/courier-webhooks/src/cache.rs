//! Per-tenant subscriber list cache.
//!
//! The resolver reads through a [`SubscriberCache`]; the concrete client is
//! injected. [`MokaSubscriberCache`] keeps entries in process, and
//! [`RedisSubscriberCache`] (feature `redis`) shares them between instances.

use std::time::Duration;

use async_trait::async_trait;
use courier_db::Subscriber;
use moka::future::Cache;

use crate::error::CacheError;

/// Default time-to-live for cached subscriber lists.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Cache key for a tenant's active subscribers.
#[must_use]
pub fn tenant_key(tenant_id: &str) -> String {
    format!("subs:{tenant_id}")
}

/// Storage for active-subscriber lists keyed by tenant.
#[async_trait]
pub trait SubscriberCache: Send + Sync {
    async fn get(&self, tenant_id: &str) -> Result<Option<Vec<Subscriber>>, CacheError>;

    async fn put(&self, tenant_id: &str, subscribers: &[Subscriber]) -> Result<(), CacheError>;

    async fn invalidate(&self, tenant_id: &str) -> Result<(), CacheError>;
}

// ---------------------------------------------------------------------------
// In-process cache
// ---------------------------------------------------------------------------

/// In-memory cache backed by moka.
#[derive(Clone)]
pub struct MokaSubscriberCache {
    cache: Cache<String, Vec<Subscriber>>,
}

impl MokaSubscriberCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(ttl)
            .build();
        Self { cache }
    }
}

impl Default for MokaSubscriberCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

#[async_trait]
impl SubscriberCache for MokaSubscriberCache {
    async fn get(&self, tenant_id: &str) -> Result<Option<Vec<Subscriber>>, CacheError> {
        Ok(self.cache.get(&tenant_key(tenant_id)).await)
    }

    async fn put(&self, tenant_id: &str, subscribers: &[Subscriber]) -> Result<(), CacheError> {
        self.cache
            .insert(tenant_key(tenant_id), subscribers.to_vec())
            .await;
        Ok(())
    }

    async fn invalidate(&self, tenant_id: &str) -> Result<(), CacheError> {
        self.cache.invalidate(&tenant_key(tenant_id)).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis cache
// ---------------------------------------------------------------------------

#[cfg(feature = "redis")]
pub use self::redis_cache::RedisSubscriberCache;

#[cfg(feature = "redis")]
mod redis_cache {
    use std::time::Duration;

    use async_trait::async_trait;
    use courier_db::Subscriber;
    use deadpool_redis::redis::{AsyncCommands, RedisError};
    use deadpool_redis::{Connection, Pool};

    use super::{tenant_key, SubscriberCache, DEFAULT_CACHE_TTL};
    use crate::error::CacheError;

    /// Shared cache stored as JSON strings with `SET EX`.
    #[derive(Clone)]
    pub struct RedisSubscriberCache {
        pool: Pool,
        ttl: Duration,
    }

    impl RedisSubscriberCache {
        #[must_use]
        pub fn new(pool: Pool) -> Self {
            Self {
                pool,
                ttl: DEFAULT_CACHE_TTL,
            }
        }

        #[must_use]
        pub fn with_ttl(mut self, ttl: Duration) -> Self {
            self.ttl = ttl;
            self
        }

        async fn conn(&self) -> Result<Connection, CacheError> {
            self.pool
                .get()
                .await
                .map_err(|e| CacheError::Unavailable(e.to_string()))
        }
    }

    fn redis_err(e: RedisError) -> CacheError {
        CacheError::Unavailable(e.to_string())
    }

    #[async_trait]
    impl SubscriberCache for RedisSubscriberCache {
        async fn get(&self, tenant_id: &str) -> Result<Option<Vec<Subscriber>>, CacheError> {
            let mut conn = self.conn().await?;
            let raw: Option<String> = conn.get(tenant_key(tenant_id)).await.map_err(redis_err)?;
            match raw {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        }

        async fn put(&self, tenant_id: &str, subscribers: &[Subscriber]) -> Result<(), CacheError> {
            let json = serde_json::to_string(subscribers)?;
            let mut conn = self.conn().await?;
            let (): () = conn
                .set_ex(tenant_key(tenant_id), json, self.ttl.as_secs().max(1))
                .await
                .map_err(redis_err)?;
            tracing::debug!(
                target: "subscriber_cache",
                tenant_id = %tenant_id,
                count = subscribers.len(),
                "Cached subscriber list"
            );
            Ok(())
        }

        async fn invalidate(&self, tenant_id: &str) -> Result<(), CacheError> {
            let mut conn = self.conn().await?;
            let (): () = conn.del(tenant_key(tenant_id)).await.map_err(redis_err)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn subscriber(tenant: &str) -> Subscriber {
        Subscriber {
            id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            callback_url: "https://example.com/hook".to_string(),
            event_types: vec!["order.completed".to_string()],
            secret_encrypted: "enc".to_string(),
            key_id: "0123456789abcdef".to_string(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_tenant_key() {
        assert_eq!(tenant_key("acme"), "subs:acme");
    }

    #[tokio::test]
    async fn test_moka_put_get_invalidate() {
        let cache = MokaSubscriberCache::default();
        assert!(cache.get("acme").await.unwrap().is_none());

        let subs = vec![subscriber("acme")];
        cache.put("acme", &subs).await.unwrap();
        assert_eq!(cache.get("acme").await.unwrap(), Some(subs));
        assert!(cache.get("other").await.unwrap().is_none());

        cache.invalidate("acme").await.unwrap();
        assert!(cache.get("acme").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_moka_caches_empty_list() {
        let cache = MokaSubscriberCache::default();
        cache.put("acme", &[]).await.unwrap();
        assert_eq!(cache.get("acme").await.unwrap(), Some(vec![]));
    }
}
