//! Webhook delivery engine.
//!
//! Fans tenant events out to subscribed HTTP callbacks with HMAC-SHA256
//! signatures, retries failures with backoff behind per-destination circuit
//! breakers, and moves exhausted deliveries to a dead letter queue.

pub mod cache;
pub mod circuit_breaker;
pub mod crypto;
pub mod error;
pub mod models;
pub mod retry;
pub mod services;
pub mod signature;
pub mod validation;
pub mod worker;

pub use cache::{MokaSubscriberCache, SubscriberCache};
pub use circuit_breaker::{
    CallVerdict, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerStatus, CircuitError, CircuitState,
};
pub use crypto::SecretCipher;
pub use error::{CacheError, ErrorKind, WebhookError, WebhookResult};
pub use retry::RetryPolicy;
pub use services::delivery_service::DeliveryService;
pub use services::dispatcher::{DispatchOutcome, WebhookDispatcher};
pub use services::event_service::EventService;
pub use services::subscriber_resolver::SubscriberResolver;
pub use services::subscriber_service::SubscriberService;
pub use signature::{verify_signature_header, SignatureError, SignatureHeader};
pub use validation::UrlPolicy;
pub use worker::{CycleReport, WebhookWorker, WorkerConfig, WorkerHandle};
