//! Persistence layer for the courier webhook delivery engine.
//!
//! Holds the three entities the engine reads and writes (events, subscribers,
//! deliveries), the store traits the engine is written against, and two
//! implementations of them:
//!
//! - [`PgStore`]: PostgreSQL via `sqlx`, with embedded migrations
//! - [`MemoryStore`]: process-local maps, used by tests and local runs

pub mod error;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod store;

pub use error::DbError;
pub use migrations::run_migrations;
pub use models::{
    truncate_error, Delivery, DeliveryFailure, DeliveryFilter, DeliveryListItem, DeliveryPage,
    DeliveryStatus, DeliverySuccess, Event, FailureDisposition, NewEvent, NewSubscriber,
    RetryClaim, Subscriber,
};
pub use pool::DbPool;
pub use store::memory::MemoryStore;
pub use store::postgres::PgStore;
pub use store::{DeliveryStore, EventStore, Store, SubscriberStore};
