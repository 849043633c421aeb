//! Business logic services for the delivery engine.

pub mod delivery_service;
pub mod dispatcher;
pub mod event_service;
pub mod subscriber_resolver;
pub mod subscriber_service;
