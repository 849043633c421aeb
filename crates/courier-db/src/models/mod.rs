//! Row types and write inputs for the courier tables.

pub mod delivery;
pub mod event;
pub mod subscriber;

pub use delivery::{
    truncate_error, Delivery, DeliveryFailure, DeliveryFilter, DeliveryListItem, DeliveryPage,
    DeliveryStatus, DeliverySuccess, FailureDisposition, RetryClaim, DEFAULT_PAGE_SIZE,
    MAX_ERROR_MESSAGE_LEN, MAX_PAGE_SIZE,
};
pub use event::{Event, NewEvent};
pub use subscriber::{NewSubscriber, Subscriber};
