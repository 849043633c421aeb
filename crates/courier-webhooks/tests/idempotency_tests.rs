//! Integration tests for event ingestion: idempotency keys and input
//! validation.

mod common;

use common::*;
use courier_webhooks::models::CreateEventRequest;
use courier_webhooks::{ErrorKind, WebhookError};

fn request(key: Option<&str>) -> CreateEventRequest {
    CreateEventRequest {
        tenant_id: TENANT_A.to_string(),
        event_type: ORDER_COMPLETED.to_string(),
        payload: order_payload(),
        idempotency_key: key.map(str::to_string),
    }
}

#[tokio::test]
async fn test_duplicate_idempotency_key_is_rejected_without_dispatch() {
    let h = Harness::new();
    let capture = CaptureResponder::new();
    let (_s1, url1) = receiver(capture.clone()).await;
    let (_s2, url2) = receiver(capture.clone()).await;
    h.subscribe(TENANT_A, &url1, &[ORDER_COMPLETED]).await;
    h.subscribe(TENANT_A, &url2, &[ORDER_COMPLETED]).await;

    let first = h
        .events
        .create_event(request(Some("order-1001-completed")))
        .await
        .unwrap();
    assert_eq!(first.matched_subscribers, 2);

    let err = h
        .events
        .create_event(request(Some("order-1001-completed")))
        .await
        .unwrap_err();

    match &err {
        WebhookError::DuplicateEvent {
            event_id,
            matched_subscribers,
        } => {
            assert_eq!(*event_id, first.event_id);
            assert_eq!(*matched_subscribers, 2);
        }
        other => panic!("expected DuplicateEvent, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Conflict);

    assert_eq!(h.store.event_count().await, 1);
    assert_eq!(h.store.deliveries().await.len(), 2);
    assert_eq!(capture.request_count(), 2);
}

#[tokio::test]
async fn test_events_without_key_are_independent() {
    let h = Harness::new();
    let a = h.events.create_event(request(None)).await.unwrap();
    let b = h.events.create_event(request(None)).await.unwrap();

    assert_ne!(a.event_id, b.event_id);
    assert_eq!(h.store.event_count().await, 2);
}

#[tokio::test]
async fn test_distinct_keys_create_distinct_events() {
    let h = Harness::new();
    h.events.create_event(request(Some("k-1"))).await.unwrap();
    h.events.create_event(request(Some("k-2"))).await.unwrap();
    assert_eq!(h.store.event_count().await, 2);
}

#[tokio::test]
async fn test_invalid_requests_write_nothing() {
    let h = Harness::new();

    let mut cases = Vec::new();

    let mut r = request(None);
    r.tenant_id = String::new();
    cases.push(r);

    let mut r = request(None);
    r.event_type = "x".repeat(101);
    cases.push(r);

    let mut r = request(None);
    r.event_type = "order completed".to_string();
    cases.push(r);

    let mut r = request(None);
    r.payload = serde_json::Value::Null;
    cases.push(r);

    cases.push(request(Some(&"k".repeat(101))));

    for case in cases {
        let err = h.events.create_event(case).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{err}");
    }
    assert_eq!(h.store.event_count().await, 0);
}

#[tokio::test]
async fn test_payload_is_stored_verbatim() {
    let h = Harness::new();
    let created = h.events.create_event(request(None)).await.unwrap();

    let event = h.events.get_event(created.event_id).await.unwrap();
    let stored: serde_json::Value = serde_json::from_str(&event.payload).unwrap();
    assert_eq!(stored, order_payload());
    assert_eq!(event.tenant_id, TENANT_A);
}

#[tokio::test]
async fn test_unknown_event_is_not_found() {
    let h = Harness::new();
    let err = h.events.get_event(uuid::Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
