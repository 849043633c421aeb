//! PostgreSQL store tests.
//!
//! Run with: `DATABASE_URL=postgres://... cargo test -p courier-db --features integration`

#![cfg(feature = "integration")]

mod common;

use chrono::{Duration, Utc};
use common::*;
use courier_db::{
    run_migrations, DbPool, DeliveryFilter, DeliveryStatus, DeliveryStore, DeliverySuccess,
    EventStore, FailureDisposition, NewEvent, PgStore, RetryClaim,
};
use uuid::Uuid;

async fn store() -> PgStore {
    init_test_logging();
    let pool = DbPool::connect(&database_url())
        .await
        .expect("Failed to connect. Is PostgreSQL running and DATABASE_URL set?");
    run_migrations(&pool).await.expect("migrations");
    PgStore::new(pool)
}

#[tokio::test]
async fn test_pg_duplicate_idempotency_key_conflicts() {
    let store = store().await;
    let key = format!("idem-{}", Uuid::new_v4());
    let input = NewEvent {
        tenant_id: unique_tenant(),
        event_type: "order.completed".to_string(),
        payload: "{}".to_string(),
        idempotency_key: Some(key.clone()),
    };

    let first = store.insert_event(input.clone()).await.unwrap();
    let err = store.insert_event(input).await.unwrap_err();

    assert!(err.is_conflict());
    let found = store
        .find_event_by_idempotency_key(&key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, first.id);
}

#[tokio::test]
async fn test_pg_create_delivery_once_per_pair() {
    let store = store().await;
    let tenant = unique_tenant();
    let event = seed_event(&store, &tenant).await;
    let subscriber = seed_subscriber(&store, &tenant, &["order.completed"]).await;

    let first = store.create_delivery(event.id, subscriber.id).await.unwrap();
    let second = store.create_delivery(event.id, subscriber.id).await.unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(store.count_deliveries_for_event(event.id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_pg_retry_lifecycle() {
    let store = store().await;
    let tenant = unique_tenant();
    let now = Utc::now();
    let delivery = seed_failed_delivery(&store, &tenant, now - Duration::seconds(1)).await;
    let owner = Uuid::new_v4();

    let claimed = store
        .claim_due_retries(RetryClaim {
            now,
            max_attempts: 5,
            limit: 1000,
            owner,
            lease_until: now + Duration::minutes(2),
        })
        .await
        .unwrap();
    assert!(claimed.iter().any(|d| d.id == delivery.id));

    let started = store
        .begin_retry(delivery.id, Some(owner), 5, now, now + Duration::minutes(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(started.status, DeliveryStatus::Retrying);
    assert_eq!(started.attempt_number, 2);
    assert!(started.next_retry_at.is_none());

    store
        .mark_success(
            delivery.id,
            DeliverySuccess {
                http_status_code: 204,
                duration_ms: 9,
            },
        )
        .await
        .unwrap();
    let stored = store.find_delivery(delivery.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Success);
    assert_eq!(stored.http_status_code, Some(204));
    assert!(stored.lease_owner.is_none());
}

#[tokio::test]
async fn test_pg_dead_letter_and_listing() {
    let store = store().await;
    let tenant = unique_tenant();
    let delivery = seed_delivery(&store, &tenant).await;

    store
        .mark_failed(delivery.id, failure(FailureDisposition::DeadLetter))
        .await
        .unwrap();

    let page = store
        .list_deliveries(&DeliveryFilter {
            subscriber_id: Some(delivery.subscriber_id),
            status: Some(DeliveryStatus::Dlq),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total_count, 1);
    assert_eq!(page.items[0].delivery.id, delivery.id);
    assert_eq!(page.items[0].tenant_id, tenant);
    assert_eq!(page.items[0].event_type, "order.completed");
}
