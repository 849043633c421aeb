//! Common test utilities for courier-webhooks integration tests.
//!
//! Provides wiremock responders for inspecting webhook requests and a
//! [`Harness`] wiring the engine's services over an in-memory store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_db::{Delivery, MemoryStore, Store};
use courier_webhooks::models::{
    CreateEventRequest, CreateEventResponse, CreateSubscriberRequest, CreateSubscriberResponse,
};
use courier_webhooks::{
    DeliveryService, EventService, MokaSubscriberCache, RetryPolicy, SecretCipher,
    SubscriberResolver, SubscriberService, UrlPolicy, WebhookDispatcher, WebhookWorker,
    WorkerConfig,
};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

pub const TENANT_A: &str = "tenant-a";
pub const TENANT_B: &str = "tenant-b";

pub const MASTER_KEY: &str = "test-master-key-for-courier";

pub const ORDER_COMPLETED: &str = "order.completed";

static INIT: Once = Once::new();

/// Initialize logging for tests (once, only when `RUST_LOG` is set).
pub fn init_test_logging() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

pub fn order_payload() -> serde_json::Value {
    serde_json::json!({
        "order_id": "ord_1001",
        "total_cents": 4599,
        "currency": "EUR"
    })
}

// ---------------------------------------------------------------------------
// CapturedRequest - for inspecting webhook requests
// ---------------------------------------------------------------------------

/// A captured HTTP request with body and headers.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl CapturedRequest {
    /// Parse the body as JSON.
    pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == name_lower)
            .map(|(_, v)| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// CaptureResponder - captures requests and returns a fixed status
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CaptureResponder {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    response_code: u16,
}

impl CaptureResponder {
    pub fn new() -> Self {
        Self::with_status(200)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_code: status,
        }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Default for CaptureResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Respond for CaptureResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let captured = CapturedRequest {
            body: request.body.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect(),
            timestamp: Utc::now(),
        };
        self.requests.lock().unwrap().push(captured);
        ResponseTemplate::new(self.response_code)
    }
}

// ---------------------------------------------------------------------------
// FailingResponder - fails N times then succeeds
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FailingResponder {
    attempt_count: Arc<AtomicU32>,
    failures_before_success: u32,
    failure_code: u16,
}

impl FailingResponder {
    /// Fail `n` times with 500, then return 200.
    pub fn fail_times(n: u32) -> Self {
        Self::fail_with_status(n, 500)
    }

    pub fn fail_with_status(n: u32, failure_code: u16) -> Self {
        Self {
            attempt_count: Arc::new(AtomicU32::new(0)),
            failures_before_success: n,
            failure_code,
        }
    }

    /// Never succeed.
    pub fn always(failure_code: u16) -> Self {
        Self::fail_with_status(u32::MAX, failure_code)
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }
}

impl Respond for FailingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.attempt_count.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            ResponseTemplate::new(self.failure_code)
        } else {
            ResponseTemplate::new(200)
        }
    }
}

// ---------------------------------------------------------------------------
// DelayedResponder - adds response delay
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct DelayedResponder {
    delay: Duration,
}

impl DelayedResponder {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
        }
    }
}

impl Respond for DelayedResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        ResponseTemplate::new(200).set_delay(self.delay)
    }
}

/// Start a mock receiver answering POST /webhook with `responder`.
pub async fn receiver<R: Respond + 'static>(responder: R) -> (MockServer, String) {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/webhook"))
        .respond_with(responder)
        .mount(&server)
        .await;
    let url = format!("{}/webhook", server.uri());
    (server, url)
}

/// A callback URL nothing listens on.
pub fn unreachable_url() -> String {
    "http://127.0.0.1:9/webhook".to_string()
}

// ---------------------------------------------------------------------------
// Harness - engine services over an in-memory store
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: MemoryStore,
    pub shared: Arc<dyn Store>,
    pub cipher: SecretCipher,
    pub resolver: SubscriberResolver,
    pub dispatcher: WebhookDispatcher,
    pub events: EventService,
    pub subscribers: SubscriberService,
    pub deliveries: DeliveryService,
}

impl Harness {
    /// Retries are due immediately so tests can drive them without waiting.
    pub fn new() -> Self {
        Self::with_policy(
            RetryPolicy::default()
                .with_schedule(vec![Duration::ZERO])
                .without_jitter(),
        )
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self::build(policy, Duration::from_secs(5))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(
            RetryPolicy::default().with_schedule(vec![Duration::ZERO]),
            timeout,
        )
    }

    fn build(policy: RetryPolicy, timeout: Duration) -> Self {
        init_test_logging();

        let store = MemoryStore::new();
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        let cipher = SecretCipher::from_master_key(MASTER_KEY);
        let resolver = SubscriberResolver::new(
            Arc::clone(&shared),
            Arc::new(MokaSubscriberCache::new(Duration::from_secs(60))),
        );
        let dispatcher = WebhookDispatcher::new(Arc::clone(&shared), cipher.clone())
            .expect("dispatcher")
            .with_retry_policy(policy)
            .with_timeout(timeout);
        let events = EventService::new(Arc::clone(&shared), resolver.clone(), dispatcher.clone());
        let subscribers = SubscriberService::new(Arc::clone(&shared), cipher.clone(), resolver.clone())
            .with_url_policy(UrlPolicy {
                allow_http: true,
                allow_internal_hosts: true,
            });
        let deliveries = DeliveryService::new(Arc::clone(&shared));

        Self {
            store,
            shared,
            cipher,
            resolver,
            dispatcher,
            events,
            subscribers,
            deliveries,
        }
    }

    pub async fn subscribe(
        &self,
        tenant_id: &str,
        url: &str,
        event_types: &[&str],
    ) -> CreateSubscriberResponse {
        self.subscribers
            .create_subscriber(CreateSubscriberRequest {
                tenant_id: tenant_id.to_string(),
                callback_url: url.to_string(),
                event_types: event_types.iter().map(|t| (*t).to_string()).collect(),
            })
            .await
            .expect("create subscriber")
    }

    pub async fn publish(&self, tenant_id: &str, event_type: &str) -> CreateEventResponse {
        self.events
            .create_event(CreateEventRequest {
                tenant_id: tenant_id.to_string(),
                event_type: event_type.to_string(),
                payload: order_payload(),
                idempotency_key: None,
            })
            .await
            .expect("create event")
    }

    /// The single delivery row for an event.
    pub async fn delivery_for(&self, event_id: Uuid) -> Delivery {
        let mut rows: Vec<Delivery> = self
            .store
            .deliveries()
            .await
            .into_iter()
            .filter(|d| d.event_id == event_id)
            .collect();
        assert_eq!(rows.len(), 1, "expected one delivery for event");
        rows.remove(0)
    }

    pub async fn reload(&self, delivery_id: Uuid) -> Delivery {
        self.shared
            .find_delivery(delivery_id)
            .await
            .expect("find delivery")
            .expect("delivery exists")
    }

    /// Worker that never sleeps long enough to matter in tests.
    pub fn worker(&self) -> WebhookWorker {
        WebhookWorker::new(
            self.dispatcher.clone(),
            WorkerConfig::default().with_poll_interval(Duration::from_millis(50)),
        )
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
