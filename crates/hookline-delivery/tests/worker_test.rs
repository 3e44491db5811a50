//! Retry timeline of a queued delivery, driven by a manual clock.

use std::{sync::Arc, time::Duration};

use hookline_core::{
    models::{AppManifest, AppRegistration, DeliveryStatus, WebhookDescriptor},
    DomainEvent, InMemoryAppRegistry, ManualClock,
};
use hookline_delivery::{
    ledger::mock::MockDeliveryLedger, queue::JobState, DeliveryEngine, EngineConfig,
    MemoryDeliveryQueue, RetryPolicy, WorkerConfig,
};
use serde_json::json;
use uuid::Uuid;
use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

struct Fixture {
    clock: ManualClock,
    ledger: MockDeliveryLedger,
    queue: MemoryDeliveryQueue,
    engine: DeliveryEngine,
}

fn fixture(target_url: String, policy: RetryPolicy) -> Fixture {
    let clock = ManualClock::new();
    let ledger = MockDeliveryLedger::new();
    let queue = MemoryDeliveryQueue::new("webhooks", Arc::new(clock.clone()));
    let app = AppRegistration {
        id: Uuid::new_v4(),
        app_id: "crm".to_string(),
        webhook_secret: "secret".to_string(),
        manifest: AppManifest {
            webhooks: vec![WebhookDescriptor {
                event: "order.created".to_string(),
                target_url,
                query: None,
                async_events: None,
            }],
        },
    };
    let engine = DeliveryEngine::new(
        EngineConfig {
            retry_policy: policy,
            worker: WorkerConfig { batch_size: 5, ..WorkerConfig::default() },
            ..EngineConfig::default()
        },
        Arc::new(InMemoryAppRegistry::with_apps([app])),
        Arc::new(ledger.clone()),
        Arc::new(queue.clone()),
        Arc::new(clock.clone()),
    )
    .unwrap();

    Fixture { clock, ledger, queue, engine }
}

#[tokio::test]
async fn retries_with_exponential_backoff_until_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let f = fixture(server.uri(), RetryPolicy::default());
    let summary =
        f.engine.router().route(&DomainEvent::new("order.created", json!({"id": 1}))).await.unwrap();
    let id = summary.enqueued[0];

    // Attempt 1 fails; next attempt due after 1s.
    assert_eq!(f.engine.process_batch().await.unwrap(), 1);
    f.clock.advance(Duration::from_millis(999));
    assert_eq!(f.engine.process_batch().await.unwrap(), 0);
    f.clock.advance(Duration::from_millis(1));

    // Attempt 2 fails; next attempt due after 2s.
    assert_eq!(f.engine.process_batch().await.unwrap(), 1);
    let record = f.ledger.record(id).unwrap();
    assert_eq!((record.status, record.attempts, record.response_code), (DeliveryStatus::Pending, 2, Some(503)));
    f.clock.advance(Duration::from_secs(1));
    assert_eq!(f.engine.process_batch().await.unwrap(), 0);
    f.clock.advance(Duration::from_secs(1));

    // Attempt 3 succeeds.
    assert_eq!(f.engine.process_batch().await.unwrap(), 1);
    let record = f.ledger.record(id).unwrap();
    assert_eq!(record.status, DeliveryStatus::Delivered);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.response_code, Some(200));
    assert_eq!(f.queue.job_state(id), Some(JobState::Completed));

    let attempts: Vec<_> = f.ledger.updates_for(id).iter().map(|p| p.attempts).collect();
    assert_eq!(attempts, [Some(1), Some(2), Some(3)]);

    let stats = f.engine.stats().await["webhooks"].clone();
    assert_eq!((stats.jobs_processed, stats.retried, stats.delivered), (3, 2, 1));
}

#[tokio::test]
async fn exhausted_job_is_marked_failed_with_final_attempt_count() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("still broken"))
        .expect(3)
        .mount(&server)
        .await;

    let f = fixture(server.uri(), RetryPolicy::exponential(3, Duration::ZERO));
    let summary =
        f.engine.router().route(&DomainEvent::new("order.created", json!({}))).await.unwrap();
    let id = summary.enqueued[0];

    while f.engine.process_batch().await.unwrap() > 0 {}

    let record = f.ledger.record(id).unwrap();
    assert_eq!(record.status, DeliveryStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.response_body.as_deref(), Some("still broken"));
    assert_eq!(f.queue.job_state(id), Some(JobState::Discarded));
    assert_eq!(f.queue.last_error(id).as_deref(), Some("server error: HTTP 500"));
    assert_eq!(f.engine.stats().await["webhooks"].failed, 1);
}
