//! Event router: fans a domain event out to the queued webhooks of every
//! matching app.
//!
//! Only asynchronous descriptors are handled here. Synchronous descriptors
//! are reached through [`crate::sync_dispatch::SyncDispatcher`] alone, so a
//! single webhook is never delivered through both paths.

use std::{fmt, sync::Arc};

use hookline_core::{
    models::{
        AppRegistration, DeliveryId, DeliveryJob, DeliveryMode, DeliveryPatch, DeliveryRecord,
        DomainEvent, WebhookDescriptor,
    },
    AppRegistry, Clock, EventSubscriber,
};
use tracing::{debug, error, info};

use crate::{
    error::{DeliveryError, Result},
    ledger::DeliveryLedger,
    projection,
    queue::DeliveryQueue,
    registry::QueueRegistry,
    retry::RetryPolicy,
};

/// Body a webhook receives for an event: the payload projected through the
/// descriptor's selection query, as JSON text.
///
/// # Errors
///
/// Returns `InternalError` if the projected value cannot be serialized.
pub fn render_payload(descriptor: &WebhookDescriptor, payload: &serde_json::Value) -> Result<String> {
    let body = match descriptor.query.as_deref() {
        Some(query) => projection::project(query, payload),
        None => payload.clone(),
    };
    serde_json::to_string(&body)
        .map_err(|e| DeliveryError::internal(format!("failed to serialize payload: {e}")))
}

/// What a call to [`EventRouter::route`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSummary {
    /// Apps returned by the registry for the event type.
    pub apps_matched: usize,
    /// Delivery IDs of the enqueued jobs, in routing order.
    pub enqueued: Vec<DeliveryId>,
    /// Matched apps without a queued webhook for the event.
    pub skipped: usize,
}

/// Routes events to the asynchronous delivery queue.
pub struct EventRouter {
    registry: Arc<dyn AppRegistry>,
    ledger: Arc<dyn DeliveryLedger>,
    queue: Arc<dyn DeliveryQueue>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl EventRouter {
    /// Creates a router that enqueues with the given retry policy.
    pub fn new(
        registry: Arc<dyn AppRegistry>,
        ledger: Arc<dyn DeliveryLedger>,
        queue: Arc<dyn DeliveryQueue>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { registry, ledger, queue, policy, clock }
    }

    /// Creates a router enqueueing onto the queue registered as `queue_name`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the queue is not registered.
    pub fn from_registry(
        queues: &QueueRegistry,
        queue_name: &str,
        registry: Arc<dyn AppRegistry>,
        ledger: Arc<dyn DeliveryLedger>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self::new(registry, ledger, queues.resolve(queue_name)?, policy, clock))
    }

    /// Inserts a pending ledger row and enqueues one job per queued webhook
    /// that matches the event.
    ///
    /// A delivery that cannot be recorded or enqueued does not stop the
    /// remaining matches from being routed.
    ///
    /// # Errors
    ///
    /// Propagates a registry failure, or the first ledger or queue failure
    /// once every match has been tried. A failed insert abandons that
    /// delivery before it is enqueued. A failed enqueue resolves its row as
    /// failed. Jobs enqueued for other matches stay valid.
    pub async fn route(&self, event: &DomainEvent) -> Result<RouteSummary> {
        let apps = self.registry.active_apps_by_event(&event.event_type).await?;
        let mut summary = RouteSummary { apps_matched: apps.len(), ..RouteSummary::default() };
        let mut first_error = None;

        for app in &apps {
            let mut routed = false;
            for descriptor in app.webhooks_for(&event.event_type, DeliveryMode::Async) {
                routed = true;
                match self.dispatch(app, descriptor, event).await {
                    Ok(delivery_id) => summary.enqueued.push(delivery_id),
                    Err(error) => {
                        error!(
                            app_id = %app.app_id,
                            event = %event.event_type,
                            error = %error,
                            "failed to route delivery"
                        );
                        first_error.get_or_insert(error);
                    },
                }
            }

            if !routed {
                debug!(
                    app_id = %app.app_id,
                    event = %event.event_type,
                    "no queued webhook for event, skipping app"
                );
                summary.skipped += 1;
            }
        }

        if !summary.enqueued.is_empty() {
            info!(
                event = %event.event_type,
                jobs = summary.enqueued.len(),
                queue = self.queue.name(),
                "event routed"
            );
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(summary),
        }
    }

    async fn dispatch(
        &self,
        app: &AppRegistration,
        descriptor: &WebhookDescriptor,
        event: &DomainEvent,
    ) -> Result<DeliveryId> {
        let delivery_id = DeliveryId::new();
        let payload = render_payload(descriptor, &event.payload)?;

        self.ledger
            .insert(DeliveryRecord::pending(
                delivery_id,
                &app.app_id,
                &event.event_type,
                payload.clone(),
                self.clock.now_utc(),
            ))
            .await?;

        let job = DeliveryJob {
            delivery_id,
            app_id: app.app_id.clone(),
            webhook_secret: app.webhook_secret.clone(),
            target_url: descriptor.target_url.clone(),
            event: event.event_type.clone(),
            payload,
        };
        if let Err(error) = self.queue.enqueue(job, self.policy.clone()).await {
            self.abandon(delivery_id, &app.app_id).await;
            return Err(error);
        }

        debug!(
            delivery_id = %delivery_id,
            app_id = %app.app_id,
            event = %event.event_type,
            "delivery enqueued"
        );
        Ok(delivery_id)
    }

    /// Resolves a row that will never have a job as failed.
    async fn abandon(&self, delivery_id: DeliveryId, app_id: &str) {
        if let Err(error) = self.ledger.update(delivery_id, DeliveryPatch::default().failed()).await
        {
            error!(
                delivery_id = %delivery_id,
                app_id,
                error = %error,
                "failed to resolve unqueued delivery"
            );
        }
    }
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouter")
            .field("queue", &self.queue.name())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl EventSubscriber for EventRouter {
    async fn handle_event(&self, event: &DomainEvent) {
        if let Err(error) = self.route(event).await {
            error!(event = %event.event_type, error = %error, "failed to route event");
        }
    }
}

#[cfg(test)]
mod tests {
    use hookline_core::{
        models::{AppManifest, DeliveryStatus},
        InMemoryAppRegistry, ManualClock,
    };
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::{ledger::mock::MockDeliveryLedger, queue::MemoryDeliveryQueue};

    fn app(app_id: &str, webhooks: Vec<WebhookDescriptor>) -> AppRegistration {
        AppRegistration {
            id: Uuid::new_v4(),
            app_id: app_id.to_string(),
            webhook_secret: format!("{app_id}-secret"),
            manifest: AppManifest { webhooks },
        }
    }

    fn webhook(event: &str, query: Option<&str>, async_events: Option<bool>) -> WebhookDescriptor {
        WebhookDescriptor {
            event: event.to_string(),
            target_url: "https://receiver.test/hook".to_string(),
            query: query.map(str::to_string),
            async_events,
        }
    }

    fn router(
        apps: Vec<AppRegistration>,
    ) -> (EventRouter, MockDeliveryLedger, MemoryDeliveryQueue) {
        let clock = ManualClock::new();
        let ledger = MockDeliveryLedger::new();
        let queue = MemoryDeliveryQueue::new("webhooks", Arc::new(clock.clone()));
        let router = EventRouter::new(
            Arc::new(InMemoryAppRegistry::with_apps(apps)),
            Arc::new(ledger.clone()),
            Arc::new(queue.clone()),
            RetryPolicy::default(),
            Arc::new(clock),
        );
        (router, ledger, queue)
    }

    #[tokio::test]
    async fn projected_payload_is_recorded_and_enqueued() {
        let (router, ledger, queue) = router(vec![app(
            "app-a",
            vec![webhook("order.created", Some("subscription { order { id } }"), None)],
        )]);
        let event = DomainEvent::new("order.created", json!({"id": "1", "secret": "x"}));

        let summary = router.route(&event).await.unwrap();

        assert_eq!(summary.enqueued.len(), 1);
        let jobs = queue.jobs();
        assert_eq!(jobs[0].payload, r#"{"id":"1"}"#);
        assert_eq!(jobs[0].webhook_secret, "app-a-secret");
        let record = ledger.record(summary.enqueued[0]).unwrap();
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.payload, jobs[0].payload);
        assert_eq!(record.attempts, 0);
    }

    #[tokio::test]
    async fn sync_and_mismatched_descriptors_are_skipped() {
        let (router, ledger, queue) = router(vec![
            app("sync-only", vec![webhook("order.created", None, Some(false))]),
            app("other-event", vec![webhook("order.deleted", None, None)]),
        ]);

        let summary =
            router.route(&DomainEvent::new("order.created", json!({}))).await.unwrap();

        assert_eq!(summary.apps_matched, 1);
        assert_eq!(summary.skipped, 1);
        assert!(summary.enqueued.is_empty());
        assert!(queue.jobs().is_empty());
        assert_eq!(ledger.insert_count(), 0);
    }

    #[tokio::test]
    async fn failed_insert_abandons_delivery() {
        let (router, ledger, queue) =
            router(vec![app("app-a", vec![webhook("order.created", None, None)])]);
        ledger.fail_next_insert("disk full");

        let err = router.route(&DomainEvent::new("order.created", json!({}))).await.unwrap_err();

        assert!(matches!(err, DeliveryError::LedgerError { .. }));
        assert!(queue.jobs().is_empty());
    }

    #[tokio::test]
    async fn dual_descriptors_enqueue_only_the_async_one() {
        let (router, _ledger, queue) = router(vec![app(
            "app-a",
            vec![
                webhook("order.created", None, Some(false)),
                webhook("order.created", None, Some(true)),
            ],
        )]);

        let summary =
            router.route(&DomainEvent::new("order.created", json!({"id": 1}))).await.unwrap();

        assert_eq!(summary.enqueued.len(), 1);
        assert_eq!(queue.jobs().len(), 1);
    }

    #[test]
    fn render_without_query_keeps_payload() {
        let payload = json!({"a": 1, "b": [1, 2]});
        let body = render_payload(&webhook("e", None, None), &payload).unwrap();
        assert_eq!(serde_json::from_str::<serde_json::Value>(&body).unwrap(), payload);
    }

    #[tokio::test]
    async fn router_resolves_its_queue_from_the_registry() {
        let clock = ManualClock::new();
        let ledger = MockDeliveryLedger::new();
        let queue = MemoryDeliveryQueue::new("webhooks", Arc::new(clock.clone()));
        let mut queues = QueueRegistry::new();
        queues.register_queue(Arc::new(queue.clone())).unwrap();
        let apps: Arc<dyn AppRegistry> = Arc::new(InMemoryAppRegistry::with_apps([app(
            "app-a",
            vec![webhook("order.created", None, None)],
        )]));

        let missing = EventRouter::from_registry(
            &queues,
            "billing",
            apps.clone(),
            Arc::new(ledger.clone()),
            RetryPolicy::default(),
            Arc::new(clock.clone()),
        );
        assert!(matches!(missing, Err(DeliveryError::ConfigurationError { .. })));

        let router = EventRouter::from_registry(
            &queues,
            "webhooks",
            apps,
            Arc::new(ledger),
            RetryPolicy::default(),
            Arc::new(clock),
        )
        .unwrap();
        router.route(&DomainEvent::new("order.created", json!({}))).await.unwrap();
        assert_eq!(queue.jobs().len(), 1);
    }
}
