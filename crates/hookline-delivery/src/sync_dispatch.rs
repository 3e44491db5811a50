//! Synchronous dispatch path.
//!
//! Runs as a blocking publish hook: every app with a synchronous webhook for
//! the event is delivered to inline, one after another, each bounded by a
//! deadline. Every matched webhook yields a [`SyncWebhookResponse`], whatever
//! happened to it; nothing is ever returned as an error to the publisher.

use std::{fmt, sync::Arc, time::Duration};

use hookline_core::{
    models::{
        AppRegistration, DeliveryId, DeliveryMode, DeliveryPatch, DeliveryRecord, DomainEvent,
        SyncWebhookResponse, WebhookDescriptor,
    },
    AppRegistry, Clock, PublishHook,
};
use tracing::{error, info, warn};

use crate::{
    client::{DeliveryClient, DeliveryOptions, DeliveryRequest, DeliveryResponse},
    error::DeliveryError,
    ledger::DeliveryLedger,
    router::render_payload,
};

/// Delivers synchronous webhooks inline and aggregates their responses.
pub struct SyncDispatcher {
    registry: Arc<dyn AppRegistry>,
    ledger: Arc<dyn DeliveryLedger>,
    client: Arc<DeliveryClient>,
    deadline: Duration,
    clock: Arc<dyn Clock>,
}

impl SyncDispatcher {
    /// Creates a dispatcher whose deliveries are aborted after `deadline`.
    pub fn new(
        registry: Arc<dyn AppRegistry>,
        ledger: Arc<dyn DeliveryLedger>,
        client: Arc<DeliveryClient>,
        deadline: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { registry, ledger, client, deadline, clock }
    }

    /// Per-delivery deadline.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Delivers the event to every matching synchronous webhook, in registry
    /// order, and returns one response per webhook.
    ///
    /// App N+1 is not attempted until app N's ledger update has completed.
    pub async fn publish(&self, event: &DomainEvent) -> Vec<SyncWebhookResponse> {
        let apps = match self.registry.active_apps_by_event(&event.event_type).await {
            Ok(apps) => apps,
            Err(error) => {
                error!(event = %event.event_type, error = %error, "failed to look up apps");
                return Vec::new();
            },
        };

        let mut responses = Vec::new();
        for app in &apps {
            for descriptor in app.webhooks_for(&event.event_type, DeliveryMode::Sync) {
                responses.push(self.deliver_one(app, descriptor, event).await);
            }
        }
        responses
    }

    async fn deliver_one(
        &self,
        app: &AppRegistration,
        descriptor: &WebhookDescriptor,
        event: &DomainEvent,
    ) -> SyncWebhookResponse {
        let delivery_id = DeliveryId::new();

        let payload = match render_payload(descriptor, &event.payload) {
            Ok(payload) => payload,
            Err(error) => {
                error!(delivery_id = %delivery_id, app_id = %app.app_id, error = %error, "failed to render payload");
                return SyncWebhookResponse::unreachable(&app.app_id, delivery_id);
            },
        };

        let record = DeliveryRecord::pending(
            delivery_id,
            &app.app_id,
            &event.event_type,
            payload.clone(),
            self.clock.now_utc(),
        );
        if let Err(error) = self.ledger.insert(record).await {
            error!(
                delivery_id = %delivery_id,
                app_id = %app.app_id,
                error = %error,
                "failed to record delivery, not sending"
            );
            return SyncWebhookResponse::unreachable(&app.app_id, delivery_id);
        }

        let request = DeliveryRequest {
            delivery_id,
            event: event.event_type.clone(),
            url: descriptor.target_url.clone(),
            webhook_secret: app.webhook_secret.clone(),
            payload: payload.into(),
            attempt_number: 1,
        };
        let result =
            self.client.deliver(request, DeliveryOptions::with_deadline(self.deadline)).await;

        self.record_outcome(delivery_id, &app.app_id, &result).await;

        match result {
            Ok(response) => SyncWebhookResponse {
                app_id: app.app_id.clone(),
                delivery_id,
                ok: response.is_success,
                status: response.status_code,
                data: response.data(),
            },
            Err(_) => SyncWebhookResponse::unreachable(&app.app_id, delivery_id),
        }
    }

    /// The single ledger update of a synchronous delivery.
    async fn record_outcome(
        &self,
        delivery_id: DeliveryId,
        app_id: &str,
        result: &Result<DeliveryResponse, DeliveryError>,
    ) {
        let attempted_at = self.clock.now_utc();
        let patch = match result {
            Ok(response) => {
                let patch = DeliveryPatch::attempt(1, attempted_at).with_response(
                    response.status_code,
                    response.ledger_body(self.client.max_body_bytes()),
                );
                if response.is_success {
                    info!(
                        delivery_id = %delivery_id,
                        app_id,
                        status_code = response.status_code,
                        duration_ms = u64::try_from(response.duration.as_millis()).unwrap_or(u64::MAX),
                        "sync webhook delivered"
                    );
                    patch.delivered()
                } else {
                    warn!(
                        delivery_id = %delivery_id,
                        app_id,
                        status_code = response.status_code,
                        "sync webhook rejected"
                    );
                    patch.failed()
                }
            },
            Err(error) => {
                warn!(delivery_id = %delivery_id, app_id, error = %error, "sync webhook failed");
                DeliveryPatch::attempt(1, attempted_at).failed()
            },
        };

        if let Err(error) = self.ledger.update(delivery_id, patch).await {
            error!(delivery_id = %delivery_id, app_id, error = %error, "failed to record sync delivery");
        }
    }
}

impl fmt::Debug for SyncDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncDispatcher")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl PublishHook for SyncDispatcher {
    async fn on_publish(&self, event: &DomainEvent) -> Vec<SyncWebhookResponse> {
        self.publish(event).await
    }
}
