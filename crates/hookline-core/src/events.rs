//! Event bus interface and in-process implementation.
//!
//! The bus carries domain events from the platform to the delivery
//! subsystem through two channels:
//!
//! ```text
//!                  publish(event)
//! ┌──────────────┐ ───────────────▶ ┌────────────────────┐
//! │  Publisher   │                  │ InProcessEventBus  │
//! │ (platform)   │ ◀─────────────── │                    │
//! └──────────────┘  Vec<SyncWebhook │ 1. subscribers     │──▶ EventRouter (queue)
//!                        Response>  │ 2. publish hooks   │──▶ SyncDispatcher (inline)
//!                                   └────────────────────┘
//! ```
//!
//! Subscribers are fire-and-forget from the publisher's point of view: their
//! failures are logged by the subscriber and never returned. Publish hooks
//! block the publication and their responses are concatenated in
//! registration order. Subscribers complete before hooks run, so queued
//! deliveries of a publication are recorded before any inline delivery of
//! the same publication reaches the network.

use std::sync::{Arc, RwLock};

use crate::models::{DomainEvent, SyncWebhookResponse};

/// Receives every event whose type matches the subscription pattern.
#[async_trait::async_trait]
pub trait EventSubscriber: Send + Sync + std::fmt::Debug {
    /// Handles an event. Must not propagate failures to the publisher.
    async fn handle_event(&self, event: &DomainEvent);
}

/// Blocking hook invoked during publication.
#[async_trait::async_trait]
pub trait PublishHook: Send + Sync + std::fmt::Debug {
    /// Handles an event and returns per-app responses for the publisher.
    async fn on_publish(&self, event: &DomainEvent) -> Vec<SyncWebhookResponse>;
}

/// Registration side of the event bus.
pub trait EventBus: Send + Sync {
    /// Registers a fire-and-forget handler for events matching `pattern`.
    ///
    /// `*` matches every event, `order.*` matches any type starting with
    /// `order.`, anything else matches exactly.
    fn subscribe(&self, pattern: &str, handler: Arc<dyn EventSubscriber>);

    /// Registers a hook that runs inline on every publication.
    fn register_publish_hook(&self, hook: Arc<dyn PublishHook>);
}

/// Parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPattern {
    /// `*`
    Any,
    /// `prefix.*`, stored with the trailing dot.
    Prefix(String),
    /// Exact event type.
    Exact(String),
}

impl EventPattern {
    /// Parses a subscription pattern.
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Self::Any
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            Self::Prefix(prefix.to_string())
        } else {
            Self::Exact(pattern.to_string())
        }
    }

    /// Whether `event_type` matches this pattern.
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Prefix(prefix) => event_type.starts_with(prefix.as_str()),
            Self::Exact(exact) => exact == event_type,
        }
    }
}

/// Event bus living in the publishing process.
#[derive(Debug, Default)]
pub struct InProcessEventBus {
    subscribers: RwLock<Vec<(EventPattern, Arc<dyn EventSubscriber>)>>,
    hooks: RwLock<Vec<Arc<dyn PublishHook>>>,
}

impl InProcessEventBus {
    /// Creates a bus with no subscribers or hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an event and returns the responses of all publish hooks.
    pub async fn publish(&self, event: &DomainEvent) -> Vec<SyncWebhookResponse> {
        let subscribers: Vec<Arc<dyn EventSubscriber>> = self
            .subscribers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|(pattern, _)| pattern.matches(&event.event_type))
            .map(|(_, handler)| handler.clone())
            .collect();
        let hooks = self.hooks.read().unwrap_or_else(std::sync::PoisonError::into_inner).clone();

        tracing::debug!(
            event = %event.event_type,
            subscribers = subscribers.len(),
            hooks = hooks.len(),
            "publishing domain event"
        );

        futures::future::join_all(
            subscribers.iter().map(|subscriber| subscriber.handle_event(event)),
        )
        .await;

        let mut responses = Vec::new();
        for hook in hooks {
            responses.extend(hook.on_publish(event).await);
        }
        responses
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }
}

impl EventBus for InProcessEventBus {
    fn subscribe(&self, pattern: &str, handler: Arc<dyn EventSubscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((EventPattern::parse(pattern), handler));
    }

    fn register_publish_hook(&self, hook: Arc<dyn PublishHook>) {
        self.hooks.write().unwrap_or_else(std::sync::PoisonError::into_inner).push(hook);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use serde_json::json;

    use super::*;
    use crate::models::DeliveryId;

    #[derive(Debug, Default)]
    struct CountingSubscriber {
        seen: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventSubscriber for CountingSubscriber {
        async fn handle_event(&self, _event: &DomainEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    struct RecordingHook {
        app_id: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl PublishHook for RecordingHook {
        async fn on_publish(&self, event: &DomainEvent) -> Vec<SyncWebhookResponse> {
            self.log.lock().unwrap().push(format!("{}:{}", self.app_id, event.event_type));
            vec![SyncWebhookResponse::unreachable(self.app_id, DeliveryId::new())]
        }
    }

    #[test]
    fn patterns_match_as_documented() {
        assert!(EventPattern::parse("*").matches("order.created"));
        assert!(EventPattern::parse("order.*").matches("order.created"));
        assert!(!EventPattern::parse("order.*").matches("invoice.created"));
        assert!(EventPattern::parse("order.created").matches("order.created"));
        assert!(!EventPattern::parse("order.created").matches("order.created.v2"));
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers_only() {
        let bus = InProcessEventBus::new();
        let orders = Arc::new(CountingSubscriber::default());
        let invoices = Arc::new(CountingSubscriber::default());
        bus.subscribe("order.*", orders.clone());
        bus.subscribe("invoice.*", invoices.clone());

        bus.publish(&DomainEvent::new("order.created", json!({}))).await;

        assert_eq!(orders.seen.load(Ordering::SeqCst), 1);
        assert_eq!(invoices.seen.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn hook_responses_are_concatenated_in_registration_order() {
        let bus = InProcessEventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.register_publish_hook(Arc::new(RecordingHook { app_id: "first", log: log.clone() }));
        bus.register_publish_hook(Arc::new(RecordingHook { app_id: "second", log: log.clone() }));

        let responses = bus.publish(&DomainEvent::new("order.created", json!({}))).await;

        let app_ids: Vec<_> = responses.iter().map(|r| r.app_id.as_str()).collect();
        assert_eq!(app_ids, ["first", "second"]);
        assert_eq!(*log.lock().unwrap(), ["first:order.created", "second:order.created"]);
    }

    #[tokio::test]
    async fn publish_without_hooks_returns_empty() {
        let bus = InProcessEventBus::new();
        let responses = bus.publish(&DomainEvent::new("order.created", json!({}))).await;
        assert!(responses.is_empty());
    }
}
