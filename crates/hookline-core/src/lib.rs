//! Core domain models and collaborator interfaces for webhook delivery.
//!
//! Provides the domain event and app registration types, the delivery ledger
//! row with its state machine, the event bus and app registry interfaces,
//! the clock abstraction, and the PostgreSQL repositories the delivery crate
//! builds its adapters on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod registry;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{EventBus, EventPattern, EventSubscriber, InProcessEventBus, PublishHook};
pub use models::{
    AppManifest, AppRegistration, DeliveryId, DeliveryJob, DeliveryMode, DeliveryPatch,
    DeliveryRecord, DeliveryStatus, DomainEvent, SyncWebhookResponse, WebhookDescriptor,
};
pub use registry::{AppRegistry, InMemoryAppRegistry, PostgresAppRegistry};
pub use storage::Storage;
pub use time::{Clock, ManualClock, RealClock};
