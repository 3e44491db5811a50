//! Webhook delivery for domain events.
//!
//! Fans domain events out to registered apps over signed HTTP POSTs, in two
//! modes: a synchronous mode that delivers inline during publication and
//! returns every receiver's response to the publisher, and an asynchronous
//! mode that queues the delivery and retries it with exponential backoff.
//!
//! # Architecture
//!
//! Every delivery gets its own ledger row, inserted before the first network
//! call and patched once per attempt:
//!
//! 1. **Route** - [`EventRouter`] matches the event against the app registry
//!    and enqueues one job per asynchronous webhook
//! 2. **Project** - [`projection::project`] trims the payload to the fields
//!    the receiver selected
//! 3. **Deliver** - [`DeliveryClient`] signs and POSTs the body, bounded by a
//!    deadline on the synchronous path
//! 4. **Settle** - workers record the outcome and the queue reschedules
//!    failures until the [`RetryPolicy`] is exhausted
//!
//! Synchronous webhooks are handled by [`SyncDispatcher`] alone, running as a
//! publish hook on the event bus.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookline_core::{InProcessEventBus, RealClock, Storage};
//! use hookline_delivery::{DeliveryEngine, DeliveryError, EngineConfig};
//!
//! # async fn example(storage: Arc<Storage>) -> Result<(), DeliveryError> {
//! let bus = InProcessEventBus::new();
//! let mut engine =
//!     DeliveryEngine::postgres(storage, EngineConfig::default(), Arc::new(RealClock::new()))?;
//!
//! engine.attach(&bus);
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod projection;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod router;
pub mod signing;
pub mod sync_dispatch;
pub mod worker;
pub mod worker_pool;

pub use client::{ClientConfig, DeliveryClient, DeliveryOptions, DeliveryRequest, DeliveryResponse};
pub use engine::{DeliveryEngine, EngineConfig};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use ledger::{DeliveryLedger, PostgresDeliveryLedger};
pub use queue::{DeliveryQueue, MemoryDeliveryQueue, PostgresDeliveryQueue, QueuedJob};
pub use registry::QueueRegistry;
pub use retry::{BackoffStrategy, DeliveryOutcome, RetryContext, RetryDecision, RetryPolicy};
pub use router::{EventRouter, RouteSummary};
pub use sync_dispatch::SyncDispatcher;
pub use worker::{DeliveryWorker, WorkerConfig, WorkerStats};
pub use worker_pool::WorkerPool;

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default number of jobs claimed per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Default number of delivery attempts for queued jobs.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry, in milliseconds.
pub const DEFAULT_BACKOFF_DELAY_MS: u64 = 1000;

/// Default deadline of a synchronous delivery, in milliseconds.
pub const DEFAULT_SYNC_DEADLINE_MS: u64 = 5000;

/// Default name of the asynchronous delivery queue.
pub const DEFAULT_QUEUE_NAME: &str = "webhooks";
