//! Delivery engine wiring the router, the synchronous dispatcher and the
//! queue registry together.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use hookline_core::{AppRegistry, Clock, EventBus, PostgresAppRegistry, Storage};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    client::{ClientConfig, DeliveryClient},
    error::Result,
    ledger::{DeliveryLedger, PostgresDeliveryLedger},
    queue::{DeliveryQueue, PostgresDeliveryQueue},
    registry::QueueRegistry,
    retry::RetryPolicy,
    router::EventRouter,
    sync_dispatch::SyncDispatcher,
    worker::{WorkerConfig, WorkerStats},
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Name of the asynchronous delivery queue.
    pub queue_name: String,

    /// Worker pool settings.
    pub worker: WorkerConfig,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Policy every queued job is submitted with.
    pub retry_policy: RetryPolicy,

    /// Deadline of each synchronous delivery.
    pub sync_deadline: Duration,

    /// How long a claimed job stays hidden from other workers.
    pub job_lease: Duration,

    /// Maximum time to wait for workers on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_name: crate::DEFAULT_QUEUE_NAME.to_string(),
            worker: WorkerConfig::default(),
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            sync_deadline: Duration::from_millis(crate::DEFAULT_SYNC_DEADLINE_MS),
            job_lease: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Webhook delivery engine.
///
/// Attach it to an event bus to receive events, then `start` it to run the
/// asynchronous workers. Synchronous deliveries run on the publisher's task
/// whether or not the workers are started.
pub struct DeliveryEngine {
    config: EngineConfig,
    router: Arc<EventRouter>,
    sync_dispatcher: Arc<SyncDispatcher>,
    queues: QueueRegistry,
}

impl DeliveryEngine {
    /// Creates an engine over the given collaborators.
    ///
    /// The queue is registered in the engine's queue registry, and both the
    /// router and the worker pool resolve it from there by
    /// `config.queue_name`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the HTTP client cannot be built or the
    /// queue is not named `config.queue_name`.
    pub fn new(
        config: EngineConfig,
        apps: Arc<dyn AppRegistry>,
        ledger: Arc<dyn DeliveryLedger>,
        queue: Arc<dyn DeliveryQueue>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);

        let mut queues = QueueRegistry::new();
        queues.register_queue(queue)?;
        queues.add_pool(
            &config.queue_name,
            ledger.clone(),
            client.clone(),
            config.worker.clone(),
            clock.clone(),
        )?;

        let router = Arc::new(EventRouter::from_registry(
            &queues,
            &config.queue_name,
            apps.clone(),
            ledger.clone(),
            config.retry_policy.clone(),
            clock.clone(),
        )?);
        let sync_dispatcher =
            Arc::new(SyncDispatcher::new(apps, ledger, client, config.sync_deadline, clock));

        Ok(Self { config, router, sync_dispatcher, queues })
    }

    /// Creates an engine backed by PostgreSQL for apps, ledger and queue.
    ///
    /// # Errors
    ///
    /// See [`DeliveryEngine::new`].
    pub fn postgres(
        storage: Arc<Storage>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let queue = Arc::new(PostgresDeliveryQueue::new(
            config.queue_name.clone(),
            storage.clone(),
            clock.clone(),
            config.job_lease,
        ));
        Self::new(
            config,
            Arc::new(PostgresAppRegistry::new(storage.clone())),
            Arc::new(PostgresDeliveryLedger::new(storage)),
            queue,
            clock,
        )
    }

    /// Subscribes the router to every event and registers the synchronous
    /// dispatcher as a publish hook.
    pub fn attach(&self, bus: &dyn EventBus) {
        bus.subscribe("*", self.router.clone());
        bus.register_publish_hook(self.sync_dispatcher.clone());
        info!(queue = %self.config.queue_name, "delivery engine attached to event bus");
    }

    /// Router feeding the asynchronous queue.
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// Dispatcher for synchronous webhooks.
    pub fn sync_dispatcher(&self) -> &Arc<SyncDispatcher> {
        &self.sync_dispatcher
    }

    /// Spawns the worker pools. Returns once workers are running.
    ///
    /// # Errors
    ///
    /// Returns error if a pool fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            queue = %self.config.queue_name,
            worker_count = self.config.worker.worker_count,
            batch_size = self.config.worker.batch_size,
            "starting webhook delivery engine"
        );
        self.queues.start().await
    }

    /// Processes exactly one batch of due jobs on the engine's queue without
    /// starting background workers.
    ///
    /// # Errors
    ///
    /// Returns error if claiming the batch fails.
    pub async fn process_batch(&self) -> Result<usize> {
        self.queues.process_batch(&self.config.queue_name).await
    }

    /// Worker counters keyed by queue name.
    pub async fn stats(&self) -> BTreeMap<String, WorkerStats> {
        self.queues.stats().await
    }

    /// Stops all workers, waiting up to the configured shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers do not stop in time.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");
        self.queues.close(self.config.shutdown_timeout).await
    }
}
