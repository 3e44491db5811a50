//! Worker pool management with structured concurrency.
//!
//! A pool owns the worker tasks of one queue: it spawns them, tracks their
//! handles and shuts them down within a timeout.

use std::{sync::Arc, time::Duration};

use hookline_core::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    client::DeliveryClient,
    error::{DeliveryError, Result},
    ledger::DeliveryLedger,
    queue::DeliveryQueue,
    worker::{DeliveryWorker, WorkerConfig, WorkerStats},
};

/// Supervised set of delivery workers for one queue.
pub struct WorkerPool {
    queue: Arc<dyn DeliveryQueue>,
    ledger: Arc<dyn DeliveryLedger>,
    client: Arc<DeliveryClient>,
    config: WorkerConfig,
    stats: Arc<RwLock<WorkerStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    /// Creates a pool. No worker runs until [`WorkerPool::spawn_workers`].
    pub fn new(
        queue: Arc<dyn DeliveryQueue>,
        ledger: Arc<dyn DeliveryLedger>,
        client: Arc<DeliveryClient>,
        config: WorkerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            ledger,
            client,
            config,
            stats: Arc::new(RwLock::new(WorkerStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Name of the queue this pool consumes.
    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    /// Shared counters of this pool's workers.
    pub fn stats_handle(&self) -> Arc<RwLock<WorkerStats>> {
        self.stats.clone()
    }

    /// Snapshot of the pool's counters.
    pub async fn stats(&self) -> WorkerStats {
        self.stats.read().await.clone()
    }

    fn worker(&self, id: usize) -> DeliveryWorker {
        DeliveryWorker::new(
            id,
            self.queue.clone(),
            self.ledger.clone(),
            self.client.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        )
    }

    /// Spawns the configured number of workers.
    ///
    /// Returns immediately after spawning. Calling it on a running pool is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` when the pool is configured with zero
    /// workers or a zero batch size.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        if self.config.worker_count == 0 || self.config.batch_size == 0 {
            return Err(DeliveryError::configuration(
                "worker pool needs at least one worker and a non-zero batch size",
            ));
        }
        if !self.worker_handles.is_empty() {
            return Ok(());
        }

        info!(
            queue = self.queue.name(),
            worker_count = self.config.worker_count,
            "spawning delivery workers"
        );

        self.stats.write().await.active_workers = self.config.worker_count;

        for worker_id in 0..self.config.worker_count {
            let worker = self.worker(worker_id);
            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }
                result
            });
            self.worker_handles.push(handle);
        }

        Ok(())
    }

    /// Runs one batch on a temporary worker, without spawning tasks.
    ///
    /// # Errors
    ///
    /// Returns error if claiming the batch fails.
    pub async fn process_batch(&self) -> Result<usize> {
        self.worker(0).process_batch().await
    }

    /// Signals cancellation and waits for every worker to finish its current
    /// job.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the workers do not stop within `timeout`.
    /// A panicked worker is logged and does not fail the shutdown.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            queue = self.queue.name(),
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let shutdown_future = async move {
            let mut panicked = 0_usize;
            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker completed with error during shutdown");
                    },
                    Err(join_error) => {
                        panicked += 1;
                        let error = DeliveryError::WorkerPanic { message: join_error.to_string() };
                        error!(worker_id, error = %error, "worker task panicked during shutdown");
                    },
                }
            }
            stats.write().await.active_workers = 0;
            panicked
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(panicked) => {
                if panicked > 0 {
                    warn!(panicked, "some workers panicked before shutdown");
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout_seconds: timeout.as_secs() })
            },
        }
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active_count,
                "worker pool dropped without shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use hookline_core::{ManualClock, RealClock};

    use super::*;
    use crate::{ledger::mock::MockDeliveryLedger, queue::MemoryDeliveryQueue};

    fn pool(config: WorkerConfig) -> WorkerPool {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        WorkerPool::new(
            Arc::new(MemoryDeliveryQueue::new("webhooks", clock.clone())),
            Arc::new(MockDeliveryLedger::new()),
            Arc::new(DeliveryClient::with_defaults().unwrap()),
            config,
            clock,
        )
    }

    fn fast_config(worker_count: usize) -> WorkerConfig {
        WorkerConfig {
            worker_count,
            poll_interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn spawns_configured_number_of_workers() {
        let mut pool = pool(fast_config(5));
        pool.spawn_workers().await.unwrap();

        assert_eq!(pool.worker_handles.len(), 5);
        assert!(pool.has_active_workers());
        assert_eq!(pool.stats().await.active_workers, 5);

        let stats = pool.stats_handle();
        pool.shutdown_graceful(Duration::from_secs(2)).await.unwrap();
        assert_eq!(stats.read().await.active_workers, 0);
    }

    #[tokio::test]
    async fn zero_workers_is_a_configuration_error() {
        let mut pool = pool(fast_config(0));
        let err = pool.spawn_workers().await.unwrap_err();
        assert!(matches!(err, DeliveryError::ConfigurationError { .. }));
    }

    #[tokio::test]
    async fn shutdown_without_spawn_completes() {
        let pool = pool(fast_config(2));
        assert!(!pool.has_active_workers());
        pool.shutdown_graceful(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn drop_cancels_running_workers() {
        let mut pool = pool(fast_config(2));
        pool.spawn_workers().await.unwrap();
        let token = pool.cancellation_token.clone();

        drop(pool);

        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn process_batch_on_empty_queue_claims_nothing() {
        let clock = ManualClock::new();
        let pool = WorkerPool::new(
            Arc::new(MemoryDeliveryQueue::new("webhooks", Arc::new(clock.clone()))),
            Arc::new(MockDeliveryLedger::new()),
            Arc::new(DeliveryClient::with_defaults().unwrap()),
            WorkerConfig::default(),
            Arc::new(clock),
        );
        assert_eq!(pool.process_batch().await.unwrap(), 0);
    }
}
