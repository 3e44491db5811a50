//! Named queues and the worker pools that consume them.
//!
//! Built once at process start and handed to the router and the engine.
//! The registry owns pool lifecycle: [`QueueRegistry::close`] shuts every
//! pool down.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tracing::{info, warn};

use hookline_core::Clock;

use crate::{
    client::DeliveryClient,
    error::{DeliveryError, Result},
    ledger::DeliveryLedger,
    queue::DeliveryQueue,
    worker::{WorkerConfig, WorkerStats},
    worker_pool::WorkerPool,
};

/// Registry of named delivery queues and their worker pools.
#[derive(Default)]
pub struct QueueRegistry {
    queues: BTreeMap<String, Arc<dyn DeliveryQueue>>,
    pools: BTreeMap<String, WorkerPool>,
}

impl QueueRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a queue under its own name.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if a queue with that name exists.
    pub fn register_queue(&mut self, queue: Arc<dyn DeliveryQueue>) -> Result<()> {
        let name = queue.name().to_string();
        if self.queues.contains_key(&name) {
            return Err(DeliveryError::configuration(format!("queue '{name}' already registered")));
        }
        self.queues.insert(name, queue);
        Ok(())
    }

    /// Registers the worker pool of an already registered queue.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the queue is unknown or already has a
    /// pool.
    pub fn register_pool(&mut self, pool: WorkerPool) -> Result<()> {
        let name = pool.queue_name().to_string();
        if !self.queues.contains_key(&name) {
            return Err(DeliveryError::configuration(format!("queue '{name}' is not registered")));
        }
        if self.pools.contains_key(&name) {
            return Err(DeliveryError::configuration(format!(
                "queue '{name}' already has a worker pool"
            )));
        }
        self.pools.insert(name, pool);
        Ok(())
    }

    /// Builds and registers a worker pool consuming the named queue.
    ///
    /// # Errors
    ///
    /// Same as [`QueueRegistry::register_pool`].
    pub fn add_pool(
        &mut self,
        name: &str,
        ledger: Arc<dyn DeliveryLedger>,
        client: Arc<DeliveryClient>,
        config: WorkerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<()> {
        let queue = self.resolve(name)?;
        self.register_pool(WorkerPool::new(queue, ledger, client, config, clock))
    }

    /// Looks up a queue by name.
    pub fn queue(&self, name: &str) -> Option<Arc<dyn DeliveryQueue>> {
        self.queues.get(name).cloned()
    }

    /// Looks up a queue that must be registered.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if no queue has that name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn DeliveryQueue>> {
        self.queue(name)
            .ok_or_else(|| DeliveryError::configuration(format!("queue '{name}' is not registered")))
    }

    /// Names of all registered queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    /// Spawns the workers of every registered pool.
    ///
    /// # Errors
    ///
    /// Returns the first pool's spawn error.
    pub async fn start(&mut self) -> Result<()> {
        for pool in self.pools.values_mut() {
            pool.spawn_workers().await?;
        }
        Ok(())
    }

    /// Runs one batch on the named queue's pool.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` for an unknown pool, or the claim error.
    pub async fn process_batch(&self, name: &str) -> Result<usize> {
        let pool = self
            .pools
            .get(name)
            .ok_or_else(|| DeliveryError::configuration(format!("no worker pool for '{name}'")))?;
        pool.process_batch().await
    }

    /// Counters of every pool, keyed by queue name.
    pub async fn stats(&self) -> BTreeMap<String, WorkerStats> {
        let mut stats = BTreeMap::new();
        for (name, pool) in &self.pools {
            stats.insert(name.clone(), pool.stats().await);
        }
        stats
    }

    /// Shuts down every pool, each within `timeout`, and forgets the queues.
    ///
    /// Every pool is asked to stop even if an earlier one times out.
    ///
    /// # Errors
    ///
    /// Returns the first shutdown error encountered.
    pub async fn close(&mut self, timeout: Duration) -> Result<()> {
        let mut first_error = None;

        for (name, pool) in std::mem::take(&mut self.pools) {
            if let Err(error) = pool.shutdown_graceful(timeout).await {
                warn!(queue = %name, error = %error, "worker pool did not shut down cleanly");
                first_error.get_or_insert(error);
            }
        }
        self.queues.clear();

        info!("queue registry closed");
        first_error.map_or(Ok(()), Err)
    }
}
