//! Asynchronous delivery worker.
//!
//! A worker claims due jobs from its queue and, per job, calls the delivery
//! transport, records the attempt in the ledger, and settles the claim with
//! the queue according to the job's retry policy. When no retry remains the
//! terminal failure handler marks the ledger row failed.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hookline_core::{
    models::{DeliveryId, DeliveryPatch},
    Clock,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{DeliveryClient, DeliveryOptions, DeliveryRequest},
    error::Result,
    ledger::DeliveryLedger,
    queue::{DeliveryQueue, QueuedJob},
    retry::{DeliveryOutcome, RetryContext, RetryDecision},
};

/// Per-worker polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of workers a pool spawns.
    pub worker_count: usize,

    /// Maximum jobs to claim per batch.
    pub batch_size: usize,

    /// How long an idle worker waits before polling again.
    pub poll_interval: Duration,

    /// How long a worker backs off after a failed claim.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Counters shared by every worker of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Number of running workers.
    pub active_workers: usize,
    /// Attempts made since startup.
    pub jobs_processed: u64,
    /// Jobs delivered.
    pub delivered: u64,
    /// Failed attempts that were rescheduled.
    pub retried: u64,
    /// Jobs given up on.
    pub failed: u64,
    /// Attempts currently in flight.
    pub in_flight: u64,
}

/// Worker that consumes one queue.
pub struct DeliveryWorker {
    id: usize,
    queue: Arc<dyn DeliveryQueue>,
    ledger: Arc<dyn DeliveryLedger>,
    client: Arc<DeliveryClient>,
    config: WorkerConfig,
    stats: Arc<RwLock<WorkerStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        queue: Arc<dyn DeliveryQueue>,
        ledger: Arc<dyn DeliveryLedger>,
        client: Arc<DeliveryClient>,
        config: WorkerConfig,
        stats: Arc<RwLock<WorkerStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, queue, ledger, client, config, stats, cancellation_token, clock }
    }

    /// Claims and processes jobs until cancelled.
    ///
    /// # Errors
    ///
    /// Never returns an error today; claim failures are logged and retried
    /// after `error_backoff`.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, queue = self.queue.name(), "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        error = %error,
                        "worker batch processing failed"
                    );
                    tokio::select! {
                        () = self.clock.sleep(self.config.error_backoff) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Claims one batch and processes every job in it.
    ///
    /// Returns the number of jobs claimed.
    ///
    /// # Errors
    ///
    /// Returns error if the claim fails. Failures of individual jobs are
    /// logged and do not abort the batch.
    pub async fn process_batch(&self) -> Result<usize> {
        let jobs = self.queue.claim(self.config.batch_size).await?;
        let batch_size = jobs.len();

        if batch_size > 0 {
            debug!(worker_id = self.id, batch_size, "processing job batch");
        }

        for job in jobs {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let delivery_id = job.job.delivery_id;
            if let Err(error) = self.process_job(job).await {
                error!(
                    worker_id = self.id,
                    delivery_id = %delivery_id,
                    error = %error,
                    "job processing failed"
                );
            }
        }

        Ok(batch_size)
    }

    /// Makes one delivery attempt for a claimed job and settles the claim.
    ///
    /// # Errors
    ///
    /// Returns error if the queue cannot be settled. Ledger failures are
    /// logged; the queue's view of the job wins.
    async fn process_job(&self, queued: QueuedJob) -> Result<()> {
        let QueuedJob { job, policy, attempts_made } = queued;
        let attempt = attempts_made.saturating_add(1);

        debug!(
            worker_id = self.id,
            delivery_id = %job.delivery_id,
            app_id = %job.app_id,
            attempt,
            "attempting webhook delivery"
        );

        self.stats.write().await.in_flight += 1;
        let result = self
            .client
            .deliver(DeliveryRequest::from_job(&job, attempt), DeliveryOptions::default())
            .await;
        {
            let mut stats = self.stats.write().await;
            stats.in_flight = stats.in_flight.saturating_sub(1);
            stats.jobs_processed += 1;
        }

        let outcome = DeliveryOutcome::classify(result);
        let attempted_at = self.clock.now_utc();
        self.record_attempt(job.delivery_id, attempt, attempted_at, &outcome).await;

        match outcome {
            DeliveryOutcome::Success(response) => {
                self.queue.complete(job.delivery_id, attempt).await?;
                self.stats.write().await.delivered += 1;
                info!(
                    worker_id = self.id,
                    delivery_id = %job.delivery_id,
                    app_id = %job.app_id,
                    status_code = response.status_code,
                    duration_ms = u64::try_from(response.duration.as_millis()).unwrap_or(u64::MAX),
                    attempt,
                    "webhook delivered"
                );
            },
            DeliveryOutcome::RetryableFailure { error, .. } => {
                let context = RetryContext::new(attempt, true, attempted_at, policy);
                self.settle_failure(job.delivery_id, attempt, context, error.to_string()).await?;
            },
            DeliveryOutcome::TerminalFailure { error } => {
                let context = RetryContext::new(attempt, false, attempted_at, policy);
                self.settle_failure(job.delivery_id, attempt, context, error.to_string()).await?;
            },
        }

        Ok(())
    }

    async fn settle_failure(
        &self,
        delivery_id: DeliveryId,
        attempt: u32,
        context: RetryContext,
        error: String,
    ) -> Result<()> {
        match context.decide() {
            RetryDecision::Retry { next_attempt_at } => {
                self.queue.reschedule(delivery_id, attempt, next_attempt_at, error.clone()).await?;
                self.stats.write().await.retried += 1;
                warn!(
                    worker_id = self.id,
                    delivery_id = %delivery_id,
                    attempt,
                    next_attempt_at = %next_attempt_at,
                    error = %error,
                    "delivery failed, retry scheduled"
                );
            },
            RetryDecision::GiveUp { reason } => {
                self.queue.discard(delivery_id, attempt, error.clone()).await?;
                self.stats.write().await.failed += 1;
                self.on_retries_exhausted(delivery_id, attempt, &reason, &error).await;
            },
        }
        Ok(())
    }

    /// Per-attempt ledger update: attempt count, time and response.
    async fn record_attempt(
        &self,
        delivery_id: DeliveryId,
        attempt: u32,
        attempted_at: DateTime<Utc>,
        outcome: &DeliveryOutcome,
    ) {
        let mut patch = DeliveryPatch::attempt(attempt, attempted_at);
        if let Some(response) = outcome.response() {
            patch = patch.with_response(
                response.status_code,
                response.ledger_body(self.client.max_body_bytes()),
            );
        }
        if outcome.is_success() {
            patch = patch.delivered();
        }

        if let Err(error) = self.ledger.update(delivery_id, patch).await {
            error!(
                worker_id = self.id,
                delivery_id = %delivery_id,
                attempt,
                error = %error,
                "failed to record delivery attempt"
            );
        }
    }

    /// Terminal failure handler. Runs once per job; marking an already
    /// failed row again is a no-op, so it is safe to repeat.
    async fn on_retries_exhausted(
        &self,
        delivery_id: DeliveryId,
        attempts: u32,
        reason: &str,
        last_error: &str,
    ) {
        let patch = DeliveryPatch {
            attempts: Some(i32::try_from(attempts).unwrap_or(i32::MAX)),
            ..DeliveryPatch::default()
        }
        .failed();

        if let Err(ledger_error) = self.ledger.update(delivery_id, patch).await {
            error!(
                worker_id = self.id,
                delivery_id = %delivery_id,
                error = %ledger_error,
                "failed to mark delivery as failed"
            );
        }

        error!(
            worker_id = self.id,
            delivery_id = %delivery_id,
            attempts,
            reason,
            last_error,
            "delivery failed permanently"
        );
    }
}

#[cfg(test)]
mod tests {
    use hookline_core::{
        models::{DeliveryJob, DeliveryRecord, DeliveryStatus},
        ManualClock,
    };
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{
        client::ClientConfig,
        ledger::mock::MockDeliveryLedger,
        queue::{JobState, MemoryDeliveryQueue},
        retry::RetryPolicy,
    };

    struct Harness {
        clock: ManualClock,
        queue: MemoryDeliveryQueue,
        ledger: MockDeliveryLedger,
        worker: DeliveryWorker,
        stats: Arc<RwLock<WorkerStats>>,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new();
        let queue = MemoryDeliveryQueue::new("webhooks", Arc::new(clock.clone()));
        let ledger = MockDeliveryLedger::new();
        let stats = Arc::new(RwLock::new(WorkerStats::default()));
        let client = DeliveryClient::new(ClientConfig {
            timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        })
        .unwrap();

        let worker = DeliveryWorker::new(
            0,
            Arc::new(queue.clone()),
            Arc::new(ledger.clone()),
            Arc::new(client),
            WorkerConfig::default(),
            stats.clone(),
            CancellationToken::new(),
            Arc::new(clock.clone()),
        );

        Harness { clock, queue, ledger, worker, stats }
    }

    async fn enqueue(harness: &Harness, url: String, policy: RetryPolicy) -> DeliveryId {
        let job = DeliveryJob {
            delivery_id: DeliveryId::new(),
            app_id: "app-a".to_string(),
            webhook_secret: "secret".to_string(),
            target_url: url,
            event: "order.created".to_string(),
            payload: r#"{"id":"1"}"#.to_string(),
        };
        let id = job.delivery_id;
        harness
            .ledger
            .insert(DeliveryRecord::pending(
                id,
                "app-a",
                "order.created",
                r#"{"id":"1"}"#,
                harness.clock.now_utc(),
            ))
            .await
            .unwrap();
        harness.queue.enqueue(job, policy).await.unwrap();
        id
    }

    #[tokio::test]
    async fn successful_attempt_marks_row_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200).set_body_string("thanks"))
            .expect(1)
            .mount(&server)
            .await;

        let harness = harness();
        let id = enqueue(&harness, format!("{}/hook", server.uri()), RetryPolicy::default()).await;

        assert_eq!(harness.worker.process_batch().await.unwrap(), 1);

        let record = harness.ledger.record(id).unwrap();
        assert_eq!(record.status, DeliveryStatus::Delivered);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.response_code, Some(200));
        assert_eq!(record.response_body.as_deref(), Some("thanks"));
        assert_eq!(harness.queue.job_state(id), Some(JobState::Completed));
        assert_eq!(harness.stats.read().await.delivered, 1);
    }

    #[tokio::test]
    async fn rejected_attempt_is_rescheduled_with_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let harness = harness();
        let id = enqueue(&harness, server.uri(), RetryPolicy::default()).await;
        let started = harness.clock.now_utc();

        harness.worker.process_batch().await.unwrap();

        let record = harness.ledger.record(id).unwrap();
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.response_code, Some(500));
        assert_eq!(harness.queue.job_state(id), Some(JobState::Waiting));
        assert_eq!(harness.queue.next_attempt_at(id), Some(started + chrono::Duration::seconds(1)));

        assert_eq!(harness.worker.process_batch().await.unwrap(), 0);
        assert_eq!(harness.stats.read().await.retried, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_row_failed_once() {
        let harness = harness();
        let policy = RetryPolicy::exponential(3, Duration::ZERO);
        let id = enqueue(&harness, "http://127.0.0.1:1/hook".to_string(), policy).await;

        for _ in 0..3 {
            assert_eq!(harness.worker.process_batch().await.unwrap(), 1);
        }
        assert_eq!(harness.worker.process_batch().await.unwrap(), 0);

        let record = harness.ledger.record(id).unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert_eq!(record.response_code, None);

        let failed_marks = harness
            .ledger
            .updates_for(id)
            .into_iter()
            .filter(|patch| patch.status == Some(DeliveryStatus::Failed))
            .count();
        assert_eq!(failed_marks, 1);
        assert_eq!(harness.queue.job_state(id), Some(JobState::Discarded));
        assert_eq!(harness.queue.attempts_made(id), Some(3));

        let stats = harness.stats.read().await.clone();
        assert_eq!(stats.jobs_processed, 3);
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn invalid_target_url_fails_without_retry() {
        let harness = harness();
        let id = enqueue(&harness, "not a url".to_string(), RetryPolicy::default()).await;

        harness.worker.process_batch().await.unwrap();

        assert_eq!(harness.ledger.record(id).unwrap().status, DeliveryStatus::Failed);
        assert_eq!(harness.queue.job_state(id), Some(JobState::Discarded));
    }

    #[tokio::test]
    async fn ledger_failure_does_not_block_queue_settlement() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(204)).mount(&server).await;

        let harness = harness();
        let id = enqueue(&harness, server.uri(), RetryPolicy::default()).await;
        harness.ledger.fail_next_update("connection reset");

        harness.worker.process_batch().await.unwrap();

        assert_eq!(harness.queue.job_state(id), Some(JobState::Completed));
        assert_eq!(harness.ledger.record(id).unwrap().status, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn run_exits_on_cancellation() {
        let harness = harness();
        let token = CancellationToken::new();
        let worker = DeliveryWorker::new(
            1,
            Arc::new(harness.queue.clone()),
            Arc::new(harness.ledger.clone()),
            Arc::new(DeliveryClient::with_defaults().unwrap()),
            WorkerConfig { poll_interval: Duration::from_millis(10), ..WorkerConfig::default() },
            harness.stats.clone(),
            token.clone(),
            Arc::new(hookline_core::RealClock::new()),
        );

        let handle = tokio::spawn(async move { worker.run().await });
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
