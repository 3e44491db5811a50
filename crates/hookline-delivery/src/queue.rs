//! Durable work queue for asynchronous deliveries.
//!
//! The router enqueues one job per asynchronous match together with the
//! retry policy it should be delivered under. Workers claim due jobs, and
//! settle each claim by completing, rescheduling or discarding it. Attempt
//! counting belongs to the queue; the ledger mirrors it for observability.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use hookline_core::{
    models::{DeliveryId, DeliveryJob},
    storage::Storage,
    Clock,
};

use crate::{
    error::{DeliveryError, Result},
    retry::RetryPolicy,
};

/// A claimed job and the retry state the queue holds for it.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    /// Job body as enqueued.
    pub job: DeliveryJob,
    /// Policy supplied at enqueue time.
    pub policy: RetryPolicy,
    /// Attempts made before this claim.
    pub attempts_made: u32,
}

/// Queue operations used by the router and the workers.
pub trait DeliveryQueue: Send + Sync + 'static {
    /// Queue name, for logs and the queue registry.
    fn name(&self) -> &str;

    /// Adds a job, due immediately.
    fn enqueue(
        &self,
        job: DeliveryJob,
        policy: RetryPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Claims up to `batch_size` due jobs. Claimed jobs are hidden from other
    /// claims until settled or until their lease runs out.
    fn claim(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueuedJob>>> + Send + '_>>;

    /// Settles a claim after a successful attempt.
    fn complete(
        &self,
        delivery_id: DeliveryId,
        attempts_made: u32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Settles a claim after a failed attempt that will be retried.
    fn reschedule(
        &self,
        delivery_id: DeliveryId,
        attempts_made: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Settles a claim after the final failed attempt.
    fn discard(
        &self,
        delivery_id: DeliveryId,
        attempts_made: u32,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Queue stored in the `delivery_jobs` table.
pub struct PostgresDeliveryQueue {
    name: String,
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
    lease: Duration,
}

impl PostgresDeliveryQueue {
    /// Creates a queue adapter. Claimed jobs stay leased for `lease`.
    pub fn new(
        name: impl Into<String>,
        storage: Arc<Storage>,
        clock: Arc<dyn Clock>,
        lease: Duration,
    ) -> Self {
        Self { name: name.into(), storage, clock, lease }
    }
}

impl DeliveryQueue for PostgresDeliveryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(
        &self,
        job: DeliveryJob,
        policy: RetryPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let policy = serde_json::to_value(&policy)
                .map_err(|e| DeliveryError::queue(format!("failed to encode retry policy: {e}")))?;
            self.storage
                .delivery_jobs
                .enqueue(&self.name, &job, &policy, self.clock.now_utc())
                .await
                .map_err(|e| DeliveryError::queue(format!("failed to enqueue job: {e}")))
        })
    }

    fn claim(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueuedJob>>> + Send + '_>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let lease_until = now
                + chrono::Duration::from_std(self.lease)
                    .map_err(|e| DeliveryError::configuration(format!("invalid job lease: {e}")))?;

            let claimed = self
                .storage
                .delivery_jobs
                .claim(&self.name, batch_size, now, lease_until)
                .await
                .map_err(|e| DeliveryError::queue(format!("failed to claim jobs: {e}")))?;

            claimed
                .into_iter()
                .map(|row| {
                    let policy = serde_json::from_value(row.policy).unwrap_or_else(|e| {
                        tracing::warn!(
                            delivery_id = %row.delivery_id,
                            error = %e,
                            "stored retry policy unreadable, using default"
                        );
                        RetryPolicy::default()
                    });
                    Ok(QueuedJob {
                        job: row.job.0,
                        policy,
                        attempts_made: u32::try_from(row.attempts_made).unwrap_or(0),
                    })
                })
                .collect()
        })
    }

    fn complete(
        &self,
        delivery_id: DeliveryId,
        attempts_made: u32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.storage
                .delivery_jobs
                .complete(delivery_id, to_i32(attempts_made))
                .await
                .map_err(|e| DeliveryError::queue(e.to_string()))
        })
    }

    fn reschedule(
        &self,
        delivery_id: DeliveryId,
        attempts_made: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.storage
                .delivery_jobs
                .reschedule(delivery_id, to_i32(attempts_made), next_attempt_at, &error)
                .await
                .map_err(|e| DeliveryError::queue(e.to_string()))
        })
    }

    fn discard(
        &self,
        delivery_id: DeliveryId,
        attempts_made: u32,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.storage
                .delivery_jobs
                .discard(delivery_id, to_i32(attempts_made), &error)
                .await
                .map_err(|e| DeliveryError::queue(e.to_string()))
        })
    }
}

/// Where a job stands in the in-memory queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for its next attempt, possibly leased to a worker.
    Waiting,
    /// Delivered.
    Completed,
    /// Retries exhausted or terminal failure.
    Discarded,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    job: DeliveryJob,
    policy: RetryPolicy,
    attempts_made: u32,
    state: JobState,
    next_attempt_at: DateTime<Utc>,
    leased_until: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_seq: u64,
    entries: HashMap<DeliveryId, Entry>,
    /// Completed and discarded jobs, oldest settlement first.
    settled: VecDeque<DeliveryId>,
}

/// Default number of settled jobs an in-memory queue keeps for inspection.
pub const DEFAULT_SETTLED_RETENTION: usize = 1000;

/// Queue held in process memory, for tests and single-process embedding.
///
/// Waiting jobs are kept until settled. Settled jobs stay inspectable until
/// more than the retention limit have settled after them.
#[derive(Debug, Clone)]
pub struct MemoryDeliveryQueue {
    name: String,
    clock: Arc<dyn Clock>,
    lease: Duration,
    retain_settled: usize,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDeliveryQueue {
    /// Creates an empty queue with a five minute lease.
    pub fn new(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self::with_lease(name, clock, Duration::from_secs(300))
    }

    /// Creates an empty queue with the given lease.
    pub fn with_lease(name: impl Into<String>, clock: Arc<dyn Clock>, lease: Duration) -> Self {
        Self {
            name: name.into(),
            clock,
            lease,
            retain_settled: DEFAULT_SETTLED_RETENTION,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Keeps at most `limit` settled jobs; older ones are dropped.
    #[must_use]
    pub fn retain_settled(mut self, limit: usize) -> Self {
        self.retain_settled = limit;
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waiting and retained settled jobs, in enqueue order.
    pub fn jobs(&self) -> Vec<DeliveryJob> {
        let state = self.state();
        let mut entries: Vec<_> = state.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.job.clone()).collect()
    }

    /// Current state of a job.
    pub fn job_state(&self, delivery_id: DeliveryId) -> Option<JobState> {
        self.state().entries.get(&delivery_id).map(|entry| entry.state)
    }

    /// Attempts recorded for a job.
    pub fn attempts_made(&self, delivery_id: DeliveryId) -> Option<u32> {
        self.state().entries.get(&delivery_id).map(|entry| entry.attempts_made)
    }

    /// When a waiting job next becomes due.
    pub fn next_attempt_at(&self, delivery_id: DeliveryId) -> Option<DateTime<Utc>> {
        self.state().entries.get(&delivery_id).map(|entry| entry.next_attempt_at)
    }

    /// Last failure message recorded for a job.
    pub fn last_error(&self, delivery_id: DeliveryId) -> Option<String> {
        self.state().entries.get(&delivery_id).and_then(|entry| entry.last_error.clone())
    }

    /// Number of jobs still waiting.
    pub fn waiting_count(&self) -> usize {
        self.state().entries.values().filter(|entry| entry.state == JobState::Waiting).count()
    }

    fn settle(
        &self,
        delivery_id: DeliveryId,
        update: impl FnOnce(&mut Entry),
    ) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .entries
            .get_mut(&delivery_id)
            .ok_or_else(|| DeliveryError::queue(format!("unknown job {delivery_id}")))?;
        let was_waiting = entry.state == JobState::Waiting;
        entry.leased_until = None;
        update(entry);
        let newly_settled = was_waiting && entry.state != JobState::Waiting;

        if newly_settled {
            state.settled.push_back(delivery_id);
            while state.settled.len() > self.retain_settled {
                if let Some(evicted) = state.settled.pop_front() {
                    state.entries.remove(&evicted);
                }
            }
        }
        Ok(())
    }
}

impl DeliveryQueue for MemoryDeliveryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(
        &self,
        job: DeliveryJob,
        policy: RetryPolicy,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let mut state = self.state();
            if state.entries.contains_key(&job.delivery_id) {
                return Err(DeliveryError::queue(format!(
                    "job {} already enqueued",
                    job.delivery_id
                )));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.insert(
                job.delivery_id,
                Entry {
                    seq,
                    job,
                    policy,
                    attempts_made: 0,
                    state: JobState::Waiting,
                    next_attempt_at: now,
                    leased_until: None,
                    last_error: None,
                },
            );
            Ok(())
        })
    }

    fn claim(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueuedJob>>> + Send + '_>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let lease_until = now + chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::zero());
            let mut state = self.state();

            let mut due: Vec<&mut Entry> = state
                .entries
                .values_mut()
                .filter(|entry| {
                    entry.state == JobState::Waiting
                        && entry.next_attempt_at <= now
                        && entry.leased_until.map_or(true, |until| until <= now)
                })
                .collect();
            due.sort_by_key(|entry| (entry.next_attempt_at, entry.seq));

            Ok(due
                .into_iter()
                .take(batch_size)
                .map(|entry| {
                    entry.leased_until = Some(lease_until);
                    QueuedJob {
                        job: entry.job.clone(),
                        policy: entry.policy.clone(),
                        attempts_made: entry.attempts_made,
                    }
                })
                .collect())
        })
    }

    fn complete(
        &self,
        delivery_id: DeliveryId,
        attempts_made: u32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.settle(delivery_id, |entry| {
                entry.state = JobState::Completed;
                entry.attempts_made = attempts_made;
            })
        })
    }

    fn reschedule(
        &self,
        delivery_id: DeliveryId,
        attempts_made: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.settle(delivery_id, |entry| {
                entry.attempts_made = attempts_made;
                entry.next_attempt_at = next_attempt_at;
                entry.last_error = Some(error);
            })
        })
    }

    fn discard(
        &self,
        delivery_id: DeliveryId,
        attempts_made: u32,
        error: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.settle(delivery_id, |entry| {
                entry.state = JobState::Discarded;
                entry.attempts_made = attempts_made;
                entry.last_error = Some(error);
            })
        })
    }
}
