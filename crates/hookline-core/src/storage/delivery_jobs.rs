//! Repository for durable asynchronous delivery jobs.
//!
//! Jobs are claimed with `FOR UPDATE SKIP LOCKED` so concurrent workers, in
//! one process or many, never receive the same job. A claim sets a lease in
//! `locked_until`; a job whose lease expires without being settled becomes
//! claimable again, which covers workers that crash mid-delivery.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{DeliveryId, DeliveryJob},
};

/// A job handed to a worker by [`Repository::claim`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ClaimedJob {
    /// Delivery ID, also the primary key of the job.
    pub delivery_id: DeliveryId,
    /// Job body.
    pub job: Json<DeliveryJob>,
    /// Serialized retry policy supplied at enqueue time.
    pub policy: serde_json::Value,
    /// Attempts made before this claim.
    pub attempts_made: i32,
}

/// Repository for the `delivery_jobs` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Adds a job to a queue, due immediately.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if a job with this delivery ID
    /// already exists.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        job: &DeliveryJob,
        policy: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO delivery_jobs (
                delivery_id, queue_name, job, policy, state, attempts_made,
                next_attempt_at, created_at
            ) VALUES ($1, $2, $3, $4, 'waiting', 0, $5, $5)
            ",
        )
        .bind(job.delivery_id)
        .bind(queue_name)
        .bind(Json(job))
        .bind(policy)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Claims up to `batch_size` due jobs and leases them until `lease_until`.
    ///
    /// Jobs are claimed oldest-due first.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim(
        &self,
        queue_name: &str,
        batch_size: usize,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT delivery_id FROM delivery_jobs
            WHERE queue_name = $1
              AND state = 'waiting'
              AND next_attempt_at <= $2
              AND (locked_until IS NULL OR locked_until <= $2)
            ORDER BY next_attempt_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(queue_name)
        .bind(now)
        .bind(i64::try_from(batch_size).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let jobs = sqlx::query_as::<_, ClaimedJob>(
            r"
            UPDATE delivery_jobs
            SET locked_until = $2
            WHERE delivery_id = ANY($1)
            RETURNING delivery_id, job, policy, attempts_made
            ",
        )
        .bind(&ids)
        .bind(lease_until)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(jobs)
    }

    /// Marks a job as completed after a successful delivery.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn complete(&self, delivery_id: DeliveryId, attempts_made: i32) -> Result<()> {
        sqlx::query(
            r"
            UPDATE delivery_jobs
            SET state = 'completed', attempts_made = $2, locked_until = NULL
            WHERE delivery_id = $1
            ",
        )
        .bind(delivery_id)
        .bind(attempts_made)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Releases a job for another attempt at `next_attempt_at`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reschedule(
        &self,
        delivery_id: DeliveryId,
        attempts_made: i32,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE delivery_jobs
            SET attempts_made = $2, next_attempt_at = $3, last_error = $4, locked_until = NULL
            WHERE delivery_id = $1 AND state = 'waiting'
            ",
        )
        .bind(delivery_id)
        .bind(attempts_made)
        .bind(next_attempt_at)
        .bind(last_error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Removes a job from circulation after its final failed attempt.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn discard(
        &self,
        delivery_id: DeliveryId,
        attempts_made: i32,
        last_error: &str,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE delivery_jobs
            SET state = 'discarded', attempts_made = $2, last_error = $3, locked_until = NULL
            WHERE delivery_id = $1
            ",
        )
        .bind(delivery_id)
        .bind(attempts_made)
        .bind(last_error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
