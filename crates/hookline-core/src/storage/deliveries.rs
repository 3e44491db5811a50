//! Repository for the delivery ledger.
//!
//! Rows are written once per delivery ID and updated by ID. The update
//! statement only touches `pending` rows and never lowers `attempts`, so the
//! ledger state machine holds even when two writers race on the same row.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{DeliveryId, DeliveryPatch, DeliveryRecord, DeliveryStatus},
};

/// Repository for delivery ledger rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a new ledger row.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the delivery ID already
    /// exists, or `CoreError::Database` on other failures.
    pub async fn insert(&self, record: &DeliveryRecord) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO deliveries (
                id, app_id, event, payload, status, attempts,
                last_attempt_at, response_code, response_body, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ",
        )
        .bind(record.id)
        .bind(&record.app_id)
        .bind(&record.event)
        .bind(&record.payload)
        .bind(record.status.to_string())
        .bind(record.attempts)
        .bind(record.last_attempt_at)
        .bind(record.response_code)
        .bind(&record.response_body)
        .bind(record.created_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Applies a patch to a pending row.
    ///
    /// Re-applying the terminal status a row already holds succeeds without
    /// changes.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no row has this ID and
    /// `CoreError::InvalidTransition` if the row is terminal and the patch
    /// would change it.
    pub async fn update(&self, id: DeliveryId, patch: &DeliveryPatch) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE deliveries SET
                status          = COALESCE($2, status),
                attempts        = GREATEST(attempts, COALESCE($3, attempts)),
                last_attempt_at = COALESCE($4, last_attempt_at),
                response_code   = COALESCE($5, response_code),
                response_body   = COALESCE($6, response_body)
            WHERE id = $1 AND status = 'pending'
            ",
        )
        .bind(id)
        .bind(patch.status.map(|status| status.to_string()))
        .bind(patch.attempts)
        .bind(patch.last_attempt_at)
        .bind(patch.response_code)
        .bind(&patch.response_body)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let current = self
            .find_status(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("delivery {id}")))?;

        match patch.status {
            Some(status) if status == current => Ok(()),
            other => Err(CoreError::InvalidTransition {
                id,
                from: current,
                to: other.unwrap_or(current),
            }),
        }
    }

    async fn find_status(&self, id: DeliveryId) -> Result<Option<DeliveryStatus>> {
        let status = sqlx::query_scalar::<_, DeliveryStatus>(
            "SELECT status FROM deliveries WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(status)
    }
}
