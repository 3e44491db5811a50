//! PostgreSQL repositories for the delivery ledger, the durable job queue and
//! the read-only app lookup.
//!
//! All SQL lives in this module. Adapters in the delivery crate call these
//! repositories instead of issuing queries themselves.

use std::sync::Arc;

use sqlx::PgPool;

pub mod apps;
pub mod deliveries;
pub mod delivery_jobs;

use crate::error::Result;

/// Tables used by the delivery subsystem. Every statement is idempotent.
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS apps (
    id             UUID PRIMARY KEY,
    app_id         TEXT NOT NULL UNIQUE,
    webhook_secret TEXT NOT NULL,
    manifest       JSONB NOT NULL DEFAULT '{}'::jsonb,
    active         BOOLEAN NOT NULL DEFAULT TRUE,
    created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS deliveries (
    id              UUID PRIMARY KEY,
    app_id          TEXT NOT NULL,
    event           TEXT NOT NULL,
    payload         TEXT NOT NULL,
    status          TEXT NOT NULL CHECK (status IN ('pending', 'delivered', 'failed')),
    attempts        INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
    last_attempt_at TIMESTAMPTZ,
    response_code   INTEGER,
    response_body   TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS deliveries_app_id_idx ON deliveries (app_id, created_at DESC);

CREATE TABLE IF NOT EXISTS delivery_jobs (
    delivery_id     UUID PRIMARY KEY,
    queue_name      TEXT NOT NULL,
    job             JSONB NOT NULL,
    policy          JSONB NOT NULL,
    state           TEXT NOT NULL DEFAULT 'waiting'
                    CHECK (state IN ('waiting', 'completed', 'discarded')),
    attempts_made   INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TIMESTAMPTZ NOT NULL,
    locked_until    TIMESTAMPTZ,
    last_error      TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS delivery_jobs_claim_idx
    ON delivery_jobs (queue_name, next_attempt_at)
    WHERE state = 'waiting';
";

/// Container for all repository instances sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Delivery ledger rows.
    pub deliveries: Arc<deliveries::Repository>,

    /// Durable asynchronous delivery jobs.
    pub delivery_jobs: Arc<delivery_jobs::Repository>,

    /// Registered apps and their manifests.
    pub apps: Arc<apps::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a storage instance over the given pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            deliveries: Arc::new(deliveries::Repository::new(pool.clone())),
            delivery_jobs: Arc::new(delivery_jobs::Repository::new(pool.clone())),
            apps: Arc::new(apps::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates the delivery tables if they do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any DDL statement fails.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&*self.pool).await?;
        tracing::debug!("delivery schema ensured");
        Ok(())
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("pool_size", &self.pool.size()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_without_connecting() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let storage = Storage::new(pool);
        assert_eq!(storage.pool().size(), 0);
    }

    #[tokio::test]
    async fn health_check_fails_without_database() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_secs(2))
            .connect_lazy("postgresql://hookline@127.0.0.1:1/hookline")
            .unwrap();
        let storage = Storage::new(pool);

        let err = storage.health_check().await.unwrap_err();
        assert!(matches!(err, crate::error::CoreError::Database(_)));
    }

    #[test]
    fn schema_is_rerunnable() {
        let creates = SCHEMA.matches("CREATE ").count();
        let guarded = SCHEMA.matches("IF NOT EXISTS").count();
        assert_eq!(creates, guarded);
    }
}
