//! Read-only repository over registered apps.

use std::sync::Arc;

use sqlx::{types::Json, PgPool, Row};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{AppManifest, AppRegistration},
};

struct AppRow(AppRegistration);

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for AppRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        let manifest: Json<AppManifest> = row.try_get("manifest")?;
        Ok(Self(AppRegistration {
            id: row.try_get::<Uuid, _>("id")?,
            app_id: row.try_get("app_id")?,
            webhook_secret: row.try_get("webhook_secret")?,
            manifest: manifest.0,
        }))
    }
}

/// Repository for the `apps` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns active apps whose manifest declares a webhook for `event_type`.
    ///
    /// Matching uses JSONB containment on `manifest.webhooks`, so the
    /// delivery mode of the matching descriptor is not considered here.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails or a stored manifest is malformed.
    pub async fn find_active_by_event(&self, event_type: &str) -> Result<Vec<AppRegistration>> {
        let rows = sqlx::query_as::<_, AppRow>(
            r"
            SELECT id, app_id, webhook_secret, manifest
            FROM apps
            WHERE active
              AND manifest->'webhooks' @> jsonb_build_array(jsonb_build_object('event', $1::text))
            ORDER BY created_at ASC, app_id ASC
            ",
        )
        .bind(event_type)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.0).collect())
    }
}
