//! Read-only lookup of apps subscribed to an event type.
//!
//! App registration and manifest management live outside the delivery
//! subsystem; this module only defines the lookup it consumes, with an
//! in-memory implementation for tests and embedding and a PostgreSQL one
//! for the worker process.

use std::sync::{Arc, RwLock};

use crate::{error::Result, models::AppRegistration, storage::Storage};

/// Lookup of active apps whose manifest declares a webhook for an event.
#[async_trait::async_trait]
pub trait AppRegistry: Send + Sync + std::fmt::Debug {
    /// Returns every active app with at least one webhook for `event_type`.
    async fn active_apps_by_event(&self, event_type: &str) -> Result<Vec<AppRegistration>>;
}

/// Registry held in memory.
#[derive(Debug, Default)]
pub struct InMemoryAppRegistry {
    apps: RwLock<Vec<AppRegistration>>,
}

impl InMemoryAppRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding `apps`.
    pub fn with_apps(apps: impl IntoIterator<Item = AppRegistration>) -> Self {
        Self { apps: RwLock::new(apps.into_iter().collect()) }
    }

    /// Adds or replaces an app, keyed by `app_id`.
    pub fn upsert(&self, app: AppRegistration) {
        let mut apps = self.apps.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        apps.retain(|existing| existing.app_id != app.app_id);
        apps.push(app);
    }

    /// Removes an app.
    pub fn remove(&self, app_id: &str) {
        self.apps
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|existing| existing.app_id != app_id);
    }
}

#[async_trait::async_trait]
impl AppRegistry for InMemoryAppRegistry {
    async fn active_apps_by_event(&self, event_type: &str) -> Result<Vec<AppRegistration>> {
        Ok(self
            .apps
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|app| app.manifest.webhooks.iter().any(|webhook| webhook.event == event_type))
            .cloned()
            .collect())
    }
}

/// Registry backed by the `apps` table.
#[derive(Clone)]
pub struct PostgresAppRegistry {
    storage: Arc<Storage>,
}

impl PostgresAppRegistry {
    /// Creates a registry over the shared storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl std::fmt::Debug for PostgresAppRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresAppRegistry").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl AppRegistry for PostgresAppRegistry {
    async fn active_apps_by_event(&self, event_type: &str) -> Result<Vec<AppRegistration>> {
        self.storage.apps.find_active_by_event(event_type).await
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::models::{AppManifest, WebhookDescriptor};

    fn app(app_id: &str, events: &[&str]) -> AppRegistration {
        AppRegistration {
            id: Uuid::new_v4(),
            app_id: app_id.to_string(),
            webhook_secret: "secret".to_string(),
            manifest: AppManifest {
                webhooks: events
                    .iter()
                    .map(|event| WebhookDescriptor {
                        event: (*event).to_string(),
                        target_url: format!("https://{app_id}.test/hook"),
                        query: None,
                        async_events: None,
                    })
                    .collect(),
            },
        }
    }

    #[tokio::test]
    async fn returns_only_apps_declaring_the_event() {
        let registry = InMemoryAppRegistry::with_apps([
            app("a", &["order.created"]),
            app("b", &["order.paid"]),
            app("c", &["order.paid", "order.created"]),
        ]);

        let apps = registry.active_apps_by_event("order.created").await.unwrap();
        let ids: Vec<_> = apps.iter().map(|a| a.app_id.as_str()).collect();

        assert_eq!(ids, ["a", "c"]);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_app() {
        let registry = InMemoryAppRegistry::new();
        registry.upsert(app("a", &["order.created"]));
        registry.upsert(app("a", &["order.paid"]));

        assert!(registry.active_apps_by_event("order.created").await.unwrap().is_empty());
        assert_eq!(registry.active_apps_by_event("order.paid").await.unwrap().len(), 1);

        registry.remove("a");
        assert!(registry.active_apps_by_event("order.paid").await.unwrap().is_empty());
    }
}
