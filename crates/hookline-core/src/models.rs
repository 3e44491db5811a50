//! Core domain models and strongly-typed identifiers.
//!
//! Defines domain events, app registrations with their webhook manifests,
//! the delivery ledger row and its patch type, queued delivery jobs, and the
//! response shape returned to publishers of synchronous events. The ledger
//! state machine lives here so every storage adapter enforces the same
//! transitions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Globally unique delivery identifier.
///
/// Generated once per (event, app, webhook) match and carried through every
/// retry of that delivery, so receivers can use it as an idempotency key.
///
/// # Example
///
/// ```
/// use hookline_core::models::DeliveryId;
/// let delivery_id = DeliveryId::new();
/// println!("delivering {delivery_id}");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    /// Creates a new random delivery ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeliveryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DeliveryId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// A typed notification of something that happened in the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Event type, e.g. `order.created`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Arbitrary structured payload.
    pub payload: serde_json::Value,
}

impl DomainEvent {
    /// Creates a domain event.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self { event_type: event_type.into(), payload }
    }
}

/// Whether a webhook blocks the publisher or is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// Delivered inline during publication; the response is returned.
    Sync,
    /// Queued and delivered by a worker with retries.
    Async,
}

/// A receiver-declared HTTP endpoint for one event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDescriptor {
    /// Event type this webhook listens to.
    pub event: String,

    /// Destination URL for the POST.
    pub target_url: String,

    /// Optional selection query used to project the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// `Some(false)` marks a synchronous webhook; absent or `true` is queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_events: Option<bool>,
}

impl WebhookDescriptor {
    /// Returns the delivery mode declared by this descriptor.
    pub fn mode(&self) -> DeliveryMode {
        if self.async_events == Some(false) {
            DeliveryMode::Sync
        } else {
            DeliveryMode::Async
        }
    }
}

/// Webhook manifest of a registered app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppManifest {
    /// Declared webhooks.
    #[serde(default)]
    pub webhooks: Vec<WebhookDescriptor>,
}

/// A third-party integration registered on the platform.
///
/// Owned by the app registry; read-only to the delivery subsystem.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRegistration {
    /// Internal key.
    pub id: Uuid,

    /// External-facing identifier sent to receivers and stored in the ledger.
    pub app_id: String,

    /// Secret used to sign every payload delivered to this app.
    pub webhook_secret: String,

    /// Declared webhooks.
    pub manifest: AppManifest,
}

impl AppRegistration {
    /// Returns the descriptors declared for `event_type` in `mode`.
    pub fn webhooks_for<'a>(
        &'a self,
        event_type: &'a str,
        mode: DeliveryMode,
    ) -> impl Iterator<Item = &'a WebhookDescriptor> + 'a {
        self.manifest
            .webhooks
            .iter()
            .filter(move |webhook| webhook.event == event_type && webhook.mode() == mode)
    }
}

impl fmt::Debug for AppRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppRegistration")
            .field("id", &self.id)
            .field("app_id", &self.app_id)
            .field("webhook_secret", &"<redacted>")
            .field("manifest", &self.manifest)
            .finish()
    }
}

/// Lifecycle state of a delivery record.
///
/// Transitions only `Pending -> Delivered` or `Pending -> Failed`; terminal
/// states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Recorded, not yet resolved.
    Pending,
    /// Receiver acknowledged with a 2xx.
    Delivered,
    /// Sync delivery failed, or async retries were exhausted.
    Failed,
}

impl DeliveryStatus {
    /// Whether this status can no longer change.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// Whether moving from `self` to `next` is allowed.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, _) | (Self::Delivered, Self::Delivered) | (Self::Failed, Self::Failed)
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid delivery status: {s}").into()),
        }
    }
}

/// Ledger row tracking one delivery's lifecycle.
///
/// Created exactly once per (event, app, webhook) match before any network
/// call, then patched once per attempt until terminal. Retained for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    /// Delivery ID, shared with the queued job and the `X-Delivery` header.
    pub id: DeliveryId,

    /// External app identifier.
    pub app_id: String,

    /// Event type.
    pub event: String,

    /// Exact JSON body that is signed and sent.
    pub payload: String,

    /// Lifecycle state.
    pub status: DeliveryStatus,

    /// Network attempts made so far.
    pub attempts: i32,

    /// When the most recent attempt finished.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// HTTP status of the most recent response, if any.
    pub response_code: Option<i32>,

    /// Body of the most recent response, if any.
    pub response_body: Option<String>,

    /// When the record was inserted.
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Creates a pending record with zero attempts.
    pub fn pending(
        id: DeliveryId,
        app_id: impl Into<String>,
        event: impl Into<String>,
        payload: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            app_id: app_id.into(),
            event: event.into(),
            payload: payload.into(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            response_code: None,
            response_body: None,
            created_at,
        }
    }

    /// Applies a patch, enforcing the ledger state machine.
    ///
    /// `attempts` never decreases: a lower value is ignored. Re-applying the
    /// terminal status a record already holds is a no-op so the terminal
    /// failure handler stays idempotent.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` when the patch would leave a
    /// terminal status or touch a terminal record with a different status.
    pub fn apply(&mut self, patch: &DeliveryPatch) -> Result<()> {
        if self.status.is_terminal() {
            return match patch.status {
                Some(status) if status == self.status => Ok(()),
                other => Err(CoreError::InvalidTransition {
                    id: self.id,
                    from: self.status,
                    to: other.unwrap_or(self.status),
                }),
            };
        }

        if let Some(status) = patch.status {
            if !self.status.can_transition_to(status) {
                return Err(CoreError::InvalidTransition {
                    id: self.id,
                    from: self.status,
                    to: status,
                });
            }
            self.status = status;
        }
        if let Some(attempts) = patch.attempts {
            self.attempts = self.attempts.max(attempts);
        }
        if let Some(at) = patch.last_attempt_at {
            self.last_attempt_at = Some(at);
        }
        if let Some(code) = patch.response_code {
            self.response_code = Some(code);
        }
        if let Some(body) = &patch.response_body {
            self.response_body = Some(body.clone());
        }

        Ok(())
    }
}

/// Partial update of a delivery record. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPatch {
    /// New status.
    pub status: Option<DeliveryStatus>,
    /// Attempts made so far.
    pub attempts: Option<i32>,
    /// When the attempt finished.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// HTTP status of the response.
    pub response_code: Option<i32>,
    /// Response body.
    pub response_body: Option<String>,
}

impl DeliveryPatch {
    /// Patch recording that attempt number `attempts` finished at `at`.
    pub fn attempt(attempts: u32, at: DateTime<Utc>) -> Self {
        Self {
            attempts: Some(i32::try_from(attempts).unwrap_or(i32::MAX)),
            last_attempt_at: Some(at),
            ..Self::default()
        }
    }

    /// Adds the receiver's response.
    #[must_use]
    pub fn with_response(mut self, status_code: u16, body: impl Into<String>) -> Self {
        self.response_code = Some(i32::from(status_code));
        self.response_body = Some(body.into());
        self
    }

    /// Resolves the record as delivered.
    #[must_use]
    pub fn delivered(mut self) -> Self {
        self.status = Some(DeliveryStatus::Delivered);
        self
    }

    /// Resolves the record as failed.
    #[must_use]
    pub fn failed(mut self) -> Self {
        self.status = Some(DeliveryStatus::Failed);
        self
    }
}

/// Queued unit of work for an asynchronous delivery.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryJob {
    /// Ledger row this job resolves.
    pub delivery_id: DeliveryId,
    /// External app identifier.
    pub app_id: String,
    /// Signing secret of the app at enqueue time.
    pub webhook_secret: String,
    /// Destination URL.
    pub target_url: String,
    /// Event type.
    pub event: String,
    /// Projected JSON body.
    pub payload: String,
}

impl fmt::Debug for DeliveryJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryJob")
            .field("delivery_id", &self.delivery_id)
            .field("app_id", &self.app_id)
            .field("target_url", &self.target_url)
            .field("event", &self.event)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// Per-app outcome of a synchronous delivery, returned to the publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncWebhookResponse {
    /// External app identifier.
    pub app_id: String,
    /// Delivery ID of the ledger row.
    pub delivery_id: DeliveryId,
    /// Whether the receiver answered with a 2xx.
    pub ok: bool,
    /// HTTP status, or 0 when no response was received.
    pub status: u16,
    /// Response body as JSON when it parses, otherwise as a string.
    pub data: serde_json::Value,
}

impl SyncWebhookResponse {
    /// Response for a delivery that never produced an HTTP response.
    pub fn unreachable(app_id: impl Into<String>, delivery_id: DeliveryId) -> Self {
        Self {
            app_id: app_id.into(),
            delivery_id,
            ok: false,
            status: 0,
            data: serde_json::Value::Null,
        }
    }
}
