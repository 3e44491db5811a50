//! HTTP transport for webhook delivery.
//!
//! Signs the payload, performs a single POST and reads the response body.
//! A request can be bounded by a deadline or aborted through a cancellation
//! token; either surfaces as a transport failure. Non-2xx responses are
//! returned as responses, not errors, so callers decide what a rejection
//! means for the ledger.

use std::time::{Duration, Instant};

use bytes::Bytes;
use hookline_core::models::{DeliveryId, DeliveryJob};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::{
    error::{DeliveryError, Result},
    signing::{sign_payload, SIGNATURE_HEADER},
};

/// Header carrying the event type.
pub const EVENT_HEADER: &str = "X-Event";

/// Header carrying the delivery ID.
pub const DELIVERY_HEADER: &str = "X-Delivery";

const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Configuration for the delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Upper bound for any single request, deadline or not.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Response bodies recorded in the ledger are truncated to this many
    /// bytes. The body handed back to callers is never truncated.
    pub max_body_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("hookline/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 3,
            max_body_bytes: 64 * 1024,
        }
    }
}

/// One outbound webhook request.
#[derive(Clone)]
pub struct DeliveryRequest {
    /// Delivery ID sent in `X-Delivery`.
    pub delivery_id: DeliveryId,
    /// Event type sent in `X-Event`.
    pub event: String,
    /// Destination URL.
    pub url: String,
    /// Key for the `X-Signature` HMAC.
    pub webhook_secret: String,
    /// Exact body bytes; signed as-is.
    pub payload: Bytes,
    /// 1-based attempt number, for logs.
    pub attempt_number: u32,
}

impl DeliveryRequest {
    /// Builds the request for attempt `attempt_number` of a queued job.
    pub fn from_job(job: &DeliveryJob, attempt_number: u32) -> Self {
        Self {
            delivery_id: job.delivery_id,
            event: job.event.clone(),
            url: job.target_url.clone(),
            webhook_secret: job.webhook_secret.clone(),
            payload: Bytes::from(job.payload.clone()),
            attempt_number,
        }
    }
}

impl std::fmt::Debug for DeliveryRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryRequest")
            .field("delivery_id", &self.delivery_id)
            .field("event", &self.event)
            .field("url", &self.url)
            .field("payload_len", &self.payload.len())
            .field("attempt_number", &self.attempt_number)
            .finish_non_exhaustive()
    }
}

/// Per-call delivery options.
#[derive(Debug, Clone, Default)]
pub struct DeliveryOptions {
    /// Abort the request if it has not finished after this long.
    pub deadline: Option<Duration>,
    /// Abort the request when this token is cancelled.
    pub cancellation: Option<CancellationToken>,
}

impl DeliveryOptions {
    /// Options bounded by a deadline.
    pub fn with_deadline(deadline: Duration) -> Self {
        Self { deadline: Some(deadline), cancellation: None }
    }
}

/// Response from a delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Full response body. Empty if it could not be read.
    pub body: String,
    /// Time from sending to having read the body.
    pub duration: Duration,
    /// Whether the status is in the 2xx range.
    pub is_success: bool,
}

impl DeliveryResponse {
    /// Body as JSON when it parses, as a string otherwise, `null` when empty.
    pub fn data(&self) -> serde_json::Value {
        if self.body.is_empty() {
            return serde_json::Value::Null;
        }
        serde_json::from_str(&self.body)
            .unwrap_or_else(|_| serde_json::Value::String(self.body.clone()))
    }

    /// Body as stored in the ledger, at most `limit` bytes.
    pub fn ledger_body(&self, limit: usize) -> String {
        truncate_body(&self.body, limit)
    }
}

/// HTTP client for webhook delivery.
///
/// Cheap to clone; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Size limit for response bodies recorded in the ledger.
    pub fn max_body_bytes(&self) -> usize {
        self.config.max_body_bytes
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// See [`DeliveryClient::new`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Signs and POSTs a payload.
    ///
    /// # Errors
    ///
    /// Only fails when no HTTP response was obtained:
    /// - `NetworkError` for DNS, connection and protocol failures
    /// - `Timeout` when the deadline or client timeout elapses
    /// - `Cancelled` when the cancellation token fires
    /// - `ConfigurationError` for an unusable target URL
    /// - `SigningError` if the payload cannot be signed
    pub async fn deliver(
        &self,
        request: DeliveryRequest,
        options: DeliveryOptions,
    ) -> Result<DeliveryResponse> {
        let span = info_span!(
            "webhook_delivery",
            delivery_id = %request.delivery_id,
            event = %request.event,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            let signature = sign_payload(&request.webhook_secret, &request.payload)?;

            let http_request = self
                .client
                .post(&request.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(SIGNATURE_HEADER, signature)
                .header(EVENT_HEADER, &request.event)
                .header(DELIVERY_HEADER, request.delivery_id.to_string())
                .body(request.payload.clone());

            let cancelled = async {
                match &options.cancellation {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending::<()>().await,
                }
            };
            let deadline = async {
                match options.deadline {
                    Some(deadline) => tokio::time::sleep(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let result = tokio::select! {
                biased;
                () = cancelled => Err(DeliveryError::Cancelled),
                () = deadline => Err(DeliveryError::timeout(duration_ms(options.deadline.unwrap_or_default()))),
                result = self.exchange(http_request) => result,
            };

            match &result {
                Ok(response) => tracing::debug!(
                    status = response.status_code,
                    duration_ms = duration_ms(response.duration),
                    "received response"
                ),
                Err(e) => tracing::debug!(error = %e, "request failed"),
            }

            result
        }
        .instrument(span)
        .await
    }

    async fn exchange(&self, request: reqwest::RequestBuilder) -> Result<DeliveryResponse> {
        let start = Instant::now();

        let response = request.send().await.map_err(|e| self.classify(&e))?;
        let status = response.status();

        let body = match response.bytes().await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read response body");
                String::new()
            },
        };

        Ok(DeliveryResponse {
            status_code: status.as_u16(),
            body,
            duration: start.elapsed(),
            is_success: status.is_success(),
        })
    }

    fn classify(&self, error: &reqwest::Error) -> DeliveryError {
        if error.is_builder() {
            DeliveryError::configuration(format!("invalid request: {error}"))
        } else if error.is_timeout() {
            DeliveryError::timeout(duration_ms(self.config.timeout))
        } else if error.is_connect() {
            DeliveryError::network(format!("connection failed: {error}"))
        } else {
            DeliveryError::network(error.to_string())
        }
    }
}

/// Truncates `body` to at most `limit` bytes on a char boundary, marking the
/// cut with a suffix when the limit leaves room for one.
pub fn truncate_body(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        return body.to_string();
    }
    if limit < TRUNCATION_SUFFIX.len() {
        return body[..floor_char_boundary(body, limit)].to_string();
    }
    let keep = floor_char_boundary(body, limit - TRUNCATION_SUFFIX.len());
    format!("{}{TRUNCATION_SUFFIX}", &body[..keep])
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut end = index.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
