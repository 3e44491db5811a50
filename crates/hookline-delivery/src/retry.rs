//! Retry policy and the per-attempt outcome of an asynchronous delivery.
//!
//! A worker classifies every attempt as a [`DeliveryOutcome`]; the queue
//! adapter turns failures into a [`RetryDecision`] using the job's
//! [`RetryPolicy`]. The decision to retry is therefore explicit data rather
//! than implied by an error escaping the worker.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{client::DeliveryResponse, error::DeliveryError};

/// Retry policy submitted with every queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, including the first.
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    pub base_delay: Duration,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0). Zero gives exact delays.
    pub jitter_factor: f64,

    /// How the delay grows between attempts.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    /// Three attempts, exponential backoff starting at one second.
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(crate::DEFAULT_BACKOFF_DELAY_MS),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Exponential policy with the given attempts and first delay.
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts, base_delay, ..Self::default() }
    }

    /// Delay before the next attempt, after `attempts_made` failed attempts.
    ///
    /// Exponential backoff yields `base`, `2 * base`, `4 * base`, ... capped at
    /// `max_delay`.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(20);
                self.base_delay.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };

        let capped = delay.min(self.max_delay);
        apply_jitter(capped, self.jitter_factor).min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn allows_retry_after(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles with every failed attempt.
    Exponential,
}

/// Classified result of one delivery attempt.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// Receiver answered 2xx.
    Success(DeliveryResponse),
    /// Attempt failed in a way another attempt could fix.
    RetryableFailure {
        /// Why the attempt failed.
        error: DeliveryError,
        /// Receiver response, if one was obtained.
        response: Option<DeliveryResponse>,
    },
    /// Attempt failed in a way no retry can fix.
    TerminalFailure {
        /// Why the attempt failed.
        error: DeliveryError,
    },
}

impl DeliveryOutcome {
    /// Classifies the transport result of an attempt.
    ///
    /// Non-2xx responses are retryable failures that keep the response for
    /// the ledger.
    pub fn classify(result: Result<DeliveryResponse, DeliveryError>) -> Self {
        match result {
            Ok(response) if response.is_success => Self::Success(response),
            Ok(response) => Self::RetryableFailure {
                error: DeliveryError::from_status(response.status_code, response.body.clone()),
                response: Some(response),
            },
            Err(error) if error.is_retryable() => Self::RetryableFailure { error, response: None },
            Err(error) => Self::TerminalFailure { error },
        }
    }

    /// Whether the attempt delivered the payload.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Receiver response, if one was obtained.
    pub fn response(&self) -> Option<&DeliveryResponse> {
        match self {
            Self::Success(response) => Some(response),
            Self::RetryableFailure { response, .. } => response.as_ref(),
            Self::TerminalFailure { .. } => None,
        }
    }

    /// Failure cause, if the attempt failed.
    pub fn error(&self) -> Option<&DeliveryError> {
        match self {
            Self::Success(_) => None,
            Self::RetryableFailure { error, .. } | Self::TerminalFailure { error } => Some(error),
        }
    }
}

/// Context for deciding what happens after a failed attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempts made so far, including the one that just failed.
    pub attempts_made: u32,
    /// Whether the failure was classified as retryable.
    pub retryable: bool,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Policy the job was enqueued with.
    pub policy: RetryPolicy,
}

/// What the queue should do with a failed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make another attempt at the given time.
    Retry {
        /// When the next attempt becomes due
        next_attempt_at: DateTime<Utc>,
    },
    /// Stop retrying; the terminal failure handler runs.
    GiveUp {
        /// Why no further attempt is made
        reason: String,
    },
}

impl RetryContext {
    /// Creates a retry context.
    pub fn new(
        attempts_made: u32,
        retryable: bool,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempts_made, retryable, failed_at, policy }
    }

    /// Decides whether and when to retry.
    pub fn decide(&self) -> RetryDecision {
        if !self.retryable {
            return RetryDecision::GiveUp { reason: "non-retryable failure".to_string() };
        }

        if !self.policy.allows_retry_after(self.attempts_made) {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) reached", self.policy.max_attempts),
            };
        }

        let delay = self.policy.delay_for(self.attempts_made);
        let Ok(delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at: self.failed_at + delay }
    }
}

/// Randomizes a delay by up to `jitter_factor` in either direction.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + jitter_offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status_code: u16) -> DeliveryResponse {
        DeliveryResponse {
            status_code,
            body: "body".to_string(),
            duration: Duration::from_millis(5),
            is_success: (200..300).contains(&status_code),
        }
    }

    #[test]
    fn default_policy_is_three_exponential_attempts_from_one_second() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn max_delay_caps_backoff() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(5), ..RetryPolicy::default() };
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn fixed_backoff_never_grows() {
        let policy = RetryPolicy {
            backoff_strategy: BackoffStrategy::Fixed,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        };

        for attempt in 1..=5 {
            assert_eq!(policy.delay_for(attempt), Duration::from_secs(10));
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            let delay = apply_jitter(Duration::from_secs(10), 0.5);
            assert!(delay >= Duration::from_secs(5));
            assert!(delay <= Duration::from_secs(15));
            seen.insert(delay.as_millis());
        }
        assert!(seen.len() > 1);
    }

    #[test]
    fn retries_until_attempts_exhausted() {
        let failed_at = Utc::now();
        let policy = RetryPolicy::default();

        let decision = RetryContext::new(1, true, failed_at, policy.clone()).decide();
        assert_eq!(
            decision,
            RetryDecision::Retry { next_attempt_at: failed_at + chrono::Duration::seconds(1) }
        );

        match RetryContext::new(3, true, failed_at, policy).decide() {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => unreachable!("third attempt is the last"),
        }
    }

    #[test]
    fn terminal_failures_are_not_retried() {
        let decision = RetryContext::new(1, false, Utc::now(), RetryPolicy::default()).decide();
        assert!(matches!(decision, RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn outcome_classification() {
        assert!(DeliveryOutcome::classify(Ok(response(204))).is_success());

        let rejected = DeliveryOutcome::classify(Ok(response(500)));
        assert!(matches!(rejected, DeliveryOutcome::RetryableFailure { response: Some(_), .. }));
        assert_eq!(rejected.response().map(|r| r.status_code), Some(500));

        let not_found = DeliveryOutcome::classify(Ok(response(404)));
        assert!(matches!(not_found, DeliveryOutcome::RetryableFailure { .. }));

        let refused = DeliveryOutcome::classify(Err(DeliveryError::network("refused")));
        assert!(matches!(refused, DeliveryOutcome::RetryableFailure { response: None, .. }));

        let bad_url = DeliveryOutcome::classify(Err(DeliveryError::configuration("bad url")));
        assert!(matches!(bad_url, DeliveryOutcome::TerminalFailure { .. }));
        assert!(bad_url.error().is_some());
    }

    #[test]
    fn policy_survives_json_round_trip() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(250));
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["backoff_strategy"], "exponential");
        assert_eq!(serde_json::from_value::<RetryPolicy>(json).unwrap(), policy);
    }
}
