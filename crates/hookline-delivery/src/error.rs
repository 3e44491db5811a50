//! Error types for webhook delivery operations.
//!
//! Covers transport failures, receiver rejections, ledger and queue failures,
//! and worker lifecycle problems. Every variant is classified for the retry
//! decision and for log fields.

use std::fmt;

use hookline_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for webhook delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure (DNS, refused connection, reset).
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// Request did not complete within its deadline.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Deadline that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// In-flight request was aborted by its cancellation token.
    #[error("delivery cancelled")]
    Cancelled,

    /// Receiver answered with a 4xx status.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Receiver answered with a 5xx or other non-success status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Delivery ledger write failed.
    #[error("ledger error: {message}")]
    LedgerError {
        /// Ledger error message
        message: String,
    },

    /// Job queue operation failed.
    #[error("queue error: {message}")]
    QueueError {
        /// Queue error message
        message: String,
    },

    /// Invalid delivery configuration, e.g. an unparsable target URL.
    #[error("invalid delivery configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Payload could not be signed.
    #[error("signing failed: {message}")]
    SigningError {
        /// Signing error message
        message: String,
    },

    /// Workers did not stop within the shutdown timeout.
    #[error("workers did not stop within {timeout_seconds}s")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout_seconds: u64,
    },

    /// A worker task panicked.
    #[error("worker panicked: {message}")]
    WorkerPanic {
        /// Join error description
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates a client error from an HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates the error matching a non-success HTTP status.
    pub fn from_status(status_code: u16, body: impl Into<String>) -> Self {
        if (400..500).contains(&status_code) {
            Self::client_error(status_code, body)
        } else {
            Self::server_error(status_code, body)
        }
    }

    /// Creates a ledger error.
    pub fn ledger(message: impl Into<String>) -> Self {
        Self::LedgerError { message: message.into() }
    }

    /// Creates a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::QueueError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates a signing error.
    pub fn signing(message: impl Into<String>) -> Self {
        Self::SigningError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Whether another attempt could succeed.
    ///
    /// Receiver rejections are retried regardless of status class: a 4xx
    /// from a receiver mid-deploy is as transient as a 5xx. Configuration and
    /// signing problems will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::Cancelled
            | Self::ClientError { .. }
            | Self::ServerError { .. }
            | Self::LedgerError { .. }
            | Self::QueueError { .. } => true,

            Self::ConfigurationError { .. }
            | Self::SigningError { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// Whether the request never produced an HTTP response.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::NetworkError { .. } | Self::Timeout { .. } | Self::Cancelled)
    }

    /// HTTP status carried by a receiver rejection.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            _ => None,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        Self::ledger(err.to_string())
    }
}

/// Category of delivery error for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity, deadlines and cancellation.
    Network,
    /// HTTP client errors (4xx).
    Client,
    /// HTTP server errors (5xx).
    Server,
    /// Ledger or queue storage.
    Storage,
    /// Configuration or signing problems.
    Configuration,
    /// Worker lifecycle and internal errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. }
            | DeliveryError::Timeout { .. }
            | DeliveryError::Cancelled => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::LedgerError { .. } | DeliveryError::QueueError { .. } => Self::Storage,
            DeliveryError::ConfigurationError { .. } | DeliveryError::SigningError { .. } => {
                Self::Configuration
            },
            DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Storage => write!(f, "storage"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
