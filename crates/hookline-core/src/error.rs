//! Error types for storage and domain operations.
//!
//! Storage adapters translate driver errors into `CoreError` so the delivery
//! layer can react to constraint violations and missing rows without
//! depending on the database driver directly.

use thiserror::Error;

use crate::models::{DeliveryId, DeliveryStatus};

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and domain operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Constraint violation, e.g. a duplicate delivery ID.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Ledger patch would move a record out of a terminal state.
    #[error("delivery {id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Delivery whose patch was rejected
        id: DeliveryId,
        /// Status currently stored
        from: DeliveryStatus,
        /// Status requested by the patch
        to: DeliveryStatus,
    },
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(format!("malformed JSON: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = CoreError::InvalidTransition {
            id: DeliveryId::new(),
            from: DeliveryStatus::Delivered,
            to: DeliveryStatus::Failed,
        };
        let message = err.to_string();
        assert!(message.contains("from delivered to failed"));
    }
}
