//! Billing error taxonomy
//!
//! Every variant is recoverable at the caller boundary. `Integrity` marks a
//! financial-integrity violation: the operation was aborted with nothing
//! persisted and an operator has to look at it.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// A transition was attempted from a status that does not allow it
    #[error("Action '{action}' is not allowed from status {from}")]
    InvalidState { from: String, action: String },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Duplicate operation: {0}")]
    DuplicateOperation(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Financial integrity violation: {0}")]
    Integrity(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Card processor error: {0}")]
    CardProcessor(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn invalid_state(from: impl std::fmt::Display, action: impl std::fmt::Display) -> Self {
        BillingError::InvalidState {
            from: from.to_string(),
            action: action.to_string(),
        }
    }

    /// Stable machine-readable code surfaced to the admin UI
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::NotFound(_) => "not_found",
            BillingError::InvalidState { .. } => "invalid_state",
            BillingError::PreconditionFailed(_) => "precondition_failed",
            BillingError::DuplicateOperation(_) => "duplicate_operation",
            BillingError::Validation(_) => "validation_error",
            BillingError::Integrity(_) => "integrity_error",
            BillingError::ConcurrentModification(_) => "concurrent_modification",
            BillingError::Database(_) => "database_error",
            BillingError::CardProcessor(_) => "card_processor_error",
            BillingError::Notification(_) => "notification_error",
            BillingError::Config(_) => "config_error",
            BillingError::Internal(_) => "internal_error",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => BillingError::NotFound("row not found".to_string()),
            other => BillingError::Database(other.to_string()),
        }
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::CardProcessor(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON encoding failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message_names_pair() {
        let err = BillingError::invalid_state("PENDING_BC", "client_validate");
        assert_eq!(
            err.to_string(),
            "Action 'client_validate' is not allowed from status PENDING_BC"
        );
        assert_eq!(err.code(), "invalid_state");
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: BillingError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, BillingError::NotFound(_)));
    }
}
