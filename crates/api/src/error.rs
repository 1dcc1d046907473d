//! API error type
//!
//! Domain errors are surfaced to the admin UI as
//! `{ "error": { "code": "...", "message": "..." } }`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use civitas_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Authentication required")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Billing(e) => match e {
                BillingError::NotFound(_) => StatusCode::NOT_FOUND,
                BillingError::InvalidState { .. } => StatusCode::CONFLICT,
                BillingError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
                BillingError::DuplicateOperation(_) => StatusCode::CONFLICT,
                BillingError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                BillingError::Integrity(_) => StatusCode::INTERNAL_SERVER_ERROR,
                BillingError::ConcurrentModification(_) => StatusCode::CONFLICT,
                BillingError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
                BillingError::CardProcessor(_) => StatusCode::BAD_GATEWAY,
                BillingError::Notification(_) => StatusCode::BAD_GATEWAY,
                BillingError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
                BillingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Billing(e) => e.code(),
            ApiError::Unauthorized => "unauthorized",
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Integrity errors are shown to operators; infrastructure details are not
        let message = match &self {
            ApiError::Billing(BillingError::Integrity(msg)) => {
                tracing::error!(error = %msg, "Billing integrity violation");
                self.to_string()
            }
            ApiError::Billing(
                e @ (BillingError::Database(_) | BillingError::Config(_) | BillingError::Internal(_)),
            ) => {
                tracing::error!(error = %e, code = e.code(), "Request failed");
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_map_to_statuses() {
        let cases = [
            (BillingError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (BillingError::invalid_state("ACCEPTED", "reject"), StatusCode::CONFLICT),
            (BillingError::PreconditionFailed("x".into()), StatusCode::PRECONDITION_FAILED),
            (BillingError::DuplicateOperation("x".into()), StatusCode::CONFLICT),
            (BillingError::Validation("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (BillingError::ConcurrentModification("x".into()), StatusCode::CONFLICT),
            (BillingError::CardProcessor("x".into()), StatusCode::BAD_GATEWAY),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[test]
    fn test_database_detail_is_hidden() {
        let response =
            ApiError::from(BillingError::Database("relation missing".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
