//! Operator authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use civitas_billing::Actor;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

/// Header carrying the acting operator's id, recorded in the audit trail
pub const OPERATOR_ID_HEADER: &str = "x-operator-id";

/// Operator identity extracted from the request
#[derive(Debug, Clone, Copy)]
pub struct OperatorUser {
    pub operator_id: Option<Uuid>,
}

impl OperatorUser {
    pub fn actor(&self) -> Actor {
        Actor::operator(self.operator_id)
    }
}

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Require the shared operator token on every admin route
pub async fn require_operator(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(&request) else {
        tracing::warn!(path = %path, "require_operator: missing bearer token");
        return ApiError::Unauthorized.into_response();
    };
    if !token_matches(token, &state.operator_token) {
        tracing::warn!(path = %path, "require_operator: invalid operator token");
        return ApiError::Unauthorized.into_response();
    }

    let operator_id = match request.headers().get(OPERATOR_ID_HEADER) {
        None => None,
        Some(value) => match value.to_str().ok().and_then(|v| Uuid::parse_str(v.trim()).ok()) {
            Some(id) => Some(id),
            None => {
                return ApiError::BadRequest(format!("{} must be a UUID", OPERATOR_ID_HEADER))
                    .into_response()
            }
        },
    };

    tracing::debug!(path = %path, operator_id = ?operator_id, "require_operator: authenticated");
    request.extensions_mut().insert(OperatorUser { operator_id });
    next.run(request).await
}
