//! Quote routes
//!
//! Operators create and send quotes; clients view, accept or refuse them
//! through the public token without an account.

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use civitas_billing::{NewQuote, PaymentMethod, Quote};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{auth::OperatorUser, error::ApiResult, state::AppState};

/// Quote as seen by operators, with the token needed to build the client link
#[derive(Debug, Serialize)]
pub struct OperatorQuoteResponse {
    #[serde(flatten)]
    pub quote: Quote,
    pub public_token: String,
}

impl From<Quote> for OperatorQuoteResponse {
    fn from(quote: Quote) -> Self {
        let public_token = quote.public_token.clone();
        Self {
            quote,
            public_token,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AcceptQuoteRequest {
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Deserialize)]
pub struct RejectQuoteRequest {
    #[serde(default)]
    pub reason: String,
}

// =============================================================================
// Operator
// =============================================================================

pub async fn create_quote(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Json(req): Json<NewQuote>,
) -> ApiResult<(StatusCode, Json<OperatorQuoteResponse>)> {
    let quote = state
        .billing
        .quotes
        .create_quote(req, operator.actor())
        .await?;
    Ok((StatusCode::CREATED, Json(quote.into())))
}

pub async fn get_quote(
    State(state): State<AppState>,
    Path(quote_id): Path<Uuid>,
) -> ApiResult<Json<OperatorQuoteResponse>> {
    let quote = state.billing.quotes.get_quote(quote_id).await?;
    Ok(Json(quote.into()))
}

pub async fn send_quote(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(quote_id): Path<Uuid>,
) -> ApiResult<Json<OperatorQuoteResponse>> {
    let quote = state
        .billing
        .quotes
        .send_quote(quote_id, operator.actor())
        .await?;
    Ok(Json(quote.into()))
}

// =============================================================================
// Public (token)
// =============================================================================

pub async fn public_get_quote(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Json<Quote>> {
    Ok(Json(state.billing.quotes.get_by_token(&token).await?))
}

pub async fn public_accept_quote(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<AcceptQuoteRequest>,
) -> ApiResult<Json<Quote>> {
    let quote = state
        .billing
        .quotes
        .accept_quote(&token, req.payment_method)
        .await?;
    Ok(Json(quote))
}

pub async fn public_reject_quote(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(req): Json<RejectQuoteRequest>,
) -> ApiResult<Json<Quote>> {
    let quote = state
        .billing
        .quotes
        .reject_quote(&token, &req.reason)
        .await?;
    Ok(Json(quote))
}
