//! Mandate order, invoice and renewal routes
//!
//! Operator back-office actions over the mandate lifecycle. Every action is
//! attributed to the operator named in the request headers.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use civitas_billing::{
    Actor, ActivityLogEntry, MandateInvoice, MandateOrder, NewOrder, RenewalReport, SweepReport,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{auth::OperatorUser, error::ApiResult, state::AppState};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListOrdersQuery {
    pub tenant_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct OrderListResponse {
    pub orders: Vec<MandateOrder>,
}

#[derive(Debug, Deserialize)]
pub struct ClientValidationRequest {
    /// Object-storage keys of the uploaded purchase order
    pub documents: Vec<String>,
    /// Tenant admin who uploaded the documents, when known
    pub tenant_admin_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateOrderRequest {
    pub has_purchase_order: bool,
    pub purchase_order_number: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectOrderRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct LinkTenantRequest {
    pub tenant_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ActivityResponse {
    pub entries: Vec<ActivityLogEntry>,
}

// =============================================================================
// Orders
// =============================================================================

pub async fn create_order(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Json(req): Json<NewOrder>,
) -> ApiResult<(StatusCode, Json<MandateOrder>)> {
    let order = state
        .billing
        .orders
        .create_order(req, operator.actor())
        .await?;
    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn list_orders(
    State(state): State<AppState>,
    Query(query): Query<ListOrdersQuery>,
) -> ApiResult<Json<OrderListResponse>> {
    let orders = state.billing.orders.list_orders(query.tenant_id).await?;
    Ok(Json(OrderListResponse { orders }))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<MandateOrder>> {
    Ok(Json(state.billing.orders.get_order(order_id).await?))
}

pub async fn client_validate(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<ClientValidationRequest>,
) -> ApiResult<Json<MandateOrder>> {
    let actor = req
        .tenant_admin_id
        .map(Actor::tenant_admin)
        .unwrap_or_else(|| operator.actor());
    let order = state
        .billing
        .orders
        .client_validate(order_id, req.documents, actor)
        .await?;
    Ok(Json(order))
}

pub async fn validate_order(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<ValidateOrderRequest>,
) -> ApiResult<Json<MandateOrder>> {
    let order = state
        .billing
        .orders
        .validate_order(
            order_id,
            req.has_purchase_order,
            req.purchase_order_number,
            operator.actor(),
        )
        .await?;
    Ok(Json(order))
}

pub async fn reject_order(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<RejectOrderRequest>,
) -> ApiResult<Json<MandateOrder>> {
    let order = state
        .billing
        .orders
        .reject_order(order_id, &req.reason, operator.actor())
        .await?;
    Ok(Json(order))
}

pub async fn generate_invoice(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<MandateInvoice>)> {
    let invoice = state
        .billing
        .orders
        .generate_invoice(order_id, operator.actor())
        .await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn link_tenant(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(order_id): Path<Uuid>,
    Json(req): Json<LinkTenantRequest>,
) -> ApiResult<Json<MandateOrder>> {
    let order = state
        .billing
        .orders
        .link_tenant(order_id, req.tenant_id, operator.actor())
        .await?;
    Ok(Json(order))
}

pub async fn delete_order(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state
        .billing
        .orders
        .soft_delete(order_id, operator.actor())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn order_activity(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<ActivityResponse>> {
    let entries = state.billing.orders.order_activity(order_id).await?;
    Ok(Json(ActivityResponse { entries }))
}

// =============================================================================
// Invoices
// =============================================================================

pub async fn get_invoice(
    State(state): State<AppState>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<Json<MandateInvoice>> {
    Ok(Json(state.billing.orders.get_invoice(invoice_id).await?))
}

pub async fn send_invoice(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<Json<MandateInvoice>> {
    let invoice = state
        .billing
        .orders
        .send_invoice(invoice_id, operator.actor())
        .await?;
    Ok(Json(invoice))
}

pub async fn mark_invoice_mandated(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<Json<MandateInvoice>> {
    let invoice = state
        .billing
        .orders
        .mark_invoice_mandated(invoice_id, operator.actor())
        .await?;
    Ok(Json(invoice))
}

pub async fn mark_invoice_paid(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<Json<MandateInvoice>> {
    let invoice = state
        .billing
        .orders
        .mark_invoice_paid(invoice_id, operator.actor())
        .await?;
    Ok(Json(invoice))
}

pub async fn cancel_invoice(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(invoice_id): Path<Uuid>,
) -> ApiResult<Json<MandateInvoice>> {
    let invoice = state
        .billing
        .orders
        .cancel_invoice(invoice_id, operator.actor())
        .await?;
    Ok(Json(invoice))
}

// =============================================================================
// Renewals and Reminders
// =============================================================================

pub async fn generate_renewal_order(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(subscription_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<MandateOrder>)> {
    let order = state
        .billing
        .renewals
        .generate_renewal_order(subscription_id, operator.actor())
        .await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// Manual trigger of the renewal reminder job
pub async fn schedule_renewal_reminders(
    State(state): State<AppState>,
) -> ApiResult<Json<RenewalReport>> {
    Ok(Json(state.billing.renewals.schedule_renewal_reminders().await?))
}

/// Manual trigger of the reminder sweep
pub async fn sweep_reminders(State(state): State<AppState>) -> ApiResult<Json<SweepReport>> {
    Ok(Json(state.billing.reminders.run().await?))
}
