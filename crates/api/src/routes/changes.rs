//! Billing change routes
//!
//! Add-on quantity changes (immediate or deferred), plan swaps and the
//! tenant ledger.

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use civitas_billing::{BillingChange, BillingInterval, ChangeResult, DueChangesReport, LedgerEntry};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{auth::OperatorUser, error::ApiResult, state::AppState};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct AddonChangeRequest {
    pub addon_id: Uuid,
    pub quantity: i32,
    #[serde(default)]
    pub immediate: bool,
}

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub plan_id: Uuid,
    pub billing_interval: BillingInterval,
}

#[derive(Debug, Serialize)]
pub struct ChangeListResponse {
    pub changes: Vec<BillingChange>,
}

#[derive(Debug, Serialize)]
pub struct LedgerResponse {
    pub tenant_id: Uuid,
    pub entries: Vec<LedgerEntry>,
    /// Credits minus debits
    pub balance: Decimal,
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn schedule_addon_change(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<AddonChangeRequest>,
) -> ApiResult<Json<ChangeResult>> {
    let result = state
        .billing
        .changes
        .schedule_addon_change(
            tenant_id,
            req.addon_id,
            req.quantity,
            req.immediate,
            operator.actor(),
        )
        .await?;
    Ok(Json(result))
}

pub async fn schedule_plan_change(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(tenant_id): Path<Uuid>,
    Json(req): Json<PlanChangeRequest>,
) -> ApiResult<Json<ChangeResult>> {
    let result = state
        .billing
        .changes
        .schedule_plan_change(tenant_id, req.plan_id, req.billing_interval, operator.actor())
        .await?;
    Ok(Json(result))
}

pub async fn list_changes(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<ChangeListResponse>> {
    let changes = state.billing.changes.list_changes(tenant_id).await?;
    Ok(Json(ChangeListResponse { changes }))
}

pub async fn get_change(
    State(state): State<AppState>,
    Path(change_id): Path<Uuid>,
) -> ApiResult<Json<BillingChange>> {
    Ok(Json(state.billing.changes.get_change(change_id).await?))
}

pub async fn cancel_change(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(change_id): Path<Uuid>,
) -> ApiResult<Json<ChangeResult>> {
    let result = state
        .billing
        .changes
        .cancel_pending_change(change_id, operator.actor())
        .await?;
    Ok(Json(result))
}

pub async fn apply_change(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorUser>,
    Path(change_id): Path<Uuid>,
) -> ApiResult<Json<ChangeResult>> {
    let result = state
        .billing
        .changes
        .apply_billing_change(change_id, operator.actor())
        .await?;
    Ok(Json(result))
}

/// Manual trigger of the due-change job
pub async fn apply_due_changes(
    State(state): State<AppState>,
) -> ApiResult<Json<DueChangesReport>> {
    let report = state.billing.changes.apply_due_changes().await?;
    tracing::info!(
        due = report.due,
        applied = report.applied,
        failed = report.failed,
        "Manual due-change run"
    );
    Ok(Json(report))
}

pub async fn tenant_ledger(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<LedgerResponse>> {
    let entries = state.billing.ledger.entries(tenant_id).await?;
    let balance = civitas_billing::ledger::balance(&entries);
    Ok(Json(LedgerResponse {
        tenant_id,
        entries,
        balance,
    }))
}
