//! API routes

pub mod changes;
pub mod orders;
pub mod quotes;


use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_operator, state::AppState};

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// Back-office routes, all behind the operator token
fn admin_routes(state: AppState) -> Router<AppState> {
    Router::new()
        // Billing changes
        .route(
            "/tenants/{tenant_id}/addon-changes",
            post(changes::schedule_addon_change),
        )
        .route(
            "/tenants/{tenant_id}/plan-changes",
            post(changes::schedule_plan_change),
        )
        .route("/tenants/{tenant_id}/changes", get(changes::list_changes))
        .route("/tenants/{tenant_id}/ledger", get(changes::tenant_ledger))
        .route("/changes/apply-due", post(changes::apply_due_changes))
        .route("/changes/{change_id}", get(changes::get_change))
        .route("/changes/{change_id}/cancel", post(changes::cancel_change))
        .route("/changes/{change_id}/apply", post(changes::apply_change))
        // Mandate orders
        .route(
            "/orders",
            get(orders::list_orders).post(orders::create_order),
        )
        .route(
            "/orders/{order_id}",
            get(orders::get_order).delete(orders::delete_order),
        )
        .route(
            "/orders/{order_id}/client-validation",
            post(orders::client_validate),
        )
        .route("/orders/{order_id}/validate", post(orders::validate_order))
        .route("/orders/{order_id}/reject", post(orders::reject_order))
        .route("/orders/{order_id}/invoice", post(orders::generate_invoice))
        .route("/orders/{order_id}/link-tenant", post(orders::link_tenant))
        .route("/orders/{order_id}/activity", get(orders::order_activity))
        // Invoices
        .route("/invoices/{invoice_id}", get(orders::get_invoice))
        .route("/invoices/{invoice_id}/send", post(orders::send_invoice))
        .route(
            "/invoices/{invoice_id}/mandated",
            post(orders::mark_invoice_mandated),
        )
        .route("/invoices/{invoice_id}/paid", post(orders::mark_invoice_paid))
        .route("/invoices/{invoice_id}/cancel", post(orders::cancel_invoice))
        // Renewals and reminders
        .route(
            "/subscriptions/{subscription_id}/renewal-order",
            post(orders::generate_renewal_order),
        )
        .route(
            "/renewals/reminders",
            post(orders::schedule_renewal_reminders),
        )
        .route("/reminders/sweep", post(orders::sweep_reminders))
        // Quotes
        .route("/quotes", post(quotes::create_quote))
        .route("/quotes/{quote_id}", get(quotes::get_quote))
        .route("/quotes/{quote_id}/send", post(quotes::send_quote))
        .route_layer(middleware::from_fn_with_state(state, require_operator))
}

/// Client-facing quote routes, authorised by the token in the path
fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/quotes/{token}", get(quotes::public_get_quote))
        .route("/quotes/{token}/accept", post(quotes::public_accept_quote))
        .route("/quotes/{token}/reject", post(quotes::public_reject_quote))
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/admin", admin_routes(state.clone()))
        .nest("/api/v1/public", public_routes())
        .with_state(state)
}
