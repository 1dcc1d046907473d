//! Application state

use std::sync::Arc;

use civitas_billing::BillingService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    /// Expected operator bearer token
    pub operator_token: Arc<str>,
}

impl AppState {
    pub fn new(billing: Arc<BillingService>, operator_token: impl Into<String>) -> Self {
        Self {
            billing,
            operator_token: Arc::from(operator_token.into()),
        }
    }
}
