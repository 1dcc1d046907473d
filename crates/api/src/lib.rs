// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps BillingError
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Civitas API Library
//!
//! Back-office and public quote endpoints over the Civitas billing engine.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
