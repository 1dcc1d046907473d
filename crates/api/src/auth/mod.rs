//! Authentication module for Civitas
//!
//! User sessions live in the main application; the billing API only trusts
//! the back office through a shared operator token.

pub mod middleware;

pub use middleware::{require_operator, OperatorUser, OPERATOR_ID_HEADER};
