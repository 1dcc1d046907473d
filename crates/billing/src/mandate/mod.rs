//! Administrative-mandate billing rail
//!
//! Public-sector customers pay yearly against a purchase order instead of a
//! card. An order goes through operator validation, opens a one-year
//! subscription, gets invoiced, and is followed by dunning and renewal
//! reminders.

pub mod invoice;
pub mod order;
pub mod reminder;
pub mod renewal;
pub mod service;
pub mod snapshot;
pub mod subscription;
