//! Mandate subscriptions
//!
//! A one-year entitlement opened when a mandate order is accepted with a
//! purchase order. The only source of truth for "mandate billing is active".

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::proration::add_years;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Cancelled => "CANCELLED",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(SubscriptionStatus::Active),
            "CANCELLED" => Some(SubscriptionStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MandateSubscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub order_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub start_date: OffsetDateTime,
    pub end_date: OffsetDateTime,
    /// Set once, when the renewal order is generated
    pub renewal_order_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

impl MandateSubscription {
    /// New ACTIVE subscription covering `[start, start + 1 year]`
    pub fn open(
        tenant_id: Uuid,
        order_id: Uuid,
        plan_id: Uuid,
        start: OffsetDateTime,
    ) -> BillingResult<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            tenant_id,
            order_id,
            plan_id,
            status: SubscriptionStatus::Active,
            start_date: start,
            end_date: add_years(start, 1)?,
            renewal_order_id: None,
            created_at: start,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Whole days until `end_date`; negative once expired
    pub fn days_remaining(&self, now: OffsetDateTime) -> i64 {
        (self.end_date - now).whole_days()
    }
}
