//! Tenant billing subject and its add-on rows

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::BillingInterval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingStatus {
    Trial,
    Active,
    Suspended,
    Cancelled,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Trial => "TRIAL",
            BillingStatus::Active => "ACTIVE",
            BillingStatus::Suspended => "SUSPENDED",
            BillingStatus::Cancelled => "CANCELLED",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "TRIAL" => Some(BillingStatus::Trial),
            "ACTIVE" => Some(BillingStatus::Active),
            "SUSPENDED" => Some(BillingStatus::Suspended),
            "CANCELLED" => Some(BillingStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment rail used by a tenant or chosen on a quote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    /// Card-based recurring billing through Stripe
    Card,
    /// Public-sector administrative mandate backed by a purchase order
    Mandate,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "CARD",
            PaymentMethod::Mandate => "MANDATE",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CARD" => Some(PaymentMethod::Card),
            "MANDATE" => Some(PaymentMethod::Mandate),
            _ => None,
        }
    }
}

impl std::fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub billing_email: Option<String>,
    pub subscription_plan_id: Option<Uuid>,
    pub billing_interval: BillingInterval,
    pub billing_status: BillingStatus,
    pub trial_ends_at: Option<OffsetDateTime>,
    /// Legacy quantity columns, used when no TenantAddon row exists
    pub purchased_admins: i32,
    pub purchased_associations: i32,
    pub purchased_communes: i32,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub created_at: OffsetDateTime,
}

impl Tenant {
    /// Card rail is live only when a Stripe subscription exists
    pub fn has_card_subscription(&self) -> bool {
        self.stripe_customer_id.is_some() && self.stripe_subscription_id.is_some()
    }

    pub fn payment_method(&self) -> PaymentMethod {
        if self.has_card_subscription() {
            PaymentMethod::Card
        } else {
            PaymentMethod::Mandate
        }
    }
}

/// Explicit add-on quantity; at most one row per (tenant, addon)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantAddon {
    pub tenant_id: Uuid,
    pub addon_id: Uuid,
    pub quantity: i32,
    /// Optimistic lock for read-compute-write on the quantity
    pub version: i64,
    pub updated_at: OffsetDateTime,
}
