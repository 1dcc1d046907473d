//! Pricing catalog
//!
//! Plans, add-ons and per-plan add-on pricing, loaded once per request and
//! passed by reference into the proration calculator and the order/invoice
//! builders. The catalog never mutates; a price change in the database is only
//! seen by the next loaded catalog.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Billing cadence of a card subscription. Mandate orders are always yearly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingInterval {
    Monthly,
    Yearly,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "MONTHLY",
            BillingInterval::Yearly => "YEARLY",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "MONTHLY" => Some(BillingInterval::Monthly),
            "YEARLY" | "ANNUAL" => Some(BillingInterval::Yearly),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Add-on categories sold on top of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AddonCode {
    /// Additional administrator seats
    ExtraAdmins,
    /// Additional associations hosted by the tenant
    ExtraAssociations,
    /// Additional member communes (inter-municipal bodies)
    ExtraCommunes,
}

impl AddonCode {
    pub fn all() -> [AddonCode; 3] {
        [
            AddonCode::ExtraAdmins,
            AddonCode::ExtraAssociations,
            AddonCode::ExtraCommunes,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AddonCode::ExtraAdmins => "EXTRA_ADMINS",
            AddonCode::ExtraAssociations => "EXTRA_ASSOCIATIONS",
            AddonCode::ExtraCommunes => "EXTRA_COMMUNES",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "EXTRA_ADMINS" => Some(AddonCode::ExtraAdmins),
            "EXTRA_ASSOCIATIONS" => Some(AddonCode::ExtraAssociations),
            "EXTRA_COMMUNES" => Some(AddonCode::ExtraCommunes),
            _ => None,
        }
    }
}

impl std::fmt::Display for AddonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub monthly_price: Decimal,
    pub yearly_price: Decimal,
    pub included_admins: i32,
    pub included_associations: i32,
    pub included_communes: i32,
    pub is_active: bool,
}

impl Plan {
    pub fn price(&self, interval: BillingInterval) -> Decimal {
        match interval {
            BillingInterval::Monthly => self.monthly_price,
            BillingInterval::Yearly => self.yearly_price,
        }
    }

    pub fn included_quantity(&self, code: AddonCode) -> i32 {
        match code {
            AddonCode::ExtraAdmins => self.included_admins,
            AddonCode::ExtraAssociations => self.included_associations,
            AddonCode::ExtraCommunes => self.included_communes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Addon {
    pub id: Uuid,
    pub code: AddonCode,
    pub name: String,
    pub monthly_unit_price: Decimal,
    pub yearly_unit_price: Decimal,
    /// Stripe price ids used to mirror quantities on card subscriptions
    pub stripe_monthly_price_id: Option<String>,
    pub stripe_yearly_price_id: Option<String>,
}

impl Addon {
    pub fn unit_price(&self, interval: BillingInterval) -> Decimal {
        match interval {
            BillingInterval::Monthly => self.monthly_unit_price,
            BillingInterval::Yearly => self.yearly_unit_price,
        }
    }

    pub fn stripe_price_id(&self, interval: BillingInterval) -> Option<&str> {
        match interval {
            BillingInterval::Monthly => self.stripe_monthly_price_id.as_deref(),
            BillingInterval::Yearly => self.stripe_yearly_price_id.as_deref(),
        }
    }
}

/// Per-plan availability and price override for an add-on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAddonAccess {
    pub plan_id: Uuid,
    pub addon_id: Uuid,
    pub enabled: bool,
    pub monthly_price_override: Option<Decimal>,
    pub yearly_price_override: Option<Decimal>,
}

/// Immutable lookup of plans and add-ons
#[derive(Debug, Clone, Default)]
pub struct PricingCatalog {
    plans: HashMap<Uuid, Plan>,
    addons: HashMap<Uuid, Addon>,
    access: HashMap<(Uuid, Uuid), PlanAddonAccess>,
}

impl PricingCatalog {
    pub fn new(plans: Vec<Plan>, addons: Vec<Addon>, access: Vec<PlanAddonAccess>) -> Self {
        Self {
            plans: plans.into_iter().map(|p| (p.id, p)).collect(),
            addons: addons.into_iter().map(|a| (a.id, a)).collect(),
            access: access
                .into_iter()
                .map(|a| ((a.plan_id, a.addon_id), a))
                .collect(),
        }
    }

    pub fn plan(&self, plan_id: Uuid) -> BillingResult<&Plan> {
        self.plans
            .get(&plan_id)
            .ok_or_else(|| BillingError::NotFound(format!("Plan {} not found", plan_id)))
    }

    /// Plan that may be targeted by a new order or a plan change
    pub fn active_plan(&self, plan_id: Uuid) -> BillingResult<&Plan> {
        let plan = self.plan(plan_id)?;
        if !plan.is_active {
            return Err(BillingError::Validation(format!(
                "Plan '{}' is no longer offered",
                plan.code
            )));
        }
        Ok(plan)
    }

    pub fn addon(&self, addon_id: Uuid) -> BillingResult<&Addon> {
        self.addons
            .get(&addon_id)
            .ok_or_else(|| BillingError::NotFound(format!("Addon {} not found", addon_id)))
    }

    pub fn addon_by_code(&self, code: AddonCode) -> Option<&Addon> {
        self.addons.values().find(|a| a.code == code)
    }

    /// All add-ons ordered by code, so snapshots list lines deterministically
    pub fn addons(&self) -> Vec<&Addon> {
        let mut addons: Vec<&Addon> = self.addons.values().collect();
        addons.sort_by_key(|a| a.code);
        addons
    }

    pub fn plan_price(&self, plan_id: Uuid, interval: BillingInterval) -> BillingResult<Decimal> {
        Ok(self.plan(plan_id)?.price(interval))
    }

    /// Whether the add-on may be purchased on the plan (no mapping means enabled)
    pub fn is_addon_enabled(&self, plan_id: Uuid, addon_id: Uuid) -> bool {
        self.access
            .get(&(plan_id, addon_id))
            .map(|a| a.enabled)
            .unwrap_or(true)
    }

    /// Unit price of an add-on on a plan, honouring the plan override
    pub fn unit_price(
        &self,
        plan_id: Uuid,
        addon_id: Uuid,
        interval: BillingInterval,
    ) -> BillingResult<Decimal> {
        let addon = self.addon(addon_id)?;
        let plan = self.plan(plan_id)?;

        match self.access.get(&(plan_id, addon_id)) {
            Some(access) if !access.enabled => Err(BillingError::Validation(format!(
                "Addon '{}' is not available on plan '{}'",
                addon.code, plan.code
            ))),
            Some(access) => {
                let override_price = match interval {
                    BillingInterval::Monthly => access.monthly_price_override,
                    BillingInterval::Yearly => access.yearly_price_override,
                };
                Ok(override_price.unwrap_or_else(|| addon.unit_price(interval)))
            }
            None => Ok(addon.unit_price(interval)),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Fixed catalog shared by unit and scenario tests

    use super::*;

    pub const STANDARD_PLAN: Uuid = Uuid::from_u128(0x1000);
    pub const PREMIUM_PLAN: Uuid = Uuid::from_u128(0x1001);
    pub const LEGACY_PLAN: Uuid = Uuid::from_u128(0x1002);
    pub const ADMIN_ADDON: Uuid = Uuid::from_u128(0x2000);
    pub const ASSOCIATION_ADDON: Uuid = Uuid::from_u128(0x2001);
    pub const COMMUNE_ADDON: Uuid = Uuid::from_u128(0x2002);

    pub fn plan(id: Uuid, code: &str, monthly: i64, yearly: i64, active: bool) -> Plan {
        Plan {
            id,
            code: code.to_string(),
            name: code.to_string(),
            monthly_price: Decimal::from(monthly),
            yearly_price: Decimal::from(yearly),
            included_admins: 1,
            included_associations: 10,
            included_communes: 1,
            is_active: active,
        }
    }

    pub fn addon(id: Uuid, code: AddonCode, monthly: i64, yearly: i64) -> Addon {
        Addon {
            id,
            code,
            name: code.as_str().to_string(),
            monthly_unit_price: Decimal::from(monthly),
            yearly_unit_price: Decimal::from(yearly),
            stripe_monthly_price_id: None,
            stripe_yearly_price_id: None,
        }
    }

    /// STANDARD 100/1200, PREMIUM 200/2400, ADMIN seat 10/100,
    /// ADMIN overridden to 50/year on PREMIUM, communes disabled on STANDARD.
    pub fn catalog() -> PricingCatalog {
        PricingCatalog::new(
            vec![
                plan(STANDARD_PLAN, "STANDARD", 100, 1200, true),
                plan(PREMIUM_PLAN, "PREMIUM", 200, 2400, true),
                plan(LEGACY_PLAN, "LEGACY", 50, 600, false),
            ],
            vec![
                addon(ADMIN_ADDON, AddonCode::ExtraAdmins, 10, 100),
                addon(ASSOCIATION_ADDON, AddonCode::ExtraAssociations, 5, 50),
                addon(COMMUNE_ADDON, AddonCode::ExtraCommunes, 20, 200),
            ],
            vec![
                PlanAddonAccess {
                    plan_id: PREMIUM_PLAN,
                    addon_id: ADMIN_ADDON,
                    enabled: true,
                    monthly_price_override: None,
                    yearly_price_override: Some(Decimal::from(50)),
                },
                PlanAddonAccess {
                    plan_id: STANDARD_PLAN,
                    addon_id: COMMUNE_ADDON,
                    enabled: false,
                    monthly_price_override: None,
                    yearly_price_override: None,
                },
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_unit_price_default() {
        let catalog = catalog();
        let price = catalog
            .unit_price(STANDARD_PLAN, ADMIN_ADDON, BillingInterval::Yearly)
            .unwrap();
        assert_eq!(price, Decimal::from(100));
    }

    #[test]
    fn test_unit_price_plan_override() {
        let catalog = catalog();
        let yearly = catalog
            .unit_price(PREMIUM_PLAN, ADMIN_ADDON, BillingInterval::Yearly)
            .unwrap();
        let monthly = catalog
            .unit_price(PREMIUM_PLAN, ADMIN_ADDON, BillingInterval::Monthly)
            .unwrap();
        assert_eq!(yearly, Decimal::from(50));
        // No monthly override: falls back to the add-on default
        assert_eq!(monthly, Decimal::from(10));
    }

    #[test]
    fn test_disabled_addon_rejected() {
        let catalog = catalog();
        let err = catalog
            .unit_price(STANDARD_PLAN, COMMUNE_ADDON, BillingInterval::Yearly)
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert!(!catalog.is_addon_enabled(STANDARD_PLAN, COMMUNE_ADDON));
    }

    #[test]
    fn test_inactive_plan_not_offered() {
        let catalog = catalog();
        assert!(catalog.plan(LEGACY_PLAN).is_ok());
        assert!(matches!(
            catalog.active_plan(LEGACY_PLAN),
            Err(BillingError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_ids_are_not_found() {
        let catalog = catalog();
        assert!(matches!(
            catalog.plan(Uuid::new_v4()),
            Err(BillingError::NotFound(_))
        ));
        assert!(matches!(
            catalog.addon(Uuid::new_v4()),
            Err(BillingError::NotFound(_))
        ));
    }

    #[test]
    fn test_addons_sorted_by_code() {
        let catalog = catalog();
        let codes: Vec<AddonCode> = catalog.addons().iter().map(|a| a.code).collect();
        assert_eq!(codes, AddonCode::all().to_vec());
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!(
            BillingInterval::from_str("annual"),
            Some(BillingInterval::Yearly)
        );
        assert_eq!(
            BillingInterval::from_str("MONTHLY"),
            Some(BillingInterval::Monthly)
        );
        assert_eq!(BillingInterval::from_str("weekly"), None);
    }
}
