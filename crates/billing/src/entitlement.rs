//! Effective add-on quantities
//!
//! A tenant's purchased quantity for an add-on comes from two tiers:
//!
//! 1. An explicit `TenantAddon` row, when one exists, always wins.
//! 2. Otherwise the legacy `purchased_*` column matching the add-on code.
//!
//! Every reader of quantities (proration, renewals, admin views) goes through
//! [`resolve_effective_quantity`] so the fallback lives in exactly one place.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{Addon, AddonCode, PricingCatalog};
use crate::tenant::{Tenant, TenantAddon};

/// Where an effective quantity was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantitySource {
    /// Explicit tenant add-on row
    Explicit,
    /// Reconstructed from the tenant's legacy purchased column
    Legacy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveQuantity {
    pub addon_id: Uuid,
    pub code: AddonCode,
    pub quantity: i32,
    pub source: QuantitySource,
    /// Version of the explicit row, `None` for virtual add-ons
    pub version: Option<i64>,
}

/// Legacy column backing an add-on code
pub fn legacy_quantity(tenant: &Tenant, code: AddonCode) -> i32 {
    match code {
        AddonCode::ExtraAdmins => tenant.purchased_admins,
        AddonCode::ExtraAssociations => tenant.purchased_associations,
        AddonCode::ExtraCommunes => tenant.purchased_communes,
    }
}

/// Resolve the quantity a tenant holds for one add-on
pub fn resolve_effective_quantity(
    tenant: &Tenant,
    addon: &Addon,
    rows: &[TenantAddon],
) -> EffectiveQuantity {
    match rows
        .iter()
        .find(|r| r.tenant_id == tenant.id && r.addon_id == addon.id)
    {
        Some(row) => EffectiveQuantity {
            addon_id: addon.id,
            code: addon.code,
            quantity: row.quantity,
            source: QuantitySource::Explicit,
            version: Some(row.version),
        },
        None => EffectiveQuantity {
            addon_id: addon.id,
            code: addon.code,
            quantity: legacy_quantity(tenant, addon.code).max(0),
            source: QuantitySource::Legacy,
            version: None,
        },
    }
}

/// Non-zero effective quantities for every add-on in the catalog
pub fn effective_addons(
    tenant: &Tenant,
    catalog: &PricingCatalog,
    rows: &[TenantAddon],
) -> Vec<EffectiveQuantity> {
    catalog
        .addons()
        .into_iter()
        .map(|addon| resolve_effective_quantity(tenant, addon, rows))
        .filter(|q| q.quantity > 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fixtures::*;
    use crate::catalog::BillingInterval;
    use crate::tenant::BillingStatus;
    use time::macros::datetime;

    fn tenant() -> Tenant {
        Tenant {
            id: Uuid::from_u128(7),
            name: "Commune de Test".to_string(),
            billing_email: None,
            subscription_plan_id: Some(STANDARD_PLAN),
            billing_interval: BillingInterval::Yearly,
            billing_status: BillingStatus::Active,
            trial_ends_at: None,
            purchased_admins: 3,
            purchased_associations: 0,
            purchased_communes: 2,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            created_at: datetime!(2025-03-01 00:00 UTC),
        }
    }

    fn row(tenant: &Tenant, addon_id: Uuid, quantity: i32) -> TenantAddon {
        TenantAddon {
            tenant_id: tenant.id,
            addon_id,
            quantity,
            version: 4,
            updated_at: datetime!(2026-01-01 00:00 UTC),
        }
    }

    #[test]
    fn test_explicit_row_wins_over_legacy_column() {
        let catalog = catalog();
        let tenant = tenant();
        let rows = vec![row(&tenant, ADMIN_ADDON, 1)];

        let q = resolve_effective_quantity(&tenant, catalog.addon(ADMIN_ADDON).unwrap(), &rows);
        assert_eq!(q.quantity, 1);
        assert_eq!(q.source, QuantitySource::Explicit);
        assert_eq!(q.version, Some(4));
    }

    #[test]
    fn test_legacy_column_used_without_row() {
        let catalog = catalog();
        let tenant = tenant();

        let q = resolve_effective_quantity(&tenant, catalog.addon(ADMIN_ADDON).unwrap(), &[]);
        assert_eq!(q.quantity, 3);
        assert_eq!(q.source, QuantitySource::Legacy);
        assert_eq!(q.version, None);
    }

    #[test]
    fn test_explicit_zero_row_hides_legacy_quantity() {
        let catalog = catalog();
        let tenant = tenant();
        let rows = vec![row(&tenant, COMMUNE_ADDON, 0)];

        let q = resolve_effective_quantity(&tenant, catalog.addon(COMMUNE_ADDON).unwrap(), &rows);
        assert_eq!(q.quantity, 0);
    }

    #[test]
    fn test_effective_addons_skips_zero_quantities() {
        let catalog = catalog();
        let tenant = tenant();

        let addons = effective_addons(&tenant, &catalog, &[]);
        let codes: Vec<AddonCode> = addons.iter().map(|a| a.code).collect();
        assert_eq!(codes, vec![AddonCode::ExtraAdmins, AddonCode::ExtraCommunes]);
    }

    #[test]
    fn test_rows_of_other_tenants_ignored() {
        let catalog = catalog();
        let tenant = tenant();
        let mut other = row(&tenant, ADMIN_ADDON, 9);
        other.tenant_id = Uuid::from_u128(99);

        let q = resolve_effective_quantity(&tenant, catalog.addon(ADMIN_ADDON).unwrap(), &[other]);
        assert_eq!(q.quantity, 3);
    }
}
