//! Frozen add-on pricing
//!
//! An order stores the priced add-on lines it was created with. The snapshot
//! is the legal record of what was billed: invoices read amounts from it and
//! never re-price from the live catalog.
//!
//! Wire format is a JSON array of
//! `{ "id", "code", "name", "quantity", "unitPrice", "totalPrice" }`.
//! Decimals are encoded as strings so the value reads back exactly.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{AddonCode, BillingInterval, PricingCatalog};
use crate::entitlement::EffectiveQuantity;
use crate::error::{BillingError, BillingResult};
use crate::proration::round_money;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonLine {
    pub id: Uuid,
    pub code: AddonCode,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
}

impl AddonLine {
    pub fn new(
        id: Uuid,
        code: AddonCode,
        name: impl Into<String>,
        quantity: i32,
        unit_price: Decimal,
    ) -> BillingResult<Self> {
        if quantity < 0 {
            return Err(BillingError::Validation(format!(
                "Quantity for {} cannot be negative",
                code
            )));
        }
        if unit_price.is_sign_negative() && !unit_price.is_zero() {
            return Err(BillingError::Integrity(format!(
                "Unit price for {} is negative",
                code
            )));
        }
        Ok(Self {
            id,
            code,
            name: name.into(),
            quantity,
            unit_price,
            total_price: round_money(unit_price * Decimal::from(quantity)),
        })
    }
}

/// Typed, immutable add-on snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddonsSnapshot(Vec<AddonLine>);

impl AddonsSnapshot {
    pub fn new(lines: Vec<AddonLine>) -> Self {
        Self(lines)
    }

    /// Price the tenant's current quantities with the plan's yearly prices
    pub fn from_live(
        catalog: &PricingCatalog,
        plan_id: Uuid,
        quantities: &[EffectiveQuantity],
    ) -> BillingResult<Self> {
        let mut lines = Vec::with_capacity(quantities.len());
        for q in quantities.iter().filter(|q| q.quantity > 0) {
            let addon = catalog.addon(q.addon_id)?;
            let unit_price = catalog.unit_price(plan_id, addon.id, BillingInterval::Yearly)?;
            lines.push(AddonLine::new(
                addon.id,
                addon.code,
                addon.name.clone(),
                q.quantity,
                unit_price,
            )?);
        }
        Ok(Self(lines))
    }

    pub fn lines(&self) -> &[AddonLine] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check caller-supplied lines before they are frozen into an order.
    ///
    /// Each add-on must exist in the catalog under the same code, quantities
    /// and unit prices must not be negative, and every total must equal
    /// `round2(unitPrice × quantity)`.
    pub fn validate(&self, catalog: &PricingCatalog) -> BillingResult<()> {
        for line in &self.0 {
            let addon = catalog.addon(line.id)?;
            if addon.code != line.code {
                return Err(BillingError::Validation(format!(
                    "Add-on {} is {}, not {}",
                    line.id, addon.code, line.code
                )));
            }
            if line.quantity < 0 {
                return Err(BillingError::Validation(format!(
                    "Quantity for {} cannot be negative",
                    line.code
                )));
            }
            if line.unit_price.is_sign_negative() && !line.unit_price.is_zero() {
                return Err(BillingError::Validation(format!(
                    "Unit price for {} cannot be negative",
                    line.code
                )));
            }
            let expected = round_money(line.unit_price * Decimal::from(line.quantity));
            if line.total_price != expected {
                return Err(BillingError::Validation(format!(
                    "Total for {} is {}, expected {}",
                    line.code, line.total_price, expected
                )));
            }
        }
        Ok(())
    }

    /// Sum of the frozen line totals
    pub fn total(&self) -> Decimal {
        self.0.iter().map(|l| l.total_price).sum()
    }

    pub fn to_json(&self) -> BillingResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: serde_json::Value) -> BillingResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| BillingError::Integrity(format!("Unreadable addons snapshot: {}", e)))
    }
}
