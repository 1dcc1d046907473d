//! Ledger
//!
//! Append-only credits and debits against a tenant's billing account. The
//! balance is derived from the entries on every read and never stored.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::changes::BillingChange;
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    Credit,
    Debit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Credit => "CREDIT",
            EntryType::Debit => "DEBIT",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "CREDIT" => Some(EntryType::Credit),
            "DEBIT" => Some(EntryType::Debit),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub billing_change_id: Option<Uuid>,
    pub entry_type: EntryType,
    /// Always >= 0; the sign comes from `entry_type`
    pub amount: Decimal,
    pub description: String,
    pub created_at: OffsetDateTime,
}

impl LedgerEntry {
    pub fn new(
        tenant_id: Uuid,
        billing_change_id: Option<Uuid>,
        entry_type: EntryType,
        amount: Decimal,
        description: impl Into<String>,
        at: OffsetDateTime,
    ) -> BillingResult<Self> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(BillingError::Integrity(format!(
                "Ledger {} of {} for tenant {} would be negative",
                entry_type, amount, tenant_id
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            tenant_id,
            billing_change_id,
            entry_type,
            amount,
            description: description.into(),
            created_at: at,
        })
    }

    /// Contribution to the balance
    pub fn signed_amount(&self) -> Decimal {
        match self.entry_type {
            EntryType::Credit => self.amount,
            EntryType::Debit => -self.amount,
        }
    }
}

/// Entries posted when a change is applied: one CREDIT and/or one DEBIT,
/// each only when its amount is positive.
pub fn entries_for_change(
    change: &BillingChange,
    at: OffsetDateTime,
) -> BillingResult<Vec<LedgerEntry>> {
    let mut entries = Vec::with_capacity(2);
    let summary = change.summary();

    if change.prorata_credit > Decimal::ZERO {
        entries.push(LedgerEntry::new(
            change.tenant_id,
            Some(change.id),
            EntryType::Credit,
            change.prorata_credit,
            format!("Prorated credit: {}", summary),
            at,
        )?);
    } else if change.prorata_credit < Decimal::ZERO {
        return Err(BillingError::Integrity(format!(
            "Change {} carries a negative credit",
            change.id
        )));
    }

    if change.prorata_debit > Decimal::ZERO {
        entries.push(LedgerEntry::new(
            change.tenant_id,
            Some(change.id),
            EntryType::Debit,
            change.prorata_debit,
            format!("Prorated charge: {}", summary),
            at,
        )?);
    } else if change.prorata_debit < Decimal::ZERO {
        return Err(BillingError::Integrity(format!(
            "Change {} carries a negative debit",
            change.id
        )));
    }

    Ok(entries)
}

/// Running balance: sum of credits minus sum of debits
pub fn balance(entries: &[LedgerEntry]) -> Decimal {
    entries.iter().map(LedgerEntry::signed_amount).sum()
}

/// Read side of the ledger
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn BillingStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Entries for a tenant, oldest first
    pub async fn entries(&self, tenant_id: Uuid) -> BillingResult<Vec<LedgerEntry>> {
        self.store.ledger_entries(tenant_id).await
    }

    pub async fn balance(&self, tenant_id: Uuid) -> BillingResult<Decimal> {
        let entries = self.store.ledger_entries(tenant_id).await?;
        Ok(balance(&entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const AT: OffsetDateTime = datetime!(2026-05-01 00:00 UTC);

    #[test]
    fn test_negative_amount_is_integrity_error() {
        let result = LedgerEntry::new(
            Uuid::new_v4(),
            None,
            EntryType::Credit,
            Decimal::new(-1, 2),
            "bad",
            AT,
        );
        assert!(matches!(result, Err(BillingError::Integrity(_))));
    }

    #[test]
    fn test_balance_is_credits_minus_debits() {
        let tenant = Uuid::new_v4();
        let entries = vec![
            LedgerEntry::new(tenant, None, EntryType::Credit, Decimal::from(300), "c", AT).unwrap(),
            LedgerEntry::new(tenant, None, EntryType::Debit, Decimal::from(600), "d", AT).unwrap(),
            LedgerEntry::new(tenant, None, EntryType::Credit, Decimal::new(5050, 2), "c", AT)
                .unwrap(),
        ];
        assert_eq!(balance(&entries), Decimal::new(-24950, 2));
        assert_eq!(balance(&[]), Decimal::ZERO);
    }
}
