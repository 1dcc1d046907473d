//! Mandate invoices
//!
//! `DRAFT -> SENT -> MANDATED -> PAID`; PAID is also reachable straight from
//! SENT, and any state before PAID may be CANCELLED.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::mandate::order::MandateOrder;
use crate::mandate::subscription::MandateSubscription;
use crate::proration::round_money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Mandated,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    pub fn all() -> [InvoiceStatus; 5] {
        [
            InvoiceStatus::Draft,
            InvoiceStatus::Sent,
            InvoiceStatus::Mandated,
            InvoiceStatus::Paid,
            InvoiceStatus::Cancelled,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "DRAFT",
            InvoiceStatus::Sent => "SENT",
            InvoiceStatus::Mandated => "MANDATED",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Cancelled => "CANCELLED",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(InvoiceStatus::Draft),
            "SENT" => Some(InvoiceStatus::Sent),
            "MANDATED" => Some(InvoiceStatus::Mandated),
            "PAID" => Some(InvoiceStatus::Paid),
            "CANCELLED" => Some(InvoiceStatus::Cancelled),
            _ => None,
        }
    }

    /// Dunning stops once the invoice is settled or voided
    pub fn is_closed(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Cancelled)
    }
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceAction {
    Send,
    MarkMandated,
    MarkPaid,
    Cancel,
}

impl InvoiceAction {
    pub fn all() -> [InvoiceAction; 4] {
        [
            InvoiceAction::Send,
            InvoiceAction::MarkMandated,
            InvoiceAction::MarkPaid,
            InvoiceAction::Cancel,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceAction::Send => "send",
            InvoiceAction::MarkMandated => "mark_mandated",
            InvoiceAction::MarkPaid => "mark_paid",
            InvoiceAction::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for InvoiceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub fn transition(from: InvoiceStatus, action: InvoiceAction) -> BillingResult<InvoiceStatus> {
    use InvoiceAction as A;
    use InvoiceStatus as S;

    match (from, action) {
        (S::Draft, A::Send) => Ok(S::Sent),
        (S::Sent, A::MarkMandated) => Ok(S::Mandated),
        (S::Sent | S::Mandated, A::MarkPaid) => Ok(S::Paid),
        (S::Draft | S::Sent | S::Mandated, A::Cancel) => Ok(S::Cancelled),
        _ => Err(BillingError::invalid_state(from, action)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MandateInvoice {
    pub id: Uuid,
    /// `FAC-YYYY-NNNNN`
    pub invoice_number: String,
    pub order_id: Uuid,
    pub subscription_id: Uuid,
    pub tenant_id: Uuid,
    pub status: InvoiceStatus,
    pub plan_amount: Decimal,
    pub addons_amount: Decimal,
    pub discount_amount: Decimal,
    pub final_amount: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub total_with_tax: Decimal,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub due_date: OffsetDateTime,
    pub paid_at: Option<OffsetDateTime>,
    pub is_deleted: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl MandateInvoice {
    /// Draft invoice mirroring the order's frozen amounts.
    ///
    /// `tax_rate` is a fraction (0.20 for 20%).
    pub fn from_order(
        order: &MandateOrder,
        subscription: &MandateSubscription,
        invoice_number: String,
        tax_rate: Decimal,
        due_date: OffsetDateTime,
        now: OffsetDateTime,
    ) -> BillingResult<Self> {
        let tenant_id = order.tenant_id.ok_or_else(|| {
            BillingError::PreconditionFailed(format!(
                "Order {} is not linked to a tenant",
                order.order_number
            ))
        })?;
        let tax_amount = round_money(order.final_amount * tax_rate);

        Ok(Self {
            id: Uuid::new_v4(),
            invoice_number,
            order_id: order.id,
            subscription_id: subscription.id,
            tenant_id,
            status: InvoiceStatus::Draft,
            plan_amount: order.plan_amount,
            addons_amount: order.addons_amount,
            discount_amount: order.discount_amount,
            final_amount: order.final_amount,
            tax_rate,
            tax_amount,
            total_with_tax: order.final_amount + tax_amount,
            period_start: subscription.start_date,
            period_end: subscription.end_date,
            due_date,
            paid_at: None,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_transition_table() {
        let allowed = [
            (InvoiceStatus::Draft, InvoiceAction::Send, InvoiceStatus::Sent),
            (InvoiceStatus::Sent, InvoiceAction::MarkMandated, InvoiceStatus::Mandated),
            (InvoiceStatus::Sent, InvoiceAction::MarkPaid, InvoiceStatus::Paid),
            (InvoiceStatus::Mandated, InvoiceAction::MarkPaid, InvoiceStatus::Paid),
            (InvoiceStatus::Draft, InvoiceAction::Cancel, InvoiceStatus::Cancelled),
            (InvoiceStatus::Sent, InvoiceAction::Cancel, InvoiceStatus::Cancelled),
            (InvoiceStatus::Mandated, InvoiceAction::Cancel, InvoiceStatus::Cancelled),
        ];

        for status in InvoiceStatus::all() {
            for action in InvoiceAction::all() {
                let expected = allowed
                    .iter()
                    .find(|(s, a, _)| *s == status && *a == action)
                    .map(|(_, _, to)| *to);
                match (transition(status, action), expected) {
                    (Ok(to), Some(want)) => assert_eq!(to, want),
                    (Err(BillingError::InvalidState { .. }), None) => {}
                    (got, want) => panic!("{} / {}: got {:?}, want {:?}", status, action, got, want),
                }
            }
        }
    }

    #[test]
    fn test_paid_cannot_be_cancelled() {
        assert!(transition(InvoiceStatus::Paid, InvoiceAction::Cancel).is_err());
        assert!(InvoiceStatus::Paid.is_closed());
        assert!(!InvoiceStatus::Mandated.is_closed());
    }
}
