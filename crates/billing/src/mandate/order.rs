//! Mandate order state machine
//!
//! ```text
//! PENDING_VALIDATION --client_validate--> PENDING_BC
//! PENDING_VALIDATION | PENDING_BC --accept--> ACCEPTED --invoice--> INVOICED
//! PENDING_VALIDATION | PENDING_BC --park--> PENDING_BC
//! PENDING_VALIDATION | PENDING_BC --reject--> REJECTED
//! ```
//!
//! [`transition`] is the single entry point deciding whether an action is
//! allowed. Soft deletion is a flag orthogonal to status.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::BillingInterval;
use crate::error::{BillingError, BillingResult};
use crate::mandate::snapshot::AddonsSnapshot;
use crate::proration::round_money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    PendingValidation,
    PendingBc,
    Accepted,
    Invoiced,
    Rejected,
}

impl OrderStatus {
    pub fn all() -> [OrderStatus; 5] {
        [
            OrderStatus::PendingValidation,
            OrderStatus::PendingBc,
            OrderStatus::Accepted,
            OrderStatus::Invoiced,
            OrderStatus::Rejected,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingValidation => "PENDING_VALIDATION",
            OrderStatus::PendingBc => "PENDING_BC",
            OrderStatus::Accepted => "ACCEPTED",
            OrderStatus::Invoiced => "INVOICED",
            OrderStatus::Rejected => "REJECTED",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING_VALIDATION" => Some(OrderStatus::PendingValidation),
            "PENDING_BC" => Some(OrderStatus::PendingBc),
            "ACCEPTED" => Some(OrderStatus::Accepted),
            "INVOICED" => Some(OrderStatus::Invoiced),
            "REJECTED" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Invoiced | OrderStatus::Rejected)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderAction {
    /// Tenant admin attaches the purchase order document
    ClientValidate,
    /// Operator confirms a purchase order number is present
    Accept,
    /// Operator validates but no purchase order yet
    Park,
    Reject,
    Invoice,
}

impl OrderAction {
    pub fn all() -> [OrderAction; 5] {
        [
            OrderAction::ClientValidate,
            OrderAction::Accept,
            OrderAction::Park,
            OrderAction::Reject,
            OrderAction::Invoice,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::ClientValidate => "client_validate",
            OrderAction::Accept => "accept",
            OrderAction::Park => "park",
            OrderAction::Reject => "reject",
            OrderAction::Invoice => "invoice",
        }
    }
}

impl std::fmt::Display for OrderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transition table: `(from, action) -> to`, `InvalidState` otherwise
pub fn transition(from: OrderStatus, action: OrderAction) -> BillingResult<OrderStatus> {
    use OrderAction as A;
    use OrderStatus as S;

    match (from, action) {
        (S::PendingValidation, A::ClientValidate) => Ok(S::PendingBc),
        (S::PendingValidation | S::PendingBc, A::Accept) => Ok(S::Accepted),
        (S::PendingValidation | S::PendingBc, A::Park) => Ok(S::PendingBc),
        (S::PendingValidation | S::PendingBc, A::Reject) => Ok(S::Rejected),
        (S::Accepted, A::Invoice) => Ok(S::Invoiced),
        _ => Err(BillingError::invalid_state(from, action)),
    }
}

/// How the order came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSource {
    Signup,
    Quote,
    LeadConversion,
    Renewal,
}

impl OrderSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSource::Signup => "SIGNUP",
            OrderSource::Quote => "QUOTE",
            OrderSource::LeadConversion => "LEAD_CONVERSION",
            OrderSource::Renewal => "RENEWAL",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SIGNUP" => Some(OrderSource::Signup),
            "QUOTE" => Some(OrderSource::Quote),
            "LEAD_CONVERSION" => Some(OrderSource::LeadConversion),
            "RENEWAL" => Some(OrderSource::Renewal),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Buyer identity printed on the order and the invoice
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDetails {
    pub organization_name: String,
    pub contact_name: Option<String>,
    pub email: Option<String>,
    pub billing_address: Option<String>,
    pub siret: Option<String>,
}

/// Order amounts derived from the plan price, the snapshot and the discount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAmounts {
    pub plan_amount: Decimal,
    pub addons_amount: Decimal,
    pub annual_amount: Decimal,
    pub discount_amount: Decimal,
    pub final_amount: Decimal,
}

impl OrderAmounts {
    pub fn compute(
        plan_amount: Decimal,
        snapshot: &AddonsSnapshot,
        discount_amount: Decimal,
    ) -> BillingResult<Self> {
        if plan_amount.is_sign_negative() && !plan_amount.is_zero() {
            return Err(BillingError::Validation(format!(
                "Plan amount cannot be negative: {}",
                plan_amount
            )));
        }
        let plan_amount = round_money(plan_amount);
        let addons_amount = round_money(snapshot.total());
        let annual_amount = plan_amount + addons_amount;
        let discount_amount = round_money(discount_amount);

        if discount_amount.is_sign_negative() && !discount_amount.is_zero() {
            return Err(BillingError::Validation(
                "Discount cannot be negative".to_string(),
            ));
        }
        if discount_amount > annual_amount {
            return Err(BillingError::Validation(format!(
                "Discount {} exceeds annual amount {}",
                discount_amount, annual_amount
            )));
        }

        Ok(Self {
            plan_amount,
            addons_amount,
            annual_amount,
            discount_amount,
            final_amount: annual_amount - discount_amount,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MandateOrder {
    pub id: Uuid,
    /// `CMD-YYYY-NNNNN`
    pub order_number: String,
    /// `BC-YYYY-NNNNN`, assigned on acceptance
    pub commande_number: Option<String>,
    pub quote_id: Option<Uuid>,
    /// None until a lead is converted into a tenant
    pub tenant_id: Option<Uuid>,
    pub plan_id: Uuid,
    pub source: OrderSource,
    pub status: OrderStatus,
    pub billing_cycle: BillingInterval,
    pub plan_amount: Decimal,
    pub addons_amount: Decimal,
    pub addons_snapshot: AddonsSnapshot,
    pub annual_amount: Decimal,
    pub discount_amount: Decimal,
    pub final_amount: Decimal,
    pub client: ClientDetails,
    pub purchase_order_number: Option<String>,
    /// Object-storage keys of uploaded purchase order documents
    pub documents: Vec<String>,
    pub rejection_reason: Option<String>,
    /// Subscription this order renews
    pub renews_subscription_id: Option<Uuid>,
    pub is_deleted: bool,
    pub deleted_by: Option<Uuid>,
    pub deleted_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl MandateOrder {
    /// Apply an action in memory, returning the previous status
    pub fn apply(&mut self, action: OrderAction, at: OffsetDateTime) -> BillingResult<OrderStatus> {
        let next = transition(self.status, action)?;
        let previous = self.status;
        self.status = next;
        self.updated_at = at;
        Ok(previous)
    }

    pub fn amounts(&self) -> OrderAmounts {
        OrderAmounts {
            plan_amount: self.plan_amount,
            addons_amount: self.addons_amount,
            annual_amount: self.annual_amount,
            discount_amount: self.discount_amount,
            final_amount: self.final_amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::AddonCode;
    use crate::mandate::snapshot::AddonLine;

    #[test]
    fn test_allowed_transitions() {
        use OrderAction as A;
        use OrderStatus as S;

        assert_eq!(transition(S::PendingValidation, A::ClientValidate).unwrap(), S::PendingBc);
        assert_eq!(transition(S::PendingValidation, A::Accept).unwrap(), S::Accepted);
        assert_eq!(transition(S::PendingBc, A::Accept).unwrap(), S::Accepted);
        assert_eq!(transition(S::PendingValidation, A::Park).unwrap(), S::PendingBc);
        assert_eq!(transition(S::PendingBc, A::Park).unwrap(), S::PendingBc);
        assert_eq!(transition(S::PendingBc, A::Reject).unwrap(), S::Rejected);
        assert_eq!(transition(S::Accepted, A::Invoice).unwrap(), S::Invoiced);
    }

    #[test]
    fn test_every_other_pair_is_invalid_state() {
        let allowed = [
            (OrderStatus::PendingValidation, OrderAction::ClientValidate),
            (OrderStatus::PendingValidation, OrderAction::Accept),
            (OrderStatus::PendingBc, OrderAction::Accept),
            (OrderStatus::PendingValidation, OrderAction::Park),
            (OrderStatus::PendingBc, OrderAction::Park),
            (OrderStatus::PendingValidation, OrderAction::Reject),
            (OrderStatus::PendingBc, OrderAction::Reject),
            (OrderStatus::Accepted, OrderAction::Invoice),
        ];

        for status in OrderStatus::all() {
            for action in OrderAction::all() {
                let result = transition(status, action);
                if allowed.contains(&(status, action)) {
                    assert!(result.is_ok(), "{} / {} should be allowed", status, action);
                } else {
                    match result {
                        Err(BillingError::InvalidState { from, action: a }) => {
                            assert_eq!(from, status.as_str());
                            assert_eq!(a, action.as_str());
                        }
                        other => panic!("{} / {} gave {:?}", status, action, other),
                    }
                }
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Invoiced.is_terminal());
        assert!(!OrderStatus::Accepted.is_terminal());
    }

    #[test]
    fn test_amounts_with_snapshot_and_discount() {
        let snapshot = AddonsSnapshot::new(vec![AddonLine::new(
            Uuid::new_v4(),
            AddonCode::ExtraAdmins,
            "Admin",
            2,
            Decimal::from(50),
        )
        .unwrap()]);

        let amounts = OrderAmounts::compute(Decimal::from(1200), &snapshot, Decimal::ZERO).unwrap();
        assert_eq!(amounts.addons_amount, Decimal::from(100));
        assert_eq!(amounts.annual_amount, Decimal::from(1300));
        assert_eq!(amounts.final_amount, Decimal::from(1300));

        let discounted =
            OrderAmounts::compute(Decimal::from(1200), &snapshot, Decimal::from(300)).unwrap();
        assert_eq!(discounted.final_amount, Decimal::from(1000));
    }

    #[test]
    fn test_discount_bounds() {
        let empty = AddonsSnapshot::default();
        assert!(matches!(
            OrderAmounts::compute(Decimal::from(100), &empty, Decimal::from(101)),
            Err(BillingError::Validation(_))
        ));
        assert!(matches!(
            OrderAmounts::compute(Decimal::from(100), &empty, Decimal::from(-1)),
            Err(BillingError::Validation(_))
        ));
        assert!(OrderAmounts::compute(Decimal::from(100), &empty, Decimal::from(100)).is_ok());
    }
}
