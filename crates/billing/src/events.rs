//! Activity log
//!
//! Append-only audit trail of every billing state change. Mandate billing is
//! audited externally, so an entry is not optional: every store method that
//! mutates an order, invoice, subscription, quote or billing change takes an
//! [`ActivityLogEntry`] and persists it in the same transaction.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Kind of record an activity entry is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    BillingChange,
    MandateOrder,
    MandateInvoice,
    MandateSubscription,
    Quote,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::BillingChange => "BILLING_CHANGE",
            EntityType::MandateOrder => "MANDATE_ORDER",
            EntityType::MandateInvoice => "MANDATE_INVOICE",
            EntityType::MandateSubscription => "MANDATE_SUBSCRIPTION",
            EntityType::Quote => "QUOTE",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BILLING_CHANGE" => Some(EntityType::BillingChange),
            "MANDATE_ORDER" => Some(EntityType::MandateOrder),
            "MANDATE_INVOICE" => Some(EntityType::MandateInvoice),
            "MANDATE_SUBSCRIPTION" => Some(EntityType::MandateSubscription),
            "QUOTE" => Some(EntityType::Quote),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityAction {
    // Billing changes
    BillingChangeScheduled,
    BillingChangeApplied,
    BillingChangeCancelled,

    // Mandate orders
    OrderCreated,
    OrderClientValidated,
    OrderAccepted,
    OrderParked,
    OrderRejected,
    OrderInvoiced,
    OrderDeleted,
    OrderTenantLinked,

    // Mandate subscriptions
    SubscriptionOpened,
    RenewalOrderGenerated,

    // Mandate invoices
    InvoiceSent,
    InvoiceMandated,
    InvoicePaid,
    InvoiceCancelled,

    // Quotes
    QuoteCreated,
    QuoteSent,
    QuoteAccepted,
    QuoteRejected,
}

impl std::fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityAction::BillingChangeScheduled => "BILLING_CHANGE_SCHEDULED",
            ActivityAction::BillingChangeApplied => "BILLING_CHANGE_APPLIED",
            ActivityAction::BillingChangeCancelled => "BILLING_CHANGE_CANCELLED",
            ActivityAction::OrderCreated => "ORDER_CREATED",
            ActivityAction::OrderClientValidated => "ORDER_CLIENT_VALIDATED",
            ActivityAction::OrderAccepted => "ORDER_ACCEPTED",
            ActivityAction::OrderParked => "ORDER_PARKED",
            ActivityAction::OrderRejected => "ORDER_REJECTED",
            ActivityAction::OrderInvoiced => "ORDER_INVOICED",
            ActivityAction::OrderDeleted => "ORDER_DELETED",
            ActivityAction::OrderTenantLinked => "ORDER_TENANT_LINKED",
            ActivityAction::SubscriptionOpened => "SUBSCRIPTION_OPENED",
            ActivityAction::RenewalOrderGenerated => "RENEWAL_ORDER_GENERATED",
            ActivityAction::InvoiceSent => "INVOICE_SENT",
            ActivityAction::InvoiceMandated => "INVOICE_MANDATED",
            ActivityAction::InvoicePaid => "INVOICE_PAID",
            ActivityAction::InvoiceCancelled => "INVOICE_CANCELLED",
            ActivityAction::QuoteCreated => "QUOTE_CREATED",
            ActivityAction::QuoteSent => "QUOTE_SENT",
            ActivityAction::QuoteAccepted => "QUOTE_ACCEPTED",
            ActivityAction::QuoteRejected => "QUOTE_REJECTED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// Platform operator in the back office
    Operator,
    /// Administrator of the tenant
    TenantAdmin,
    /// Unauthenticated client holding a quote token
    Client,
    /// Scheduled job or automation
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::Operator => write!(f, "operator"),
            ActorType::TenantAdmin => write!(f, "tenant_admin"),
            ActorType::Client => write!(f, "client"),
            ActorType::System => write!(f, "system"),
        }
    }
}

impl ActorType {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "operator" => Some(ActorType::Operator),
            "tenant_admin" => Some(ActorType::TenantAdmin),
            "client" => Some(ActorType::Client),
            "system" => Some(ActorType::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Option<Uuid>,
    pub actor_type: ActorType,
}

impl Actor {
    pub fn operator(id: Option<Uuid>) -> Self {
        Self {
            id,
            actor_type: ActorType::Operator,
        }
    }

    pub fn tenant_admin(id: Uuid) -> Self {
        Self {
            id: Some(id),
            actor_type: ActorType::TenantAdmin,
        }
    }

    pub fn client() -> Self {
        Self {
            id: None,
            actor_type: ActorType::Client,
        }
    }

    pub fn system() -> Self {
        Self {
            id: None,
            actor_type: ActorType::System,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub action: String,
    pub old_status: Option<String>,
    pub new_status: Option<String>,
    pub actor_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub description: String,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Builder for activity entries
pub struct ActivityEntryBuilder {
    tenant_id: Option<Uuid>,
    entity_type: EntityType,
    entity_id: Uuid,
    action: ActivityAction,
    old_status: Option<String>,
    new_status: Option<String>,
    actor: Actor,
    description: String,
    metadata: serde_json::Value,
}

impl ActivityEntryBuilder {
    pub fn new(entity_type: EntityType, entity_id: Uuid, action: ActivityAction) -> Self {
        Self {
            tenant_id: None,
            entity_type,
            entity_id,
            action,
            old_status: None,
            new_status: None,
            actor: Actor::system(),
            description: String::new(),
            metadata: serde_json::json!({}),
        }
    }

    pub fn tenant(mut self, tenant_id: Option<Uuid>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    /// Record the status transition
    pub fn statuses(
        mut self,
        old_status: Option<impl std::fmt::Display>,
        new_status: impl std::fmt::Display,
    ) -> Self {
        self.old_status = old_status.map(|s| s.to_string());
        self.new_status = Some(new_status.to_string());
        self
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn build(self, at: OffsetDateTime) -> ActivityLogEntry {
        ActivityLogEntry {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            action: self.action.to_string(),
            old_status: self.old_status,
            new_status: self.new_status,
            actor_id: self.actor.id,
            actor_type: self.actor.actor_type,
            description: self.description,
            metadata: self.metadata,
            created_at: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_action_display() {
        assert_eq!(ActivityAction::OrderAccepted.to_string(), "ORDER_ACCEPTED");
        assert_eq!(
            ActivityAction::BillingChangeApplied.to_string(),
            "BILLING_CHANGE_APPLIED"
        );
    }

    #[test]
    fn test_actor_type_round_trip() {
        for actor in [
            ActorType::Operator,
            ActorType::TenantAdmin,
            ActorType::Client,
            ActorType::System,
        ] {
            assert_eq!(ActorType::from_str(&actor.to_string()), Some(actor));
        }
    }

    #[test]
    fn test_builder_records_transition_and_actor() {
        let order_id = Uuid::new_v4();
        let operator = Uuid::new_v4();
        let entry = ActivityEntryBuilder::new(
            EntityType::MandateOrder,
            order_id,
            ActivityAction::OrderRejected,
        )
        .statuses(Some("PENDING_BC"), "REJECTED")
        .actor(Actor::operator(Some(operator)))
        .description("Rejected: budget line closed")
        .build(datetime!(2026-05-01 10:00 UTC));

        assert_eq!(entry.entity_id, order_id);
        assert_eq!(entry.action, "ORDER_REJECTED");
        assert_eq!(entry.old_status.as_deref(), Some("PENDING_BC"));
        assert_eq!(entry.new_status.as_deref(), Some("REJECTED"));
        assert_eq!(entry.actor_id, Some(operator));
        assert_eq!(entry.actor_type, ActorType::Operator);
    }
}
