//! Quotes
//!
//! A commercial proposal priced from the catalog, shared with the client via
//! an unguessable public token. Accepting it with the mandate payment method
//! creates the mandate order in the same transaction.

use std::sync::Arc;

use rand::RngCore;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::{BillingInterval, PricingCatalog};
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActivityAction, ActivityEntryBuilder, Actor, EntityType};
use crate::mandate::order::{ClientDetails, OrderSource, OrderStatus};
use crate::mandate::service::{build_order, NewOrder};
use crate::mandate::snapshot::{AddonLine, AddonsSnapshot};
use crate::numbering::{format_number, SequenceKind};
use crate::proration::round_money;
use crate::store::BillingStore;
use crate::tenant::PaymentMethod;

/// Days a quote stays valid after creation
pub const QUOTE_VALIDITY_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuoteStatus {
    Draft,
    Sent,
    Accepted,
    Rejected,
}

impl QuoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteStatus::Draft => "DRAFT",
            QuoteStatus::Sent => "SENT",
            QuoteStatus::Accepted => "ACCEPTED",
            QuoteStatus::Rejected => "REJECTED",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(QuoteStatus::Draft),
            "SENT" => Some(QuoteStatus::Sent),
            "ACCEPTED" => Some(QuoteStatus::Accepted),
            "REJECTED" => Some(QuoteStatus::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for QuoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteLineKind {
    Plan,
    Addon,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteLine {
    pub kind: QuoteLineKind,
    /// Plan or add-on id
    pub reference_id: Uuid,
    pub code: String,
    pub label: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub id: Uuid,
    /// `DEV-YYYY-NNNNN`
    pub quote_number: String,
    pub tenant_id: Option<Uuid>,
    pub plan_id: Uuid,
    pub billing_interval: BillingInterval,
    pub lines: Vec<QuoteLine>,
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub total: Decimal,
    pub status: QuoteStatus,
    /// Chosen by the client at acceptance
    pub payment_method: Option<PaymentMethod>,
    #[serde(skip_serializing, default)]
    pub public_token: String,
    pub client: ClientDetails,
    pub valid_until: OffsetDateTime,
    pub mandate_order_id: Option<Uuid>,
    pub rejection_reason: Option<String>,
    pub sent_at: Option<OffsetDateTime>,
    pub accepted_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Quote {
    pub fn plan_amount(&self) -> Decimal {
        self.lines
            .iter()
            .filter(|l| l.kind == QuoteLineKind::Plan)
            .map(|l| l.total_price)
            .sum()
    }

    /// Add-on lines as a frozen order snapshot
    pub fn addons_snapshot(&self, catalog: &PricingCatalog) -> BillingResult<AddonsSnapshot> {
        let mut lines = Vec::new();
        for line in self.lines.iter().filter(|l| l.kind == QuoteLineKind::Addon) {
            let addon = catalog.addon(line.reference_id)?;
            lines.push(AddonLine::new(
                addon.id,
                addon.code,
                line.label.clone(),
                line.quantity,
                line.unit_price,
            )?);
        }
        Ok(AddonsSnapshot::new(lines))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewQuote {
    pub tenant_id: Option<Uuid>,
    pub plan_id: Uuid,
    /// (addon id, quantity)
    #[serde(default)]
    pub addons: Vec<(Uuid, i32)>,
    #[serde(default)]
    pub discount_amount: Decimal,
    pub client: ClientDetails,
}

/// Random URL-safe token for unauthenticated client access
pub fn generate_public_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct QuoteService {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
}

impl QuoteService {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Price a quote from the catalog (yearly prices)
    pub async fn create_quote(&self, new: NewQuote, actor: Actor) -> BillingResult<Quote> {
        let now = self.clock.now();
        let catalog = self.store.load_catalog().await?;
        let plan = catalog.active_plan(new.plan_id)?;
        let interval = BillingInterval::Yearly;

        let plan_price = plan.price(interval);
        let mut lines = vec![QuoteLine {
            kind: QuoteLineKind::Plan,
            reference_id: plan.id,
            code: plan.code.clone(),
            label: plan.name.clone(),
            quantity: 1,
            unit_price: plan_price,
            total_price: plan_price,
        }];

        for (addon_id, quantity) in &new.addons {
            if *quantity < 0 {
                return Err(BillingError::Validation(format!(
                    "Quantity cannot be negative for add-on {}",
                    addon_id
                )));
            }
            if *quantity == 0 {
                continue;
            }
            let addon = catalog.addon(*addon_id)?;
            let unit_price = catalog.unit_price(plan.id, addon.id, interval)?;
            lines.push(QuoteLine {
                kind: QuoteLineKind::Addon,
                reference_id: addon.id,
                code: addon.code.to_string(),
                label: addon.name.clone(),
                quantity: *quantity,
                unit_price,
                total_price: round_money(unit_price * Decimal::from(*quantity)),
            });
        }

        let subtotal: Decimal = lines.iter().map(|l| l.total_price).sum();
        let discount_amount = round_money(new.discount_amount);
        if discount_amount < Decimal::ZERO || discount_amount > subtotal {
            return Err(BillingError::Validation(format!(
                "Discount {} must lie between 0 and {}",
                discount_amount, subtotal
            )));
        }
        if new.client.organization_name.trim().is_empty() {
            return Err(BillingError::Validation(
                "Client organization name is required".to_string(),
            ));
        }

        let sequence = self
            .store
            .next_sequence(SequenceKind::Quote, now.year())
            .await?;

        let quote = Quote {
            id: Uuid::new_v4(),
            quote_number: format_number(SequenceKind::Quote, now.year(), sequence),
            tenant_id: new.tenant_id,
            plan_id: plan.id,
            billing_interval: interval,
            lines,
            subtotal,
            discount_amount,
            total: subtotal - discount_amount,
            status: QuoteStatus::Draft,
            payment_method: None,
            public_token: generate_public_token(),
            client: new.client,
            valid_until: now + Duration::days(QUOTE_VALIDITY_DAYS),
            mandate_order_id: None,
            rejection_reason: None,
            sent_at: None,
            accepted_at: None,
            created_at: now,
            updated_at: now,
        };

        let activity = ActivityEntryBuilder::new(EntityType::Quote, quote.id, ActivityAction::QuoteCreated)
            .tenant(quote.tenant_id)
            .statuses(None::<QuoteStatus>, QuoteStatus::Draft)
            .actor(actor)
            .description(format!("Quote {} created", quote.quote_number))
            .metadata(serde_json::json!({ "total": quote.total }))
            .build(now);

        self.store.insert_quote(&quote, &activity).await?;

        tracing::info!(
            quote_id = %quote.id,
            quote_number = %quote.quote_number,
            total = %quote.total,
            "Created quote"
        );

        Ok(quote)
    }

    /// DRAFT -> SENT
    pub async fn send_quote(&self, quote_id: Uuid, actor: Actor) -> BillingResult<Quote> {
        let now = self.clock.now();
        let mut quote = self.store.get_quote(quote_id).await?;
        if quote.status != QuoteStatus::Draft {
            return Err(BillingError::invalid_state(quote.status, "send"));
        }

        quote.status = QuoteStatus::Sent;
        quote.sent_at = Some(now);
        quote.updated_at = now;

        let activity = ActivityEntryBuilder::new(EntityType::Quote, quote.id, ActivityAction::QuoteSent)
            .tenant(quote.tenant_id)
            .statuses(Some(QuoteStatus::Draft), QuoteStatus::Sent)
            .actor(actor)
            .description(format!("Quote {} sent to client", quote.quote_number))
            .build(now);

        self.store
            .update_quote(&quote, QuoteStatus::Draft, &activity)
            .await?;
        tracing::info!(quote_id = %quote.id, "Sent quote");
        Ok(quote)
    }

    /// Client acceptance through the public token (SENT -> ACCEPTED)
    pub async fn accept_quote(
        &self,
        token: &str,
        payment_method: PaymentMethod,
    ) -> BillingResult<Quote> {
        let now = self.clock.now();
        let mut quote = self.store.get_quote_by_token(token).await?;
        if quote.status != QuoteStatus::Sent {
            return Err(BillingError::invalid_state(quote.status, "accept"));
        }
        if quote.valid_until < now {
            return Err(BillingError::PreconditionFailed(format!(
                "Quote {} expired on {}",
                quote.quote_number,
                quote.valid_until.date()
            )));
        }

        quote.status = QuoteStatus::Accepted;
        quote.payment_method = Some(payment_method);
        quote.accepted_at = Some(now);
        quote.updated_at = now;

        let accepted = ActivityEntryBuilder::new(EntityType::Quote, quote.id, ActivityAction::QuoteAccepted)
            .tenant(quote.tenant_id)
            .statuses(Some(QuoteStatus::Sent), QuoteStatus::Accepted)
            .actor(Actor::client())
            .description(format!(
                "Quote {} accepted with {} payment",
                quote.quote_number, payment_method
            ))
            .build(now);

        match payment_method {
            PaymentMethod::Card => {
                self.store
                    .update_quote(&quote, QuoteStatus::Sent, &accepted)
                    .await?;
            }
            PaymentMethod::Mandate => {
                let catalog = self.store.load_catalog().await?;
                let sequence = self
                    .store
                    .next_sequence(SequenceKind::Order, now.year())
                    .await?;
                let order = build_order(
                    NewOrder {
                        tenant_id: quote.tenant_id,
                        quote_id: Some(quote.id),
                        plan_id: quote.plan_id,
                        source: OrderSource::Quote,
                        plan_amount: Some(quote.plan_amount()),
                        addons: quote.addons_snapshot(&catalog)?,
                        discount_amount: quote.discount_amount,
                        client: quote.client.clone(),
                    },
                    &catalog,
                    format_number(SequenceKind::Order, now.year(), sequence),
                    now,
                )?;
                quote.mandate_order_id = Some(order.id);

                let created = ActivityEntryBuilder::new(
                    EntityType::MandateOrder,
                    order.id,
                    ActivityAction::OrderCreated,
                )
                .tenant(order.tenant_id)
                .statuses(None::<OrderStatus>, OrderStatus::PendingValidation)
                .actor(Actor::client())
                .description(format!(
                    "Order {} created from quote {}",
                    order.order_number, quote.quote_number
                ))
                .build(now);

                self.store
                    .accept_quote_with_order(&quote, QuoteStatus::Sent, &order, &[accepted, created])
                    .await?;

                tracing::info!(
                    quote_id = %quote.id,
                    order_id = %order.id,
                    order_number = %order.order_number,
                    "Created mandate order from accepted quote"
                );
            }
        }

        tracing::info!(quote_id = %quote.id, payment_method = %payment_method, "Quote accepted");
        Ok(quote)
    }

    /// Client refusal through the public token (SENT -> REJECTED)
    pub async fn reject_quote(&self, token: &str, reason: &str) -> BillingResult<Quote> {
        let now = self.clock.now();
        let mut quote = self.store.get_quote_by_token(token).await?;
        if quote.status != QuoteStatus::Sent {
            return Err(BillingError::invalid_state(quote.status, "reject"));
        }

        quote.status = QuoteStatus::Rejected;
        quote.rejection_reason = Some(reason.trim().to_string()).filter(|r| !r.is_empty());
        quote.updated_at = now;

        let activity = ActivityEntryBuilder::new(EntityType::Quote, quote.id, ActivityAction::QuoteRejected)
            .tenant(quote.tenant_id)
            .statuses(Some(QuoteStatus::Sent), QuoteStatus::Rejected)
            .actor(Actor::client())
            .description(format!("Quote {} rejected", quote.quote_number))
            .metadata(serde_json::json!({ "reason": quote.rejection_reason }))
            .build(now);

        self.store
            .update_quote(&quote, QuoteStatus::Sent, &activity)
            .await?;
        tracing::info!(quote_id = %quote.id, "Quote rejected");
        Ok(quote)
    }

    pub async fn get_quote(&self, quote_id: Uuid) -> BillingResult<Quote> {
        self.store.get_quote(quote_id).await
    }

    pub async fn get_by_token(&self, token: &str) -> BillingResult<Quote> {
        self.store.get_quote_by_token(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_token_is_random_hex() {
        let a = generate_public_token();
        let b = generate_public_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            QuoteStatus::Draft,
            QuoteStatus::Sent,
            QuoteStatus::Accepted,
            QuoteStatus::Rejected,
        ] {
            assert_eq!(QuoteStatus::from_str(status.as_str()), Some(status));
        }
    }
}
