//! Mandate order lifecycle
//!
//! Orchestrates the order state machine, subscription activation, invoice
//! generation and invoice status changes. Every transition goes through
//! [`transition`](crate::mandate::order::transition) and is persisted together
//! with its activity entry.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::{BillingInterval, PricingCatalog};
use crate::clock::Clock;
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActivityAction, ActivityEntryBuilder, ActivityLogEntry, Actor, EntityType};
use crate::mandate::invoice::{self, InvoiceAction, InvoiceStatus, MandateInvoice};
use crate::mandate::order::{
    ClientDetails, MandateOrder, OrderAction, OrderAmounts, OrderSource, OrderStatus,
};
use crate::mandate::reminder::dunning_schedule;
use crate::mandate::snapshot::AddonsSnapshot;
use crate::mandate::subscription::{MandateSubscription, SubscriptionStatus};
use crate::numbering::{format_number, SequenceKind};
use crate::store::BillingStore;

/// Input of a new mandate order
#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    /// None for a lead not yet converted into a tenant
    pub tenant_id: Option<Uuid>,
    pub quote_id: Option<Uuid>,
    pub plan_id: Uuid,
    pub source: OrderSource,
    /// Defaults to the plan's yearly price
    pub plan_amount: Option<Decimal>,
    /// Priced add-on lines, frozen as given
    #[serde(default)]
    pub addons: AddonsSnapshot,
    #[serde(default)]
    pub discount_amount: Decimal,
    pub client: ClientDetails,
}

/// Build a PENDING_VALIDATION order with its amounts computed from the snapshot
pub(crate) fn build_order(
    new: NewOrder,
    catalog: &PricingCatalog,
    order_number: String,
    now: OffsetDateTime,
) -> BillingResult<MandateOrder> {
    let plan = catalog.plan(new.plan_id)?;
    new.addons.validate(catalog)?;
    let amounts = OrderAmounts::compute(
        new.plan_amount.unwrap_or(plan.yearly_price),
        &new.addons,
        new.discount_amount,
    )?;

    Ok(MandateOrder {
        id: Uuid::new_v4(),
        order_number,
        commande_number: None,
        quote_id: new.quote_id,
        tenant_id: new.tenant_id,
        plan_id: plan.id,
        source: new.source,
        status: OrderStatus::PendingValidation,
        billing_cycle: BillingInterval::Yearly,
        plan_amount: amounts.plan_amount,
        addons_amount: amounts.addons_amount,
        addons_snapshot: new.addons,
        annual_amount: amounts.annual_amount,
        discount_amount: amounts.discount_amount,
        final_amount: amounts.final_amount,
        client: new.client,
        purchase_order_number: None,
        documents: Vec::new(),
        rejection_reason: None,
        renews_subscription_id: None,
        is_deleted: false,
        deleted_by: None,
        deleted_at: None,
        created_at: now,
        updated_at: now,
    })
}

fn order_entry(
    order: &MandateOrder,
    action: ActivityAction,
    old_status: Option<OrderStatus>,
    actor: Actor,
    description: String,
    now: OffsetDateTime,
) -> ActivityLogEntry {
    ActivityEntryBuilder::new(EntityType::MandateOrder, order.id, action)
        .tenant(order.tenant_id)
        .statuses(old_status, order.status)
        .actor(actor)
        .description(description)
        .build(now)
}

pub struct MandateOrderService {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    config: BillingConfig,
}

impl MandateOrderService {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>, config: BillingConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Create an order in PENDING_VALIDATION, freezing its add-on pricing
    pub async fn create_order(&self, new: NewOrder, actor: Actor) -> BillingResult<MandateOrder> {
        let now = self.clock.now();
        let catalog = self.store.load_catalog().await?;
        catalog.active_plan(new.plan_id)?;
        if new.client.organization_name.trim().is_empty() {
            return Err(BillingError::Validation(
                "Client organization name is required".to_string(),
            ));
        }
        if let Some(tenant_id) = new.tenant_id {
            self.store.get_tenant(tenant_id).await?;
        }

        let sequence = self
            .store
            .next_sequence(SequenceKind::Order, now.year())
            .await?;
        let order = build_order(
            new,
            &catalog,
            format_number(SequenceKind::Order, now.year(), sequence),
            now,
        )?;

        let activity = order_entry(
            &order,
            ActivityAction::OrderCreated,
            None,
            actor,
            format!(
                "Order {} created ({}), final amount {}",
                order.order_number, order.source, order.final_amount
            ),
            now,
        );
        self.store.insert_order(&order, &activity).await?;

        tracing::info!(
            order_id = %order.id,
            order_number = %order.order_number,
            tenant_id = ?order.tenant_id,
            source = %order.source,
            final_amount = %order.final_amount,
            "Created mandate order"
        );

        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> BillingResult<MandateOrder> {
        self.store.get_order(order_id).await
    }

    pub async fn list_orders(&self, tenant_id: Option<Uuid>) -> BillingResult<Vec<MandateOrder>> {
        self.store.list_orders(tenant_id).await
    }

    /// Tenant admin attaches the purchase order (PENDING_VALIDATION -> PENDING_BC)
    pub async fn client_validate(
        &self,
        order_id: Uuid,
        documents: Vec<String>,
        actor: Actor,
    ) -> BillingResult<MandateOrder> {
        let now = self.clock.now();
        let mut order = self.store.get_order(order_id).await?;
        let documents: Vec<String> = documents
            .into_iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();

        let previous = order.apply(OrderAction::ClientValidate, now)?;
        if documents.is_empty() && order.documents.is_empty() {
            return Err(BillingError::PreconditionFailed(
                "A purchase order document must be uploaded".to_string(),
            ));
        }
        order.documents.extend(documents);

        let activity = order_entry(
            &order,
            ActivityAction::OrderClientValidated,
            Some(previous),
            actor,
            format!(
                "Client validated order {} with {} document(s)",
                order.order_number,
                order.documents.len()
            ),
            now,
        );
        self.store.update_order(&order, previous, &activity).await?;

        tracing::info!(order_id = %order.id, status = %order.status, "Client validated mandate order");
        Ok(order)
    }

    /// Operator validation.
    ///
    /// With a purchase order the order is ACCEPTED, a BC number is assigned, a
    /// one-year subscription opens and the tenant becomes ACTIVE, atomically.
    /// Without one it is parked in PENDING_BC.
    pub async fn validate_order(
        &self,
        order_id: Uuid,
        has_purchase_order: bool,
        purchase_order_number: Option<String>,
        actor: Actor,
    ) -> BillingResult<MandateOrder> {
        let now = self.clock.now();
        let mut order = self.store.get_order(order_id).await?;

        if !has_purchase_order {
            let previous = order.apply(OrderAction::Park, now)?;
            let activity = order_entry(
                &order,
                ActivityAction::OrderParked,
                Some(previous),
                actor,
                format!("Order {} waiting for purchase order", order.order_number),
                now,
            );
            self.store.update_order(&order, previous, &activity).await?;
            tracing::info!(order_id = %order.id, "Parked mandate order until purchase order arrives");
            return Ok(order);
        }

        let previous = order.apply(OrderAction::Accept, now)?;
        let tenant_id = order.tenant_id.ok_or_else(|| {
            BillingError::PreconditionFailed(format!(
                "Order {} must be linked to a tenant before acceptance",
                order.order_number
            ))
        })?;
        self.store.get_tenant(tenant_id).await?;

        let sequence = self
            .store
            .next_sequence(SequenceKind::Commande, now.year())
            .await?;
        order.commande_number = Some(format_number(SequenceKind::Commande, now.year(), sequence));
        if let Some(number) = purchase_order_number.map(|n| n.trim().to_string()) {
            if !number.is_empty() {
                order.purchase_order_number = Some(number);
            }
        }

        let subscription = MandateSubscription::open(tenant_id, order.id, order.plan_id, now)?;

        let accepted = order_entry(
            &order,
            ActivityAction::OrderAccepted,
            Some(previous),
            actor,
            format!(
                "Order {} accepted, commande {}",
                order.order_number,
                order.commande_number.as_deref().unwrap_or_default()
            ),
            now,
        );
        let opened = ActivityEntryBuilder::new(
            EntityType::MandateSubscription,
            subscription.id,
            ActivityAction::SubscriptionOpened,
        )
        .tenant(Some(tenant_id))
        .statuses(None::<SubscriptionStatus>, SubscriptionStatus::Active)
        .actor(actor)
        .description(format!(
            "Mandate subscription {} - {}",
            subscription.start_date.date(),
            subscription.end_date.date()
        ))
        .metadata(serde_json::json!({ "order_id": order.id }))
        .build(now);

        self.store
            .accept_order(&order, previous, &subscription, &[accepted, opened])
            .await?;

        tracing::info!(
            order_id = %order.id,
            tenant_id = %tenant_id,
            subscription_id = %subscription.id,
            end_date = %subscription.end_date,
            "Accepted mandate order and opened subscription"
        );

        Ok(order)
    }

    /// Operator rejection; a reason is mandatory
    pub async fn reject_order(
        &self,
        order_id: Uuid,
        reason: &str,
        actor: Actor,
    ) -> BillingResult<MandateOrder> {
        let now = self.clock.now();
        let mut order = self.store.get_order(order_id).await?;
        let previous = order.apply(OrderAction::Reject, now)?;

        let reason = reason.trim();
        if reason.is_empty() {
            return Err(BillingError::Validation(
                "A rejection reason is required".to_string(),
            ));
        }
        order.rejection_reason = Some(reason.to_string());

        let activity = order_entry(
            &order,
            ActivityAction::OrderRejected,
            Some(previous),
            actor,
            format!("Order {} rejected: {}", order.order_number, reason),
            now,
        );
        self.store.update_order(&order, previous, &activity).await?;

        tracing::info!(order_id = %order.id, "Rejected mandate order");
        Ok(order)
    }

    /// Invoice an ACCEPTED order from its frozen amounts and schedule the
    /// three dunning reminders.
    pub async fn generate_invoice(
        &self,
        order_id: Uuid,
        actor: Actor,
    ) -> BillingResult<MandateInvoice> {
        let now = self.clock.now();
        let mut order = self.store.get_order(order_id).await?;

        if order.status != OrderStatus::Accepted {
            return Err(BillingError::PreconditionFailed(format!(
                "Order {} is {}, only ACCEPTED orders can be invoiced",
                order.order_number, order.status
            )));
        }
        let tenant_id = order.tenant_id.ok_or_else(|| {
            BillingError::PreconditionFailed(format!(
                "Order {} is not linked to a tenant",
                order.order_number
            ))
        })?;
        let subscription = self
            .store
            .subscription_for_order(order.id)
            .await?
            .filter(|s| s.tenant_id == tenant_id && s.is_active())
            .ok_or_else(|| {
                BillingError::PreconditionFailed(format!(
                    "Order {} has no active mandate subscription",
                    order.order_number
                ))
            })?;

        let previous = order.apply(OrderAction::Invoice, now)?;

        let sequence = self
            .store
            .next_sequence(SequenceKind::Invoice, now.year())
            .await?;
        let invoice = MandateInvoice::from_order(
            &order,
            &subscription,
            format_number(SequenceKind::Invoice, now.year(), sequence),
            self.config.tax_rate(),
            now + Duration::days(self.config.invoice_due_days),
            now,
        )?;
        let reminders = dunning_schedule(&invoice, now);

        let invoiced = order_entry(
            &order,
            ActivityAction::OrderInvoiced,
            Some(previous),
            actor,
            format!(
                "Order {} invoiced as {}",
                order.order_number, invoice.invoice_number
            ),
            now,
        );
        self.store
            .invoice_order(&order, &invoice, &reminders, &[invoiced])
            .await?;

        tracing::info!(
            order_id = %order.id,
            invoice_id = %invoice.id,
            invoice_number = %invoice.invoice_number,
            total_with_tax = %invoice.total_with_tax,
            due_date = %invoice.due_date,
            "Generated mandate invoice"
        );

        Ok(invoice)
    }

    pub async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<MandateInvoice> {
        self.store.get_invoice(invoice_id).await
    }

    pub async fn send_invoice(&self, invoice_id: Uuid, actor: Actor) -> BillingResult<MandateInvoice> {
        self.invoice_action(invoice_id, InvoiceAction::Send, actor).await
    }

    pub async fn mark_invoice_mandated(
        &self,
        invoice_id: Uuid,
        actor: Actor,
    ) -> BillingResult<MandateInvoice> {
        self.invoice_action(invoice_id, InvoiceAction::MarkMandated, actor)
            .await
    }

    pub async fn mark_invoice_paid(
        &self,
        invoice_id: Uuid,
        actor: Actor,
    ) -> BillingResult<MandateInvoice> {
        self.invoice_action(invoice_id, InvoiceAction::MarkPaid, actor)
            .await
    }

    pub async fn cancel_invoice(
        &self,
        invoice_id: Uuid,
        actor: Actor,
    ) -> BillingResult<MandateInvoice> {
        self.invoice_action(invoice_id, InvoiceAction::Cancel, actor)
            .await
    }

    async fn invoice_action(
        &self,
        invoice_id: Uuid,
        action: InvoiceAction,
        actor: Actor,
    ) -> BillingResult<MandateInvoice> {
        let now = self.clock.now();
        let mut inv = self.store.get_invoice(invoice_id).await?;
        let previous = inv.status;
        inv.status = invoice::transition(previous, action)?;
        inv.updated_at = now;
        if inv.status == InvoiceStatus::Paid {
            inv.paid_at = Some(now);
        }

        let activity_action = match action {
            InvoiceAction::Send => ActivityAction::InvoiceSent,
            InvoiceAction::MarkMandated => ActivityAction::InvoiceMandated,
            InvoiceAction::MarkPaid => ActivityAction::InvoicePaid,
            InvoiceAction::Cancel => ActivityAction::InvoiceCancelled,
        };
        let activity = ActivityEntryBuilder::new(EntityType::MandateInvoice, inv.id, activity_action)
            .tenant(Some(inv.tenant_id))
            .statuses(Some(previous), inv.status)
            .actor(actor)
            .description(format!("Invoice {} {} -> {}", inv.invoice_number, previous, inv.status))
            .build(now);

        self.store.update_invoice(&inv, previous, &activity).await?;

        tracing::info!(
            invoice_id = %inv.id,
            from = %previous,
            to = %inv.status,
            "Updated mandate invoice status"
        );
        Ok(inv)
    }

    /// Hide an order from every operation. INVOICED orders are kept.
    pub async fn soft_delete(&self, order_id: Uuid, actor: Actor) -> BillingResult<MandateOrder> {
        let now = self.clock.now();
        let mut order = self.store.get_order(order_id).await?;
        if order.status == OrderStatus::Invoiced {
            return Err(BillingError::invalid_state(order.status, "delete"));
        }

        order.is_deleted = true;
        order.deleted_by = actor.id;
        order.deleted_at = Some(now);
        order.updated_at = now;

        let activity = order_entry(
            &order,
            ActivityAction::OrderDeleted,
            Some(order.status),
            actor,
            format!("Order {} deleted", order.order_number),
            now,
        );
        self.store.update_order(&order, order.status, &activity).await?;

        tracing::info!(order_id = %order.id, deleted_by = ?actor.id, "Soft-deleted mandate order");
        Ok(order)
    }

    /// Attach a converted lead's tenant to an unlinked order
    pub async fn link_tenant(
        &self,
        order_id: Uuid,
        tenant_id: Uuid,
        actor: Actor,
    ) -> BillingResult<MandateOrder> {
        let now = self.clock.now();
        let mut order = self.store.get_order(order_id).await?;
        if order.status == OrderStatus::Rejected {
            return Err(BillingError::invalid_state(order.status, "link_tenant"));
        }
        if let Some(existing) = order.tenant_id {
            return Err(BillingError::PreconditionFailed(format!(
                "Order {} is already linked to tenant {}",
                order.order_number, existing
            )));
        }
        self.store.get_tenant(tenant_id).await?;

        order.tenant_id = Some(tenant_id);
        order.updated_at = now;

        let activity = order_entry(
            &order,
            ActivityAction::OrderTenantLinked,
            Some(order.status),
            actor,
            format!("Order {} linked to tenant {}", order.order_number, tenant_id),
            now,
        );
        self.store.update_order(&order, order.status, &activity).await?;

        tracing::info!(order_id = %order.id, tenant_id = %tenant_id, "Linked mandate order to tenant");
        Ok(order)
    }

    /// Audit trail of an order, oldest first
    pub async fn order_activity(&self, order_id: Uuid) -> BillingResult<Vec<ActivityLogEntry>> {
        self.store.activity_for_entity(order_id).await
    }
}
