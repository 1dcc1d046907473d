//! In-memory store
//!
//! Every unit of work runs under one lock, which gives it the same
//! all-or-nothing behaviour as a database transaction. Used by tests and by
//! local runs without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::BillingStore;
use crate::catalog::PricingCatalog;
use crate::changes::{ApplyOutcome, BillingChange, ChangeStatus, ChangeType};
use crate::error::{BillingError, BillingResult};
use crate::events::ActivityLogEntry;
use crate::ledger::LedgerEntry;
use crate::mandate::invoice::{InvoiceStatus, MandateInvoice};
use crate::mandate::order::{MandateOrder, OrderStatus};
use crate::mandate::reminder::{MandateReminder, ReminderType};
use crate::mandate::subscription::MandateSubscription;
use crate::numbering::SequenceKind;
use crate::quote::{Quote, QuoteStatus};
use crate::tenant::{BillingStatus, Tenant, TenantAddon};

#[derive(Default)]
struct State {
    catalog: PricingCatalog,
    tenants: HashMap<Uuid, Tenant>,
    tenant_addons: HashMap<(Uuid, Uuid), TenantAddon>,
    sequences: HashMap<(SequenceKind, i32), i64>,
    changes: HashMap<Uuid, BillingChange>,
    ledger: Vec<LedgerEntry>,
    orders: HashMap<Uuid, MandateOrder>,
    subscriptions: HashMap<Uuid, MandateSubscription>,
    invoices: HashMap<Uuid, MandateInvoice>,
    reminders: Vec<MandateReminder>,
    quotes: HashMap<Uuid, Quote>,
    activity: Vec<ActivityLogEntry>,
}

impl State {
    fn tenant(&self, tenant_id: Uuid) -> BillingResult<&Tenant> {
        self.tenants
            .get(&tenant_id)
            .ok_or_else(|| BillingError::NotFound(format!("Tenant {} not found", tenant_id)))
    }

    fn live_order(&self, order_id: Uuid) -> BillingResult<&MandateOrder> {
        self.orders
            .get(&order_id)
            .filter(|o| !o.is_deleted)
            .ok_or_else(|| BillingError::NotFound(format!("Order {} not found", order_id)))
    }

    fn check_order_status(&self, order_id: Uuid, expected: OrderStatus) -> BillingResult<()> {
        let stored = self.live_order(order_id)?;
        if stored.status != expected {
            return Err(BillingError::ConcurrentModification(format!(
                "Order {} is {}, expected {}",
                order_id, stored.status, expected
            )));
        }
        Ok(())
    }

    fn check_quote_status(&self, quote_id: Uuid, expected: QuoteStatus) -> BillingResult<()> {
        let stored = self
            .quotes
            .get(&quote_id)
            .ok_or_else(|| BillingError::NotFound(format!("Quote {} not found", quote_id)))?;
        if stored.status != expected {
            return Err(BillingError::ConcurrentModification(format!(
                "Quote {} is {}, expected {}",
                quote_id, stored.status, expected
            )));
        }
        Ok(())
    }

    fn has_pending_plan_change(&self, tenant_id: Uuid) -> bool {
        self.changes.values().any(|c| {
            c.tenant_id == tenant_id
                && c.change_type == ChangeType::PlanChange
                && c.status == ChangeStatus::Pending
        })
    }

    fn has_pending_addon_change(&self, tenant_id: Uuid, addon_id: Option<Uuid>) -> bool {
        self.changes.values().any(|c| {
            c.tenant_id == tenant_id
                && c.change_type == ChangeType::AddonChange
                && c.addon_id == addon_id
                && c.status == ChangeStatus::Pending
        })
    }

    fn set_addon_quantity(
        &mut self,
        tenant_id: Uuid,
        addon_id: Uuid,
        quantity: i32,
        at: OffsetDateTime,
    ) {
        self.tenant_addons
            .entry((tenant_id, addon_id))
            .and_modify(|row| {
                row.quantity = quantity;
                row.version += 1;
                row.updated_at = at;
            })
            .or_insert(TenantAddon {
                tenant_id,
                addon_id,
                quantity,
                version: 1,
                updated_at: at,
            });
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new(catalog: PricingCatalog) -> Self {
        Self {
            state: Mutex::new(State {
                catalog,
                ..Default::default()
            }),
        }
    }

    /// Swap the catalog, as an operator price update would
    pub async fn replace_catalog(&self, catalog: PricingCatalog) {
        self.state.lock().await.catalog = catalog;
    }

    pub async fn insert_tenant(&self, tenant: Tenant) {
        self.state.lock().await.tenants.insert(tenant.id, tenant);
    }

    /// Upsert an explicit add-on row, bumping its version
    pub async fn set_tenant_addon(
        &self,
        tenant_id: Uuid,
        addon_id: Uuid,
        quantity: i32,
        at: OffsetDateTime,
    ) {
        self.state
            .lock()
            .await
            .set_addon_quantity(tenant_id, addon_id, quantity, at);
    }

    pub async fn insert_subscription(&self, subscription: MandateSubscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }

    /// Every reminder, in insertion order
    pub async fn all_reminders(&self) -> Vec<MandateReminder> {
        self.state.lock().await.reminders.clone()
    }

    /// Every activity entry, in insertion order
    pub async fn all_activity(&self) -> Vec<ActivityLogEntry> {
        self.state.lock().await.activity.clone()
    }

    /// Every order including soft-deleted ones
    pub async fn all_orders(&self) -> Vec<MandateOrder> {
        let mut orders: Vec<MandateOrder> =
            self.state.lock().await.orders.values().cloned().collect();
        orders.sort_by_key(|o| (o.created_at, o.order_number.clone()));
        orders
    }

    pub async fn all_subscriptions(&self) -> Vec<MandateSubscription> {
        self.state
            .lock()
            .await
            .subscriptions
            .values()
            .cloned()
            .collect()
    }

    pub async fn all_invoices(&self) -> Vec<MandateInvoice> {
        self.state.lock().await.invoices.values().cloned().collect()
    }

    pub async fn all_changes(&self) -> Vec<BillingChange> {
        self.state.lock().await.changes.values().cloned().collect()
    }

    pub async fn all_ledger_entries(&self) -> Vec<LedgerEntry> {
        self.state.lock().await.ledger.clone()
    }
}

#[async_trait]
impl BillingStore for InMemoryStore {
    async fn load_catalog(&self) -> BillingResult<PricingCatalog> {
        Ok(self.state.lock().await.catalog.clone())
    }

    async fn get_tenant(&self, tenant_id: Uuid) -> BillingResult<Tenant> {
        self.state.lock().await.tenant(tenant_id).cloned()
    }

    async fn tenant_addons(&self, tenant_id: Uuid) -> BillingResult<Vec<TenantAddon>> {
        let state = self.state.lock().await;
        state.tenant(tenant_id)?;
        Ok(state
            .tenant_addons
            .values()
            .filter(|row| row.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn next_sequence(&self, kind: SequenceKind, year: i32) -> BillingResult<i64> {
        let mut state = self.state.lock().await;
        let counter = state.sequences.entry((kind, year)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn insert_billing_change(
        &self,
        change: &BillingChange,
        activity: &ActivityLogEntry,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.tenant(change.tenant_id)?;
        if change.change_type == ChangeType::PlanChange
            && state.has_pending_plan_change(change.tenant_id)
        {
            return Err(BillingError::DuplicateOperation(format!(
                "Tenant {} already has a pending plan change",
                change.tenant_id
            )));
        }
        if change.change_type == ChangeType::AddonChange
            && state.has_pending_addon_change(change.tenant_id, change.addon_id)
        {
            return Err(BillingError::DuplicateOperation(format!(
                "Tenant {} already has a pending change for add-on {:?}",
                change.tenant_id, change.addon_id
            )));
        }
        state.changes.insert(change.id, change.clone());
        state.activity.push(activity.clone());
        Ok(())
    }

    async fn commit_addon_change(
        &self,
        change: &BillingChange,
        expected_version: Option<i64>,
        entries: &[LedgerEntry],
        activity: &ActivityLogEntry,
    ) -> BillingResult<()> {
        let (Some(addon_id), Some(quantity)) = (change.addon_id, change.to_quantity) else {
            return Err(BillingError::Integrity(format!(
                "Add-on change {} has no add-on or quantity",
                change.id
            )));
        };

        let mut state = self.state.lock().await;
        state.tenant(change.tenant_id)?;
        if state.has_pending_addon_change(change.tenant_id, Some(addon_id)) {
            return Err(BillingError::DuplicateOperation(format!(
                "Tenant {} already has a pending change for add-on {}",
                change.tenant_id, addon_id
            )));
        }
        let stored_version = state
            .tenant_addons
            .get(&(change.tenant_id, addon_id))
            .map(|row| row.version);
        if stored_version != expected_version {
            return Err(BillingError::ConcurrentModification(format!(
                "Add-on {} of tenant {} changed concurrently",
                addon_id, change.tenant_id
            )));
        }

        let at = change.applied_at.unwrap_or(change.created_at);
        state.set_addon_quantity(change.tenant_id, addon_id, quantity, at);
        state.changes.insert(change.id, change.clone());
        state.ledger.extend_from_slice(entries);
        state.activity.push(activity.clone());
        Ok(())
    }

    async fn get_billing_change(&self, change_id: Uuid) -> BillingResult<BillingChange> {
        self.state
            .lock()
            .await
            .changes
            .get(&change_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("Billing change {} not found", change_id)))
    }

    async fn list_billing_changes(
        &self,
        tenant_id: Uuid,
        status: Option<ChangeStatus>,
    ) -> BillingResult<Vec<BillingChange>> {
        let state = self.state.lock().await;
        let mut changes: Vec<BillingChange> = state
            .changes
            .values()
            .filter(|c| c.tenant_id == tenant_id)
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        changes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(changes)
    }

    async fn due_billing_changes(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> BillingResult<Vec<BillingChange>> {
        let state = self.state.lock().await;
        let mut due: Vec<BillingChange> = state
            .changes
            .values()
            .filter(|c| c.status == ChangeStatus::Pending && c.effective_date <= now)
            .cloned()
            .collect();
        due.sort_by_key(|c| (c.effective_date, c.created_at, c.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn cancel_billing_change(
        &self,
        change_id: Uuid,
        at: OffsetDateTime,
        activity: &ActivityLogEntry,
    ) -> BillingResult<BillingChange> {
        let mut state = self.state.lock().await;
        let change = state
            .changes
            .get_mut(&change_id)
            .ok_or_else(|| BillingError::NotFound(format!("Billing change {} not found", change_id)))?;
        if change.status != ChangeStatus::Pending {
            return Err(BillingError::invalid_state(change.status, "cancel"));
        }
        change.status = ChangeStatus::Cancelled;
        change.cancelled_at = Some(at);
        let cancelled = change.clone();
        state.activity.push(activity.clone());
        Ok(cancelled)
    }

    async fn apply_billing_change(
        &self,
        change_id: Uuid,
        entries: &[LedgerEntry],
        at: OffsetDateTime,
        activity: &ActivityLogEntry,
    ) -> BillingResult<ApplyOutcome> {
        let mut state = self.state.lock().await;
        let change = state
            .changes
            .get(&change_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("Billing change {} not found", change_id)))?;

        match change.status {
            ChangeStatus::Applied => return Ok(ApplyOutcome::AlreadyApplied(change)),
            ChangeStatus::Cancelled => {
                return Err(BillingError::invalid_state(change.status, "apply"))
            }
            ChangeStatus::Pending => {}
        }

        match change.change_type {
            ChangeType::AddonChange => {
                let (Some(addon_id), Some(quantity)) = (change.addon_id, change.to_quantity) else {
                    return Err(BillingError::Integrity(format!(
                        "Add-on change {} has no add-on or quantity",
                        change.id
                    )));
                };
                state.tenant(change.tenant_id)?;
                state.set_addon_quantity(change.tenant_id, addon_id, quantity, at);
            }
            ChangeType::PlanChange => {
                let tenant = state.tenants.get_mut(&change.tenant_id).ok_or_else(|| {
                    BillingError::NotFound(format!("Tenant {} not found", change.tenant_id))
                })?;
                tenant.subscription_plan_id = change.to_plan_id;
                tenant.billing_interval = change.to_billing_interval;
            }
        }

        let mut applied = change;
        applied.status = ChangeStatus::Applied;
        applied.applied_at = Some(at);
        state.changes.insert(applied.id, applied.clone());
        state.ledger.extend_from_slice(entries);
        state.activity.push(activity.clone());
        Ok(ApplyOutcome::Applied(applied))
    }

    async fn ledger_entries(&self, tenant_id: Uuid) -> BillingResult<Vec<LedgerEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .ledger
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn insert_order(
        &self,
        order: &MandateOrder,
        activity: &ActivityLogEntry,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.orders.insert(order.id, order.clone());
        state.activity.push(activity.clone());
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> BillingResult<MandateOrder> {
        self.state.lock().await.live_order(order_id).cloned()
    }

    async fn list_orders(&self, tenant_id: Option<Uuid>) -> BillingResult<Vec<MandateOrder>> {
        let state = self.state.lock().await;
        let mut orders: Vec<MandateOrder> = state
            .orders
            .values()
            .filter(|o| !o.is_deleted)
            .filter(|o| tenant_id.map_or(true, |t| o.tenant_id == Some(t)))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn update_order(
        &self,
        order: &MandateOrder,
        expected_status: OrderStatus,
        activity: &ActivityLogEntry,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.check_order_status(order.id, expected_status)?;
        state.orders.insert(order.id, order.clone());
        state.activity.push(activity.clone());
        Ok(())
    }

    async fn accept_order(
        &self,
        order: &MandateOrder,
        expected_status: OrderStatus,
        subscription: &MandateSubscription,
        activities: &[ActivityLogEntry],
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.check_order_status(order.id, expected_status)?;
        let tenant = state
            .tenants
            .get_mut(&subscription.tenant_id)
            .ok_or_else(|| {
                BillingError::NotFound(format!("Tenant {} not found", subscription.tenant_id))
            })?;
        tenant.billing_status = BillingStatus::Active;

        state.orders.insert(order.id, order.clone());
        state
            .subscriptions
            .insert(subscription.id, subscription.clone());
        state.activity.extend_from_slice(activities);
        Ok(())
    }

    async fn invoice_order(
        &self,
        order: &MandateOrder,
        invoice: &MandateInvoice,
        reminders: &[MandateReminder],
        activities: &[ActivityLogEntry],
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.check_order_status(order.id, OrderStatus::Accepted)?;
        if reminders
            .iter()
            .any(|r| state.reminders.iter().any(|existing| existing.key() == r.key()))
        {
            return Err(BillingError::DuplicateOperation(format!(
                "Dunning reminders already scheduled for subscription {}",
                invoice.subscription_id
            )));
        }

        state.orders.insert(order.id, order.clone());
        state.invoices.insert(invoice.id, invoice.clone());
        state.reminders.extend_from_slice(reminders);
        state.activity.extend_from_slice(activities);
        Ok(())
    }

    async fn get_mandate_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<MandateSubscription> {
        self.state
            .lock()
            .await
            .subscriptions
            .get(&subscription_id)
            .cloned()
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription {} not found", subscription_id))
            })
    }

    async fn subscription_for_order(
        &self,
        order_id: Uuid,
    ) -> BillingResult<Option<MandateSubscription>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .values()
            .find(|s| s.order_id == order_id)
            .cloned())
    }

    async fn active_mandate_subscription(
        &self,
        tenant_id: Uuid,
    ) -> BillingResult<Option<MandateSubscription>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.is_active())
            .max_by_key(|s| s.start_date)
            .cloned())
    }

    async fn active_mandate_subscriptions(&self) -> BillingResult<Vec<MandateSubscription>> {
        let state = self.state.lock().await;
        let mut active: Vec<MandateSubscription> = state
            .subscriptions
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|s| s.end_date);
        Ok(active)
    }

    async fn insert_renewal_order(
        &self,
        subscription_id: Uuid,
        order: &MandateOrder,
        activities: &[ActivityLogEntry],
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let subscription = state
            .subscriptions
            .get_mut(&subscription_id)
            .ok_or_else(|| {
                BillingError::NotFound(format!("Subscription {} not found", subscription_id))
            })?;
        if let Some(existing) = subscription.renewal_order_id {
            return Err(BillingError::DuplicateOperation(format!(
                "Subscription {} already has renewal order {}",
                subscription_id, existing
            )));
        }
        subscription.renewal_order_id = Some(order.id);

        state.orders.insert(order.id, order.clone());
        state.activity.extend_from_slice(activities);
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<MandateInvoice> {
        self.state
            .lock()
            .await
            .invoices
            .get(&invoice_id)
            .filter(|i| !i.is_deleted)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {} not found", invoice_id)))
    }

    async fn invoices_for_order(&self, order_id: Uuid) -> BillingResult<Vec<MandateInvoice>> {
        let state = self.state.lock().await;
        let mut invoices: Vec<MandateInvoice> = state
            .invoices
            .values()
            .filter(|i| i.order_id == order_id && !i.is_deleted)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.created_at);
        Ok(invoices)
    }

    async fn update_invoice(
        &self,
        invoice: &MandateInvoice,
        expected_status: InvoiceStatus,
        activity: &ActivityLogEntry,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .invoices
            .get(&invoice.id)
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {} not found", invoice.id)))?;
        if stored.status != expected_status {
            return Err(BillingError::ConcurrentModification(format!(
                "Invoice {} is {}, expected {}",
                invoice.id, stored.status, expected_status
            )));
        }
        state.invoices.insert(invoice.id, invoice.clone());
        state.activity.push(activity.clone());
        Ok(())
    }

    async fn insert_reminder_if_absent(&self, reminder: &MandateReminder) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        if state.reminders.iter().any(|r| r.key() == reminder.key()) {
            return Ok(false);
        }
        state.reminders.push(reminder.clone());
        Ok(true)
    }

    async fn reminders_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<MandateReminder>> {
        let state = self.state.lock().await;
        let mut reminders: Vec<MandateReminder> = state
            .reminders
            .iter()
            .filter(|r| r.subscription_id == subscription_id)
            .cloned()
            .collect();
        reminders.sort_by_key(|r| r.scheduled_for);
        Ok(reminders)
    }

    async fn due_reminders(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> BillingResult<Vec<MandateReminder>> {
        let state = self.state.lock().await;
        let mut due: Vec<MandateReminder> = state
            .reminders
            .iter()
            .filter(|r| r.is_pending() && r.scheduled_for <= now)
            .filter(|r| match (r.reminder_type, r.invoice_id) {
                (ReminderType::Dunning, Some(invoice_id)) => state
                    .invoices
                    .get(&invoice_id)
                    .map_or(false, |i| !i.status.is_closed() && !i.is_deleted),
                _ => true,
            })
            .cloned()
            .collect();
        due.sort_by_key(|r| r.scheduled_for);
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_reminder_sent(
        &self,
        reminder_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let reminder = state
            .reminders
            .iter_mut()
            .find(|r| r.id == reminder_id)
            .ok_or_else(|| BillingError::NotFound(format!("Reminder {} not found", reminder_id)))?;
        if reminder.sent_at.is_some() {
            return Ok(false);
        }
        reminder.sent_at = Some(at);
        Ok(true)
    }

    async fn insert_quote(&self, quote: &Quote, activity: &ActivityLogEntry) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.quotes.insert(quote.id, quote.clone());
        state.activity.push(activity.clone());
        Ok(())
    }

    async fn get_quote(&self, quote_id: Uuid) -> BillingResult<Quote> {
        self.state
            .lock()
            .await
            .quotes
            .get(&quote_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("Quote {} not found", quote_id)))
    }

    async fn get_quote_by_token(&self, token: &str) -> BillingResult<Quote> {
        self.state
            .lock()
            .await
            .quotes
            .values()
            .find(|q| q.public_token == token)
            .cloned()
            .ok_or_else(|| BillingError::NotFound("Quote not found".to_string()))
    }

    async fn update_quote(
        &self,
        quote: &Quote,
        expected_status: QuoteStatus,
        activity: &ActivityLogEntry,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.check_quote_status(quote.id, expected_status)?;
        state.quotes.insert(quote.id, quote.clone());
        state.activity.push(activity.clone());
        Ok(())
    }

    async fn accept_quote_with_order(
        &self,
        quote: &Quote,
        expected_status: QuoteStatus,
        order: &MandateOrder,
        activities: &[ActivityLogEntry],
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.check_quote_status(quote.id, expected_status)?;
        state.quotes.insert(quote.id, quote.clone());
        state.orders.insert(order.id, order.clone());
        state.activity.extend_from_slice(activities);
        Ok(())
    }

    async fn activity_for_entity(&self, entity_id: Uuid) -> BillingResult<Vec<ActivityLogEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .activity
            .iter()
            .filter(|a| a.entity_id == entity_id)
            .cloned()
            .collect())
    }
}
