//! Persistence boundary
//!
//! [`BillingStore`] names every unit of work the engine needs. Each method is
//! atomic: it either fully commits (including the activity entries passed in)
//! or leaves no trace. Conditional updates report a lost race as
//! `ConcurrentModification` rather than overwriting.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PricingCatalog;
use crate::changes::{ApplyOutcome, BillingChange, ChangeStatus};
use crate::error::BillingResult;
use crate::events::ActivityLogEntry;
use crate::ledger::LedgerEntry;
use crate::mandate::invoice::{InvoiceStatus, MandateInvoice};
use crate::mandate::order::{MandateOrder, OrderStatus};
use crate::mandate::reminder::MandateReminder;
use crate::mandate::subscription::MandateSubscription;
use crate::numbering::SequenceKind;
use crate::quote::{Quote, QuoteStatus};
use crate::tenant::{Tenant, TenantAddon};

pub use memory::InMemoryStore;
pub use postgres::PgBillingStore;

#[async_trait]
pub trait BillingStore: Send + Sync {
    // ---------------------------------------------------------------
    // Catalog and tenants
    // ---------------------------------------------------------------

    async fn load_catalog(&self) -> BillingResult<PricingCatalog>;

    async fn get_tenant(&self, tenant_id: Uuid) -> BillingResult<Tenant>;

    async fn tenant_addons(&self, tenant_id: Uuid) -> BillingResult<Vec<TenantAddon>>;

    /// Next value of the per-kind, per-year counter (starts at 1)
    async fn next_sequence(&self, kind: SequenceKind, year: i32) -> BillingResult<i64>;

    // ---------------------------------------------------------------
    // Billing changes and ledger
    // ---------------------------------------------------------------

    /// Insert a PENDING change. A second PENDING plan change for the same
    /// tenant is a `DuplicateOperation`.
    async fn insert_billing_change(
        &self,
        change: &BillingChange,
        activity: &ActivityLogEntry,
    ) -> BillingResult<()>;

    /// Insert an already APPLIED add-on change, set the tenant add-on
    /// quantity and post the ledger entries.
    ///
    /// `expected_version` is the version of the add-on row the change was
    /// computed from (`None`: no row existed). A mismatch is
    /// `ConcurrentModification`.
    async fn commit_addon_change(
        &self,
        change: &BillingChange,
        expected_version: Option<i64>,
        entries: &[LedgerEntry],
        activity: &ActivityLogEntry,
    ) -> BillingResult<()>;

    async fn get_billing_change(&self, change_id: Uuid) -> BillingResult<BillingChange>;

    /// Changes of a tenant, newest first
    async fn list_billing_changes(
        &self,
        tenant_id: Uuid,
        status: Option<ChangeStatus>,
    ) -> BillingResult<Vec<BillingChange>>;

    /// PENDING changes with `effective_date <= now`, oldest first
    async fn due_billing_changes(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> BillingResult<Vec<BillingChange>>;

    /// PENDING -> CANCELLED; any other status is `InvalidState`
    async fn cancel_billing_change(
        &self,
        change_id: Uuid,
        at: OffsetDateTime,
        activity: &ActivityLogEntry,
    ) -> BillingResult<BillingChange>;

    /// PENDING -> APPLIED with entitlement update and ledger entries.
    /// An APPLIED change is returned untouched as `AlreadyApplied`.
    async fn apply_billing_change(
        &self,
        change_id: Uuid,
        entries: &[LedgerEntry],
        at: OffsetDateTime,
        activity: &ActivityLogEntry,
    ) -> BillingResult<ApplyOutcome>;

    /// Ledger entries of a tenant, oldest first
    async fn ledger_entries(&self, tenant_id: Uuid) -> BillingResult<Vec<LedgerEntry>>;

    // ---------------------------------------------------------------
    // Mandate orders
    // ---------------------------------------------------------------

    async fn insert_order(
        &self,
        order: &MandateOrder,
        activity: &ActivityLogEntry,
    ) -> BillingResult<()>;

    /// Soft-deleted orders are `NotFound`
    async fn get_order(&self, order_id: Uuid) -> BillingResult<MandateOrder>;

    async fn list_orders(&self, tenant_id: Option<Uuid>) -> BillingResult<Vec<MandateOrder>>;

    /// Persist an order whose stored status is still `expected_status`
    async fn update_order(
        &self,
        order: &MandateOrder,
        expected_status: OrderStatus,
        activity: &ActivityLogEntry,
    ) -> BillingResult<()>;

    /// Accept an order: persist it, open the subscription and flip the
    /// tenant to ACTIVE
    async fn accept_order(
        &self,
        order: &MandateOrder,
        expected_status: OrderStatus,
        subscription: &MandateSubscription,
        activities: &[ActivityLogEntry],
    ) -> BillingResult<()>;

    /// Invoice an ACCEPTED order: persist it, the invoice and its reminders
    async fn invoice_order(
        &self,
        order: &MandateOrder,
        invoice: &MandateInvoice,
        reminders: &[MandateReminder],
        activities: &[ActivityLogEntry],
    ) -> BillingResult<()>;

    // ---------------------------------------------------------------
    // Mandate subscriptions
    // ---------------------------------------------------------------

    async fn get_mandate_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<MandateSubscription>;

    /// Subscription opened by the acceptance of an order
    async fn subscription_for_order(
        &self,
        order_id: Uuid,
    ) -> BillingResult<Option<MandateSubscription>>;

    /// Latest ACTIVE subscription of a tenant
    async fn active_mandate_subscription(
        &self,
        tenant_id: Uuid,
    ) -> BillingResult<Option<MandateSubscription>>;

    async fn active_mandate_subscriptions(&self) -> BillingResult<Vec<MandateSubscription>>;

    /// Insert a renewal order and link it to the subscription, only if the
    /// subscription has no renewal order yet (`DuplicateOperation` otherwise)
    async fn insert_renewal_order(
        &self,
        subscription_id: Uuid,
        order: &MandateOrder,
        activities: &[ActivityLogEntry],
    ) -> BillingResult<()>;

    // ---------------------------------------------------------------
    // Mandate invoices and reminders
    // ---------------------------------------------------------------

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<MandateInvoice>;

    async fn invoices_for_order(&self, order_id: Uuid) -> BillingResult<Vec<MandateInvoice>>;

    async fn update_invoice(
        &self,
        invoice: &MandateInvoice,
        expected_status: InvoiceStatus,
        activity: &ActivityLogEntry,
    ) -> BillingResult<()>;

    /// Insert unless a reminder already exists for the same
    /// (subscription, type, level). Returns whether it was inserted.
    async fn insert_reminder_if_absent(&self, reminder: &MandateReminder) -> BillingResult<bool>;

    async fn reminders_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<MandateReminder>>;

    /// Pending reminders with `scheduled_for <= now`, skipping dunning
    /// reminders of PAID or CANCELLED invoices, oldest first
    async fn due_reminders(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> BillingResult<Vec<MandateReminder>>;

    /// Stamp `sent_at` only if still null. Returns false if already stamped.
    async fn mark_reminder_sent(&self, reminder_id: Uuid, at: OffsetDateTime)
        -> BillingResult<bool>;

    // ---------------------------------------------------------------
    // Quotes
    // ---------------------------------------------------------------

    async fn insert_quote(&self, quote: &Quote, activity: &ActivityLogEntry) -> BillingResult<()>;

    async fn get_quote(&self, quote_id: Uuid) -> BillingResult<Quote>;

    async fn get_quote_by_token(&self, token: &str) -> BillingResult<Quote>;

    async fn update_quote(
        &self,
        quote: &Quote,
        expected_status: QuoteStatus,
        activity: &ActivityLogEntry,
    ) -> BillingResult<()>;

    /// Accept a quote and create its mandate order
    async fn accept_quote_with_order(
        &self,
        quote: &Quote,
        expected_status: QuoteStatus,
        order: &MandateOrder,
        activities: &[ActivityLogEntry],
    ) -> BillingResult<()>;

    // ---------------------------------------------------------------
    // Activity log
    // ---------------------------------------------------------------

    /// Activity entries about one entity, oldest first
    async fn activity_for_entity(&self, entity_id: Uuid) -> BillingResult<Vec<ActivityLogEntry>>;
}
