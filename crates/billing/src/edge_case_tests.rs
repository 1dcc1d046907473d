#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests
//!
//! End-to-end flows over the in-memory store with a fixed clock: proration
//! postings, the mandate order lifecycle, reminder sweeps, renewals and
//! quote acceptance.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::catalog::fixtures::{self, ADMIN_ADDON, PREMIUM_PLAN, STANDARD_PLAN};
use crate::catalog::{AddonCode, BillingInterval};
use crate::changes::{BillingChange, BillingChangeScheduler, ChangeStatus, ChangeType};
use crate::clock::FixedClock;
use crate::config::BillingConfig;
use crate::email::{ReminderNotice, ReminderNotifier};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActivityAction, ActivityEntryBuilder, Actor, EntityType};
use crate::ledger::{balance, entries_for_change, EntryType};
use crate::mandate::invoice::InvoiceStatus;
use crate::mandate::order::{ClientDetails, OrderSource, OrderStatus};
use crate::mandate::reminder::{ReminderSweeper, ReminderType};
use crate::mandate::renewal::RenewalEngine;
use crate::mandate::service::{MandateOrderService, NewOrder};
use crate::mandate::snapshot::{AddonLine, AddonsSnapshot};
use crate::mandate::subscription::{MandateSubscription, SubscriptionStatus};
use crate::quote::{NewQuote, QuoteService};
use crate::store::{BillingStore, InMemoryStore};
use crate::tenant::{BillingStatus, PaymentMethod, Tenant};

const NOW: OffsetDateTime = datetime!(2026-03-10 09:00 UTC);

fn tenant(plan_id: Option<Uuid>) -> Tenant {
    Tenant {
        id: Uuid::new_v4(),
        name: "Commune de Saint-Aubin".to_string(),
        billing_email: Some("mairie@saint-aubin.example".to_string()),
        subscription_plan_id: plan_id,
        billing_interval: BillingInterval::Yearly,
        billing_status: BillingStatus::Trial,
        trial_ends_at: None,
        purchased_admins: 0,
        purchased_associations: 0,
        purchased_communes: 0,
        stripe_customer_id: None,
        stripe_subscription_id: None,
        created_at: datetime!(2025-01-15 00:00 UTC),
    }
}

fn client() -> ClientDetails {
    ClientDetails {
        organization_name: "Commune de Saint-Aubin".to_string(),
        contact_name: Some("Service finances".to_string()),
        email: Some("mairie@saint-aubin.example".to_string()),
        billing_address: None,
        siret: None,
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    clock: FixedClock,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(InMemoryStore::new(fixtures::catalog())),
            clock: FixedClock::new(NOW),
        }
    }

    fn changes(&self) -> BillingChangeScheduler {
        BillingChangeScheduler::new(self.store.clone(), Arc::new(self.clock.clone()))
    }

    fn orders(&self) -> MandateOrderService {
        MandateOrderService::new(
            self.store.clone(),
            Arc::new(self.clock.clone()),
            BillingConfig::default(),
        )
    }

    fn renewals(&self) -> RenewalEngine {
        RenewalEngine::new(self.store.clone(), Arc::new(self.clock.clone()))
    }

    fn quotes(&self) -> QuoteService {
        QuoteService::new(self.store.clone(), Arc::new(self.clock.clone()))
    }

    fn sweeper(&self, notifier: Arc<dyn ReminderNotifier>) -> ReminderSweeper {
        ReminderSweeper::new(self.store.clone(), notifier, Arc::new(self.clock.clone()), 100)
    }

    async fn tenant(&self, plan_id: Option<Uuid>) -> Tenant {
        let tenant = tenant(plan_id);
        self.store.insert_tenant(tenant.clone()).await;
        tenant
    }

    /// Tenant with a subscription leaving 180 of 360 days
    async fn mid_year_tenant(&self) -> Tenant {
        let tenant = self.tenant(Some(STANDARD_PLAN)).await;
        self.store
            .insert_subscription(MandateSubscription {
                id: Uuid::new_v4(),
                tenant_id: tenant.id,
                order_id: Uuid::new_v4(),
                plan_id: STANDARD_PLAN,
                status: SubscriptionStatus::Active,
                start_date: NOW - Duration::days(180),
                end_date: NOW + Duration::days(180),
                renewal_order_id: None,
                created_at: NOW - Duration::days(180),
            })
            .await;
        tenant
    }

    /// Order for 1200 + 2 ADMIN seats at 50 each
    fn scenario_order(tenant_id: Option<Uuid>) -> NewOrder {
        NewOrder {
            tenant_id,
            quote_id: None,
            plan_id: STANDARD_PLAN,
            source: OrderSource::Signup,
            plan_amount: Some(Decimal::from(1200)),
            addons: AddonsSnapshot::new(vec![AddonLine::new(
                ADMIN_ADDON,
                AddonCode::ExtraAdmins,
                "Administrateur supplementaire",
                2,
                Decimal::from(50),
            )
            .unwrap()]),
            discount_amount: Decimal::ZERO,
            client: client(),
        }
    }
}

/// Counts deliveries; fails while `failing` is set
#[derive(Default)]
struct RecordingNotifier {
    failing: AtomicBool,
    sent: AtomicUsize,
}

#[async_trait]
impl ReminderNotifier for RecordingNotifier {
    async fn send_reminder(&self, _notice: &ReminderNotice) -> BillingResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BillingError::Notification("smtp unavailable".to_string()));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Proration Postings
// =============================================================================

#[cfg(test)]
mod proration_posting_tests {
    use super::*;

    #[tokio::test]
    async fn test_immediate_seat_increase_debits_remaining_half_year() {
        let h = Harness::new();
        let tenant = h.mid_year_tenant().await;

        let result = h
            .changes()
            .schedule_addon_change(tenant.id, ADMIN_ADDON, 2, true, Actor::operator(None))
            .await
            .unwrap();

        assert_eq!(result.change.status, ChangeStatus::Applied);
        assert_eq!(result.change.prorata_debit, Decimal::from(100));
        assert_eq!(result.change.prorata_credit, Decimal::ZERO);

        let entries = h.store.all_ledger_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, EntryType::Debit);
        assert_eq!(entries[0].amount, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_same_day_reversal_nets_to_zero() {
        let h = Harness::new();
        let tenant = h.mid_year_tenant().await;
        let changes = h.changes();

        changes
            .schedule_addon_change(tenant.id, ADMIN_ADDON, 2, true, Actor::operator(None))
            .await
            .unwrap();
        let reversal = changes
            .schedule_addon_change(tenant.id, ADMIN_ADDON, 0, true, Actor::operator(None))
            .await
            .unwrap();

        assert_eq!(reversal.change.prorata_credit, Decimal::from(100));
        assert_eq!(reversal.change.prorata_debit, Decimal::ZERO);

        let entries = h.store.all_ledger_entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(balance(&entries), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_unchanged_quantity_is_rejected() {
        let h = Harness::new();
        let tenant = h.mid_year_tenant().await;

        let err = h
            .changes()
            .schedule_addon_change(tenant.id, ADMIN_ADDON, 0, true, Actor::operator(None))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Validation(_)));
        assert!(h.store.all_changes().await.is_empty());
    }

    #[tokio::test]
    async fn test_negative_quantity_is_rejected() {
        let h = Harness::new();
        let tenant = h.mid_year_tenant().await;

        let err = h
            .changes()
            .schedule_addon_change(tenant.id, ADMIN_ADDON, -1, true, Actor::operator(None))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Validation(_)));
    }
}

// =============================================================================
// Scheduled Changes
// =============================================================================

#[cfg(test)]
mod scheduled_change_tests {
    use super::*;

    #[tokio::test]
    async fn test_deferred_change_takes_effect_first_of_next_month() {
        let h = Harness::new();
        let tenant = h.mid_year_tenant().await;

        let result = h
            .changes()
            .schedule_addon_change(tenant.id, ADMIN_ADDON, 3, false, Actor::operator(None))
            .await
            .unwrap();

        assert_eq!(result.change.status, ChangeStatus::Pending);
        assert_eq!(result.change.effective_date, datetime!(2026-04-01 00:00 UTC));
        assert!(h.store.all_ledger_entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_twice_posts_ledger_once() {
        let h = Harness::new();
        let tenant = h.mid_year_tenant().await;
        let changes = h.changes();

        let scheduled = changes
            .schedule_addon_change(tenant.id, ADMIN_ADDON, 2, false, Actor::operator(None))
            .await
            .unwrap();

        let first = changes
            .apply_billing_change(scheduled.change.id, Actor::system())
            .await
            .unwrap();
        let second = changes
            .apply_billing_change(scheduled.change.id, Actor::system())
            .await
            .unwrap();

        assert!(!first.already_applied);
        assert!(second.already_applied);
        assert_eq!(second.change.status, ChangeStatus::Applied);
        assert_eq!(h.store.all_ledger_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_then_apply_is_invalid_state() {
        let h = Harness::new();
        let tenant = h.mid_year_tenant().await;
        let changes = h.changes();

        let scheduled = changes
            .schedule_addon_change(tenant.id, ADMIN_ADDON, 2, false, Actor::operator(None))
            .await
            .unwrap();
        changes
            .cancel_pending_change(scheduled.change.id, Actor::operator(None))
            .await
            .unwrap();

        let err = changes
            .apply_billing_change(scheduled.change.id, Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState { .. }));

        let err = changes
            .cancel_pending_change(scheduled.change.id, Actor::operator(None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState { .. }));
        assert!(h.store.all_ledger_entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_second_pending_plan_change_is_duplicate() {
        let h = Harness::new();
        let tenant = h.mid_year_tenant().await;
        let changes = h.changes();

        let first = changes
            .schedule_plan_change(
                tenant.id,
                PREMIUM_PLAN,
                BillingInterval::Yearly,
                Actor::operator(None),
            )
            .await
            .unwrap();
        assert_eq!(first.change.status, ChangeStatus::Pending);
        assert_eq!(first.change.effective_date, datetime!(2026-04-01 00:00 UTC));

        let err = changes
            .schedule_plan_change(
                tenant.id,
                PREMIUM_PLAN,
                BillingInterval::Monthly,
                Actor::operator(None),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::DuplicateOperation(_)));
    }

    #[tokio::test]
    async fn test_due_plan_change_switches_tenant_plan() {
        let h = Harness::new();
        let tenant = h.mid_year_tenant().await;
        let changes = h.changes();

        changes
            .schedule_plan_change(
                tenant.id,
                PREMIUM_PLAN,
                BillingInterval::Yearly,
                Actor::operator(None),
            )
            .await
            .unwrap();

        let report = changes.apply_due_changes().await.unwrap();
        assert_eq!(report.due, 0);

        h.clock.set(datetime!(2026-04-01 00:05 UTC));
        let report = changes.apply_due_changes().await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.applied, 1);

        let store_tenant = h.store.get_tenant(tenant.id).await.unwrap();
        assert_eq!(store_tenant.subscription_plan_id, Some(PREMIUM_PLAN));

        let report = changes.apply_due_changes().await.unwrap();
        assert_eq!(report.due, 0);
    }

    #[tokio::test]
    async fn test_second_pending_addon_change_is_duplicate() {
        let h = Harness::new();
        let tenant = h.mid_year_tenant().await;
        let changes = h.changes();

        changes
            .schedule_addon_change(tenant.id, ADMIN_ADDON, 2, false, Actor::operator(None))
            .await
            .unwrap();

        let err = changes
            .schedule_addon_change(tenant.id, ADMIN_ADDON, 3, false, Actor::operator(None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::DuplicateOperation(_)));

        let err = changes
            .schedule_addon_change(tenant.id, ADMIN_ADDON, 3, true, Actor::operator(None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::DuplicateOperation(_)));

        assert_eq!(h.store.all_changes().await.len(), 1);
        assert!(h.store.all_ledger_entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_replacing_pending_addon_change_charges_final_quantity_once() {
        let h = Harness::new();
        let tenant = h.mid_year_tenant().await;
        let changes = h.changes();

        let first = changes
            .schedule_addon_change(tenant.id, ADMIN_ADDON, 2, false, Actor::operator(None))
            .await
            .unwrap();
        changes
            .cancel_pending_change(first.change.id, Actor::operator(None))
            .await
            .unwrap();
        let second = changes
            .schedule_addon_change(tenant.id, ADMIN_ADDON, 3, false, Actor::operator(None))
            .await
            .unwrap();
        assert_eq!(second.change.from_quantity, Some(0));
        assert_eq!(second.change.prorata_debit, Decimal::from(150));

        h.clock.set(datetime!(2026-04-01 00:05 UTC));
        let report = changes.apply_due_changes().await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.applied, 1);

        let entries = h.store.all_ledger_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_type, EntryType::Debit);
        assert_eq!(entries[0].amount, Decimal::from(150));

        let rows = h.store.tenant_addons(tenant.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].quantity, 3);
    }

    #[tokio::test]
    async fn test_other_addon_can_change_while_one_is_pending() {
        let h = Harness::new();
        let tenant = h.mid_year_tenant().await;
        let changes = h.changes();

        changes
            .schedule_addon_change(tenant.id, ADMIN_ADDON, 2, false, Actor::operator(None))
            .await
            .unwrap();
        let other = changes
            .schedule_addon_change(
                tenant.id,
                fixtures::ASSOCIATION_ADDON,
                1,
                false,
                Actor::operator(None),
            )
            .await
            .unwrap();
        assert_eq!(other.change.status, ChangeStatus::Pending);
    }
}

// =============================================================================
// Lost Updates
// =============================================================================

#[cfg(test)]
mod lost_update_tests {
    use super::*;

    fn seat_change(tenant_id: Uuid, from: i32, to: i32) -> BillingChange {
        BillingChange {
            id: Uuid::new_v4(),
            tenant_id,
            change_type: ChangeType::AddonChange,
            from_plan_id: Some(STANDARD_PLAN),
            to_plan_id: Some(STANDARD_PLAN),
            addon_id: Some(ADMIN_ADDON),
            from_quantity: Some(from),
            to_quantity: Some(to),
            from_billing_interval: BillingInterval::Yearly,
            to_billing_interval: BillingInterval::Yearly,
            effective_date: NOW,
            prorata_credit: Decimal::ZERO,
            prorata_debit: Decimal::from(50),
            status: ChangeStatus::Applied,
            payment_method: PaymentMethod::Mandate,
            requested_by: None,
            applied_at: Some(NOW),
            cancelled_at: None,
            created_at: NOW,
        }
    }

    #[tokio::test]
    async fn test_stale_addon_version_persists_nothing() {
        let h = Harness::new();
        let tenant = h.mid_year_tenant().await;
        h.store.set_tenant_addon(tenant.id, ADMIN_ADDON, 1, NOW).await;
        let stale = h.store.tenant_addons(tenant.id).await.unwrap()[0].version;

        // Another request lands first
        h.store.set_tenant_addon(tenant.id, ADMIN_ADDON, 4, NOW).await;
        let activity_before = h.store.all_activity().await.len();

        let change = seat_change(tenant.id, 1, 2);
        let entries = entries_for_change(&change, NOW).unwrap();
        let activity = ActivityEntryBuilder::new(
            EntityType::BillingChange,
            change.id,
            ActivityAction::BillingChangeApplied,
        )
        .tenant(Some(tenant.id))
        .statuses(None::<ChangeStatus>, ChangeStatus::Applied)
        .build(NOW);

        let err = h
            .store
            .commit_addon_change(&change, Some(stale), &entries, &activity)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::ConcurrentModification(_)));
        assert!(h.store.all_changes().await.is_empty());
        assert!(h.store.all_ledger_entries().await.is_empty());
        assert_eq!(h.store.all_activity().await.len(), activity_before);
        let rows = h.store.tenant_addons(tenant.id).await.unwrap();
        assert_eq!(rows[0].quantity, 4);
    }

    #[tokio::test]
    async fn test_missing_row_raced_by_insert_is_concurrent() {
        let h = Harness::new();
        let tenant = h.mid_year_tenant().await;

        // Read saw no row; a concurrent request created one
        h.store.set_tenant_addon(tenant.id, ADMIN_ADDON, 3, NOW).await;

        let change = seat_change(tenant.id, 0, 2);
        let entries = entries_for_change(&change, NOW).unwrap();
        let activity = ActivityEntryBuilder::new(
            EntityType::BillingChange,
            change.id,
            ActivityAction::BillingChangeApplied,
        )
        .build(NOW);

        let err = h
            .store
            .commit_addon_change(&change, None, &entries, &activity)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::ConcurrentModification(_)));
        assert!(h.store.all_ledger_entries().await.is_empty());
    }
}

// =============================================================================
// Mandate Order Lifecycle
// =============================================================================

#[cfg(test)]
mod mandate_lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_accepting_order_opens_year_long_subscription() {
        let h = Harness::new();
        let tenant = h.tenant(Some(PREMIUM_PLAN)).await;
        let orders = h.orders();

        let order = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::tenant_admin(tenant.id))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::PendingValidation);
        assert_eq!(order.addons_amount, Decimal::from(100));
        assert_eq!(order.final_amount, Decimal::from(1300));
        assert_eq!(order.order_number, "CMD-2026-00001");

        let accepted = orders
            .validate_order(order.id, true, Some("PO-7781".to_string()), Actor::operator(None))
            .await
            .unwrap();
        assert_eq!(accepted.status, OrderStatus::Accepted);
        assert_eq!(accepted.commande_number.as_deref(), Some("BC-2026-00001"));

        let subscriptions = h.store.all_subscriptions().await;
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].start_date, NOW);
        assert_eq!(subscriptions[0].end_date, NOW + Duration::days(365));

        let store_tenant = h.store.get_tenant(tenant.id).await.unwrap();
        assert_eq!(store_tenant.billing_status, BillingStatus::Active);
        assert_eq!(store_tenant.subscription_plan_id, Some(PREMIUM_PLAN));
    }

    #[tokio::test]
    async fn test_invoice_schedules_three_dunning_reminders() {
        let h = Harness::new();
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let orders = h.orders();

        let order = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();
        orders
            .validate_order(order.id, true, None, Actor::operator(None))
            .await
            .unwrap();
        let invoice = orders
            .generate_invoice(order.id, Actor::operator(None))
            .await
            .unwrap();

        assert_eq!(invoice.status, InvoiceStatus::Draft);
        assert_eq!(invoice.due_date, invoice.created_at + Duration::days(30));
        assert_eq!(invoice.final_amount, Decimal::from(1300));
        assert_eq!(invoice.invoice_number, "FAC-2026-00001");

        let mut reminders = h.store.all_reminders().await;
        reminders.sort_by_key(|r| r.reminder_level);
        assert_eq!(reminders.len(), 3);
        for (reminder, offset) in reminders.iter().zip([35, 50, 65]) {
            assert_eq!(reminder.reminder_type, ReminderType::Dunning);
            assert_eq!(reminder.scheduled_for, invoice.due_date + Duration::days(offset));
            assert!(reminder.sent_at.is_none());
        }
        assert_eq!(
            reminders.iter().map(|r| r.reminder_level).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let order = orders.get_order(order.id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Invoiced);
    }

    #[tokio::test]
    async fn test_invoice_on_parked_order_leaves_no_rows() {
        let h = Harness::new();
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let orders = h.orders();

        let order = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();
        let parked = orders
            .validate_order(order.id, false, None, Actor::operator(None))
            .await
            .unwrap();
        assert_eq!(parked.status, OrderStatus::PendingBc);

        let err = orders
            .generate_invoice(order.id, Actor::operator(None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PreconditionFailed(_)));
        assert!(h.store.all_invoices().await.is_empty());
        assert!(h.store.all_reminders().await.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_survives_catalog_price_change() {
        let h = Harness::new();
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let orders = h.orders();

        let order = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();

        h.store
            .replace_catalog(crate::catalog::PricingCatalog::new(
                vec![fixtures::plan(STANDARD_PLAN, "STANDARD", 100, 1200, true)],
                vec![fixtures::addon(ADMIN_ADDON, AddonCode::ExtraAdmins, 40, 400)],
                Vec::new(),
            ))
            .await;

        orders
            .validate_order(order.id, true, None, Actor::operator(None))
            .await
            .unwrap();
        let invoice = orders
            .generate_invoice(order.id, Actor::operator(None))
            .await
            .unwrap();

        assert_eq!(invoice.addons_amount, Decimal::from(100));
        assert_eq!(invoice.final_amount, Decimal::from(1300));
    }

    #[tokio::test]
    async fn test_client_validation_requires_document() {
        let h = Harness::new();
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let orders = h.orders();

        let order = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();

        let err = orders
            .client_validate(order.id, vec!["  ".to_string()], Actor::tenant_admin(tenant.id))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PreconditionFailed(_)));
        assert_eq!(
            orders.get_order(order.id).await.unwrap().status,
            OrderStatus::PendingValidation
        );

        let validated = orders
            .client_validate(
                order.id,
                vec!["orders/bc-7781.pdf".to_string()],
                Actor::tenant_admin(tenant.id),
            )
            .await
            .unwrap();
        assert_eq!(validated.status, OrderStatus::PendingBc);
        assert_eq!(validated.documents, vec!["orders/bc-7781.pdf".to_string()]);

        let err = orders
            .client_validate(
                order.id,
                vec!["orders/bc-7782.pdf".to_string()],
                Actor::tenant_admin(tenant.id),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_rejected_order_is_terminal() {
        let h = Harness::new();
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let orders = h.orders();

        let order = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();
        let rejected = orders
            .reject_order(order.id, "Budget not voted", Actor::operator(None))
            .await
            .unwrap();
        assert_eq!(rejected.status, OrderStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("Budget not voted"));

        let err = orders
            .validate_order(order.id, true, None, Actor::operator(None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState { .. }));
        assert!(h.store.all_subscriptions().await.is_empty());

        let err = orders
            .link_tenant(order.id, tenant.id, Actor::operator(None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_reject_checks_state_before_reason() {
        let h = Harness::new();
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let orders = h.orders();

        let order = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();

        let err = orders
            .reject_order(order.id, "  ", Actor::operator(None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));

        orders
            .validate_order(order.id, true, None, Actor::operator(None))
            .await
            .unwrap();
        orders
            .generate_invoice(order.id, Actor::operator(None))
            .await
            .unwrap();

        let err = orders
            .reject_order(order.id, "", Actor::operator(None))
            .await
            .unwrap_err();
        match err {
            BillingError::InvalidState { from, action } => {
                assert_eq!(from, "INVOICED");
                assert_eq!(action, "reject");
            }
            other => panic!("expected InvalidState, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_each_invoice_binds_its_own_subscription() {
        let h = Harness::new();
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let orders = h.orders();

        let first = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();
        orders
            .validate_order(first.id, true, None, Actor::operator(None))
            .await
            .unwrap();

        h.clock.advance(Duration::days(1));
        let second = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();
        orders
            .validate_order(second.id, true, None, Actor::operator(None))
            .await
            .unwrap();

        let subscriptions = h.store.all_subscriptions().await;
        let own = |order_id: Uuid| {
            subscriptions
                .iter()
                .find(|s| s.order_id == order_id)
                .map(|s| s.id)
                .unwrap()
        };

        let first_invoice = orders
            .generate_invoice(first.id, Actor::operator(None))
            .await
            .unwrap();
        let second_invoice = orders
            .generate_invoice(second.id, Actor::operator(None))
            .await
            .unwrap();

        assert_eq!(first_invoice.subscription_id, own(first.id));
        assert_eq!(second_invoice.subscription_id, own(second.id));
        assert_eq!(h.store.all_reminders().await.len(), 6);
    }

    #[tokio::test]
    async fn test_invoice_requires_order_subscription_to_be_active() {
        let h = Harness::new();
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let orders = h.orders();

        let order = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();
        orders
            .validate_order(order.id, true, None, Actor::operator(None))
            .await
            .unwrap();

        let mut subscription = h.store.all_subscriptions().await.remove(0);
        subscription.status = SubscriptionStatus::Cancelled;
        h.store.insert_subscription(subscription).await;
        // Another active subscription of the tenant must not be borrowed
        h.store
            .insert_subscription(
                MandateSubscription::open(tenant.id, Uuid::new_v4(), STANDARD_PLAN, NOW).unwrap(),
            )
            .await;

        let err = orders
            .generate_invoice(order.id, Actor::operator(None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PreconditionFailed(_)));
        assert!(h.store.all_invoices().await.is_empty());
        assert!(h.store.all_reminders().await.is_empty());
    }

    #[tokio::test]
    async fn test_every_transition_is_audited() {
        let h = Harness::new();
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let orders = h.orders();

        let order = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();
        orders
            .validate_order(order.id, false, None, Actor::operator(None))
            .await
            .unwrap();
        orders
            .validate_order(order.id, true, None, Actor::operator(None))
            .await
            .unwrap();
        orders
            .generate_invoice(order.id, Actor::operator(None))
            .await
            .unwrap();

        let trail = orders.order_activity(order.id).await.unwrap();
        let statuses: Vec<_> = trail
            .iter()
            .map(|e| (e.old_status.clone(), e.new_status.clone()))
            .collect();
        assert_eq!(
            statuses,
            vec![
                (None, Some("PENDING_VALIDATION".to_string())),
                (
                    Some("PENDING_VALIDATION".to_string()),
                    Some("PENDING_BC".to_string())
                ),
                (Some("PENDING_BC".to_string()), Some("ACCEPTED".to_string())),
                (Some("ACCEPTED".to_string()), Some("INVOICED".to_string())),
            ]
        );
    }
}

// =============================================================================
// Leads, Deletion and Invoices
// =============================================================================

#[cfg(test)]
mod order_maintenance_tests {
    use super::*;

    #[tokio::test]
    async fn test_lead_order_needs_tenant_before_acceptance() {
        let h = Harness::new();
        let orders = h.orders();

        let order = orders
            .create_order(Harness::scenario_order(None), Actor::operator(None))
            .await
            .unwrap();

        let err = orders
            .validate_order(order.id, true, None, Actor::operator(None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PreconditionFailed(_)));
        assert_eq!(
            orders.get_order(order.id).await.unwrap().status,
            OrderStatus::PendingValidation
        );

        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let linked = orders
            .link_tenant(order.id, tenant.id, Actor::operator(None))
            .await
            .unwrap();
        assert_eq!(linked.tenant_id, Some(tenant.id));

        let err = orders
            .link_tenant(order.id, tenant.id, Actor::operator(None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PreconditionFailed(_)));

        let accepted = orders
            .validate_order(order.id, true, None, Actor::operator(None))
            .await
            .unwrap();
        assert_eq!(accepted.status, OrderStatus::Accepted);
    }

    #[tokio::test]
    async fn test_soft_deleted_order_is_hidden() {
        let h = Harness::new();
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let orders = h.orders();
        let operator = Uuid::new_v4();

        let order = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();
        let deleted = orders
            .soft_delete(order.id, Actor::operator(Some(operator)))
            .await
            .unwrap();
        assert!(deleted.is_deleted);
        assert_eq!(deleted.deleted_by, Some(operator));

        let err = orders.get_order(order.id).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
        assert!(orders.list_orders(Some(tenant.id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invoiced_order_cannot_be_deleted() {
        let h = Harness::new();
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let orders = h.orders();

        let order = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();
        orders
            .validate_order(order.id, true, None, Actor::operator(None))
            .await
            .unwrap();
        orders
            .generate_invoice(order.id, Actor::operator(None))
            .await
            .unwrap();

        let err = orders
            .soft_delete(order.id, Actor::operator(None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_invoice_status_walk_and_cancel_after_paid() {
        let h = Harness::new();
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let orders = h.orders();

        let order = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();
        orders
            .validate_order(order.id, true, None, Actor::operator(None))
            .await
            .unwrap();
        let invoice = orders
            .generate_invoice(order.id, Actor::operator(None))
            .await
            .unwrap();

        let sent = orders.send_invoice(invoice.id, Actor::operator(None)).await.unwrap();
        assert_eq!(sent.status, InvoiceStatus::Sent);
        let mandated = orders
            .mark_invoice_mandated(invoice.id, Actor::operator(None))
            .await
            .unwrap();
        assert_eq!(mandated.status, InvoiceStatus::Mandated);
        let paid = orders
            .mark_invoice_paid(invoice.id, Actor::operator(None))
            .await
            .unwrap();
        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert_eq!(paid.paid_at, Some(NOW));

        let err = orders
            .cancel_invoice(invoice.id, Actor::operator(None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState { .. }));
    }

    fn order_with_line(tenant_id: Uuid, quantity: i32, unit: i64, total: i64) -> NewOrder {
        let mut new = Harness::scenario_order(Some(tenant_id));
        new.addons = AddonsSnapshot::new(vec![AddonLine {
            id: ADMIN_ADDON,
            code: AddonCode::ExtraAdmins,
            name: "Administrateur supplementaire".to_string(),
            quantity,
            unit_price: Decimal::from(unit),
            total_price: Decimal::from(total),
        }]);
        new
    }

    #[tokio::test]
    async fn test_create_order_rejects_malformed_addon_lines() {
        let h = Harness::new();
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let orders = h.orders();

        for new in [
            order_with_line(tenant.id, -5, 50, -250),
            order_with_line(tenant.id, 2, -50, -100),
            order_with_line(tenant.id, 2, 50, 1),
        ] {
            let err = orders
                .create_order(new, Actor::operator(None))
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::Validation(_)), "{:?}", err);
        }
        assert!(h.store.all_orders().await.is_empty());

        let order = orders
            .create_order(order_with_line(tenant.id, 2, 50, 100), Actor::operator(None))
            .await
            .unwrap();
        assert_eq!(order.addons_amount, Decimal::from(100));
        assert_eq!(order.final_amount, Decimal::from(1300));
    }

    #[tokio::test]
    async fn test_create_order_for_inactive_plan_fails() {
        let h = Harness::new();
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let mut new = Harness::scenario_order(Some(tenant.id));
        new.plan_id = fixtures::LEGACY_PLAN;

        let err = h
            .orders()
            .create_order(new, Actor::operator(None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
        assert!(h.store.all_orders().await.is_empty());
    }
}

// =============================================================================
// Reminder Sweep
// =============================================================================

#[cfg(test)]
mod reminder_sweep_tests {
    use super::*;

    async fn invoiced(h: &Harness) -> Tenant {
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let orders = h.orders();
        let order = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();
        orders
            .validate_order(order.id, true, None, Actor::operator(None))
            .await
            .unwrap();
        let invoice = orders
            .generate_invoice(order.id, Actor::operator(None))
            .await
            .unwrap();
        orders.send_invoice(invoice.id, Actor::operator(None)).await.unwrap();
        tenant
    }

    #[tokio::test]
    async fn test_nothing_due_before_first_dunning_date() {
        let h = Harness::new();
        invoiced(&h).await;
        let notifier = Arc::new(RecordingNotifier::default());

        let report = h.sweeper(notifier.clone()).run().await.unwrap();

        assert_eq!(report.due, 0);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried_on_next_sweep() {
        let h = Harness::new();
        invoiced(&h).await;
        let notifier = Arc::new(RecordingNotifier::default());
        notifier.failing.store(true, Ordering::SeqCst);
        let sweeper = h.sweeper(notifier.clone());

        h.clock.advance(Duration::days(30 + 36));
        let report = sweeper.run().await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.failed, 1);
        assert!(h.store.all_reminders().await.iter().all(|r| r.sent_at.is_none()));

        notifier.failing.store(false, Ordering::SeqCst);
        let report = sweeper.run().await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);

        let report = sweeper.run().await.unwrap();
        assert_eq!(report.due, 0);
    }

    #[tokio::test]
    async fn test_paid_invoice_stops_dunning() {
        let h = Harness::new();
        let tenant = invoiced(&h).await;
        let invoice = h
            .store
            .all_invoices()
            .await
            .into_iter()
            .find(|i| i.tenant_id == tenant.id)
            .unwrap();
        h.orders()
            .mark_invoice_paid(invoice.id, Actor::operator(None))
            .await
            .unwrap();

        let notifier = Arc::new(RecordingNotifier::default());
        h.clock.advance(Duration::days(200));
        let report = h.sweeper(notifier.clone()).run().await.unwrap();

        assert_eq!(report.due, 0);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 0);
    }
}

// =============================================================================
// Renewals
// =============================================================================

#[cfg(test)]
mod renewal_tests {
    use super::*;

    async fn accepted(h: &Harness) -> (Tenant, MandateSubscription) {
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let orders = h.orders();
        let order = orders
            .create_order(Harness::scenario_order(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();
        orders
            .validate_order(order.id, true, None, Actor::operator(None))
            .await
            .unwrap();
        let subscription = h.store.all_subscriptions().await.remove(0);
        (tenant, subscription)
    }

    #[tokio::test]
    async fn test_second_renewal_order_is_duplicate() {
        let h = Harness::new();
        let (tenant, subscription) = accepted(&h).await;
        let renewals = h.renewals();

        let order = renewals
            .generate_renewal_order(subscription.id, Actor::system())
            .await
            .unwrap();
        assert_eq!(order.source, OrderSource::Renewal);
        assert_eq!(order.tenant_id, Some(tenant.id));
        assert_eq!(order.renews_subscription_id, Some(subscription.id));
        assert_eq!(order.discount_amount, Decimal::ZERO);

        let err = renewals
            .generate_renewal_order(subscription.id, Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::DuplicateOperation(_)));

        let renewal_orders = h
            .store
            .all_orders()
            .await
            .into_iter()
            .filter(|o| o.source == OrderSource::Renewal)
            .count();
        assert_eq!(renewal_orders, 1);
    }

    #[tokio::test]
    async fn test_renewal_reprices_from_live_quantities() {
        let h = Harness::new();
        let (tenant, subscription) = accepted(&h).await;
        h.store.set_tenant_addon(tenant.id, ADMIN_ADDON, 3, NOW).await;

        let order = h
            .renewals()
            .generate_renewal_order(subscription.id, Actor::system())
            .await
            .unwrap();

        assert_eq!(order.plan_amount, Decimal::from(1200));
        assert_eq!(order.addons_amount, Decimal::from(300));
        assert_eq!(order.final_amount, Decimal::from(1500));
        assert_eq!(order.client, client());
    }

    #[tokio::test]
    async fn test_reminders_created_as_thresholds_are_crossed() {
        let h = Harness::new();
        let (_, subscription) = accepted(&h).await;
        let renewals = h.renewals();

        let report = renewals.schedule_renewal_reminders().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.created, 0);

        h.clock.set(subscription.end_date - Duration::days(45));
        let report = renewals.schedule_renewal_reminders().await.unwrap();
        assert_eq!(report.created, 1);

        let report = renewals.schedule_renewal_reminders().await.unwrap();
        assert_eq!(report.created, 0);

        h.clock.set(subscription.end_date - Duration::days(10));
        let report = renewals.schedule_renewal_reminders().await.unwrap();
        assert_eq!(report.created, 2);

        let mut levels: Vec<_> = h
            .store
            .all_reminders()
            .await
            .into_iter()
            .filter(|r| r.reminder_type == ReminderType::Renewal)
            .map(|r| r.reminder_level)
            .collect();
        levels.sort_unstable();
        assert_eq!(levels, vec![1, 2, 3]);
    }
}

// =============================================================================
// Quotes
// =============================================================================

#[cfg(test)]
mod quote_tests {
    use super::*;

    fn new_quote(tenant_id: Option<Uuid>) -> NewQuote {
        NewQuote {
            tenant_id,
            plan_id: STANDARD_PLAN,
            addons: vec![(ADMIN_ADDON, 2)],
            discount_amount: Decimal::from(100),
            client: client(),
        }
    }

    #[tokio::test]
    async fn test_mandate_acceptance_creates_pending_order() {
        let h = Harness::new();
        let tenant = h.tenant(Some(STANDARD_PLAN)).await;
        let quotes = h.quotes();

        let quote = quotes
            .create_quote(new_quote(Some(tenant.id)), Actor::operator(None))
            .await
            .unwrap();
        assert_eq!(quote.subtotal, Decimal::from(1400));
        assert_eq!(quote.total, Decimal::from(1300));
        assert_eq!(quote.quote_number, "DEV-2026-00001");

        let sent = quotes.send_quote(quote.id, Actor::operator(None)).await.unwrap();
        let accepted = quotes
            .accept_quote(&sent.public_token, PaymentMethod::Mandate)
            .await
            .unwrap();

        let order_id = accepted.mandate_order_id.unwrap();
        let order = h.orders().get_order(order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::PendingValidation);
        assert_eq!(order.source, OrderSource::Quote);
        assert_eq!(order.quote_id, Some(quote.id));
        assert_eq!(order.plan_amount, Decimal::from(1200));
        assert_eq!(order.addons_amount, Decimal::from(200));
        assert_eq!(order.final_amount, Decimal::from(1300));
    }

    #[tokio::test]
    async fn test_card_acceptance_creates_no_order() {
        let h = Harness::new();
        let quotes = h.quotes();

        let quote = quotes
            .create_quote(new_quote(None), Actor::operator(None))
            .await
            .unwrap();
        let sent = quotes.send_quote(quote.id, Actor::operator(None)).await.unwrap();
        let accepted = quotes
            .accept_quote(&sent.public_token, PaymentMethod::Card)
            .await
            .unwrap();

        assert!(accepted.mandate_order_id.is_none());
        assert!(h.store.all_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_expired_quote_cannot_be_accepted() {
        let h = Harness::new();
        let quotes = h.quotes();

        let quote = quotes
            .create_quote(new_quote(None), Actor::operator(None))
            .await
            .unwrap();
        let sent = quotes.send_quote(quote.id, Actor::operator(None)).await.unwrap();

        h.clock.advance(Duration::days(31));
        let err = quotes
            .accept_quote(&sent.public_token, PaymentMethod::Mandate)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PreconditionFailed(_)));
        assert!(h.store.all_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_draft_quote_cannot_be_accepted() {
        let h = Harness::new();
        let quotes = h.quotes();

        let quote = quotes
            .create_quote(new_quote(None), Actor::operator(None))
            .await
            .unwrap();
        let err = quotes
            .accept_quote(&quote.public_token, PaymentMethod::Mandate)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState { .. }));
    }
}
