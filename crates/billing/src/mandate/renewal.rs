//! Renewal engine
//!
//! Schedules the J-60/J-30/J-15 renewal reminders of active mandate
//! subscriptions and generates the renewal order, priced from the tenant's
//! live entitlements.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::entitlement::effective_addons;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActivityAction, ActivityEntryBuilder, Actor, EntityType};
use crate::mandate::order::{ClientDetails, MandateOrder, OrderSource, OrderStatus};
use crate::mandate::reminder::{renewal_level, renewal_reminder, RENEWAL_THRESHOLDS_DAYS};
use crate::mandate::service::{build_order, NewOrder};
use crate::mandate::snapshot::AddonsSnapshot;
use crate::numbering::{format_number, SequenceKind};
use crate::store::BillingStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenewalReport {
    /// Active subscriptions examined
    pub checked: usize,
    /// Reminders created by this run
    pub created: usize,
}

pub struct RenewalEngine {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
}

impl RenewalEngine {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create the missing renewal reminders of every active subscription
    /// whose remaining time has crossed a threshold. Safe to re-run.
    pub async fn schedule_renewal_reminders(&self) -> BillingResult<RenewalReport> {
        let now = self.clock.now();
        let subscriptions = self.store.active_mandate_subscriptions().await?;
        let mut report = RenewalReport {
            checked: subscriptions.len(),
            ..Default::default()
        };

        for subscription in &subscriptions {
            let days_remaining = subscription.days_remaining(now);
            for threshold in RENEWAL_THRESHOLDS_DAYS {
                if days_remaining > threshold {
                    continue;
                }
                let Some(level) = renewal_level(threshold) else {
                    continue;
                };
                let reminder = renewal_reminder(subscription, threshold, level, now);
                if self.store.insert_reminder_if_absent(&reminder).await? {
                    report.created += 1;
                    tracing::info!(
                        subscription_id = %subscription.id,
                        tenant_id = %subscription.tenant_id,
                        level = level,
                        scheduled_for = %reminder.scheduled_for,
                        "Scheduled renewal reminder"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Generate the one renewal order of a subscription.
    ///
    /// Add-ons are re-priced from the tenant's current quantities and the
    /// renewal carries no discount.
    pub async fn generate_renewal_order(
        &self,
        subscription_id: Uuid,
        actor: Actor,
    ) -> BillingResult<MandateOrder> {
        let now = self.clock.now();
        let subscription = self.store.get_mandate_subscription(subscription_id).await?;
        if let Some(existing) = subscription.renewal_order_id {
            return Err(BillingError::DuplicateOperation(format!(
                "Subscription {} already has renewal order {}",
                subscription.id, existing
            )));
        }
        if !subscription.is_active() {
            return Err(BillingError::PreconditionFailed(format!(
                "Subscription {} is {}",
                subscription.id, subscription.status
            )));
        }

        let tenant = self.store.get_tenant(subscription.tenant_id).await?;
        let catalog = self.store.load_catalog().await?;
        let rows = self.store.tenant_addons(tenant.id).await?;

        let plan_id = tenant
            .subscription_plan_id
            .unwrap_or(subscription.plan_id);
        let plan = catalog.active_plan(plan_id)?;
        let addons =
            AddonsSnapshot::from_live(&catalog, plan.id, &effective_addons(&tenant, &catalog, &rows))?;

        let client = match self.store.get_order(subscription.order_id).await {
            Ok(original) => original.client,
            Err(BillingError::NotFound(_)) => ClientDetails {
                organization_name: tenant.name.clone(),
                email: tenant.billing_email.clone(),
                ..Default::default()
            },
            Err(e) => return Err(e),
        };

        let sequence = self
            .store
            .next_sequence(SequenceKind::Order, now.year())
            .await?;
        let mut order = build_order(
            NewOrder {
                tenant_id: Some(tenant.id),
                quote_id: None,
                plan_id: plan.id,
                source: OrderSource::Renewal,
                plan_amount: None,
                addons,
                discount_amount: Decimal::ZERO,
                client,
            },
            &catalog,
            format_number(SequenceKind::Order, now.year(), sequence),
            now,
        )?;
        order.renews_subscription_id = Some(subscription.id);

        let created = ActivityEntryBuilder::new(
            EntityType::MandateOrder,
            order.id,
            ActivityAction::OrderCreated,
        )
        .tenant(Some(tenant.id))
        .statuses(None::<OrderStatus>, order.status)
        .actor(actor)
        .description(format!(
            "Renewal order {} created, final amount {}",
            order.order_number, order.final_amount
        ))
        .build(now);
        let linked = ActivityEntryBuilder::new(
            EntityType::MandateSubscription,
            subscription.id,
            ActivityAction::RenewalOrderGenerated,
        )
        .tenant(Some(tenant.id))
        .actor(actor)
        .description(format!(
            "Renewal order {} generated for subscription ending {}",
            order.order_number,
            subscription.end_date.date()
        ))
        .metadata(serde_json::json!({ "order_id": order.id }))
        .build(now);

        self.store
            .insert_renewal_order(subscription.id, &order, &[created, linked])
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            tenant_id = %tenant.id,
            order_id = %order.id,
            final_amount = %order.final_amount,
            "Generated renewal order"
        );

        Ok(order)
    }
}
