//! Billing change scheduler
//!
//! Records plan swaps and add-on quantity changes as [`BillingChange`] rows
//! carrying their proration, and applies them when due. A change is created
//! PENDING (or directly APPLIED for immediate add-on changes) and moves exactly
//! once to APPLIED or CANCELLED.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::card::CardBillingGateway;
use crate::catalog::BillingInterval;
use crate::clock::Clock;
use crate::entitlement::resolve_effective_quantity;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActivityAction, ActivityEntryBuilder, Actor, EntityType};
use crate::ledger::entries_for_change;
use crate::proration::{first_of_next_month, prorate, prorate_plan_change, resolve_period};
use crate::store::BillingStore;
use crate::tenant::{PaymentMethod, Tenant};

/// Maximum changes applied by one `apply_due_changes` run
const DUE_CHANGES_BATCH: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    PlanChange,
    AddonChange,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::PlanChange => "PLAN_CHANGE",
            ChangeType::AddonChange => "ADDON_CHANGE",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PLAN_CHANGE" => Some(ChangeType::PlanChange),
            "ADDON_CHANGE" => Some(ChangeType::AddonChange),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeStatus {
    Pending,
    Applied,
    Cancelled,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Pending => "PENDING",
            ChangeStatus::Applied => "APPLIED",
            ChangeStatus::Cancelled => "CANCELLED",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ChangeStatus::Pending),
            "APPLIED" => Some(ChangeStatus::Applied),
            "CANCELLED" => Some(ChangeStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingChange {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub change_type: ChangeType,
    pub from_plan_id: Option<Uuid>,
    pub to_plan_id: Option<Uuid>,
    pub addon_id: Option<Uuid>,
    pub from_quantity: Option<i32>,
    pub to_quantity: Option<i32>,
    pub from_billing_interval: BillingInterval,
    pub to_billing_interval: BillingInterval,
    pub effective_date: OffsetDateTime,
    pub prorata_credit: Decimal,
    pub prorata_debit: Decimal,
    pub status: ChangeStatus,
    pub payment_method: PaymentMethod,
    pub requested_by: Option<Uuid>,
    pub applied_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl BillingChange {
    /// Short human description used in ledger lines and activity entries
    pub fn summary(&self) -> String {
        match self.change_type {
            ChangeType::AddonChange => format!(
                "add-on quantity {} -> {}",
                self.from_quantity.unwrap_or(0),
                self.to_quantity.unwrap_or(0)
            ),
            ChangeType::PlanChange => format!(
                "plan change to {} ({})",
                self.to_plan_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                self.to_billing_interval
            ),
        }
    }
}

/// A change plus the message shown to the caller
#[derive(Debug, Clone, Serialize)]
pub struct ChangeResult {
    pub change: BillingChange,
    pub message: String,
    /// True when apply was a no-op on an already applied change
    pub already_applied: bool,
}

/// Outcome of the store-level apply
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Applied(BillingChange),
    AlreadyApplied(BillingChange),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DueChangesReport {
    pub due: usize,
    pub applied: usize,
    pub already_applied: usize,
    pub failed: usize,
}

pub fn effective_message(change: &BillingChange, now: OffsetDateTime) -> String {
    if change.effective_date <= now {
        "Effective immediately".to_string()
    } else {
        format!("Scheduled for {}", change.effective_date.date())
    }
}

pub struct BillingChangeScheduler {
    store: Arc<dyn BillingStore>,
    clock: Arc<dyn Clock>,
    card: Option<Arc<dyn CardBillingGateway>>,
}

impl BillingChangeScheduler {
    pub fn new(store: Arc<dyn BillingStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            card: None,
        }
    }

    /// Push applied changes to the card processor for card tenants
    pub fn with_card_gateway(mut self, card: Arc<dyn CardBillingGateway>) -> Self {
        self.card = Some(card);
        self
    }

    /// Change the quantity of one add-on.
    ///
    /// Immediate changes update the quantity, post ledger entries and mark the
    /// change APPLIED in one transaction; the read-compute-write is guarded by
    /// the add-on row version. Deferred changes take effect on the first of
    /// next month.
    pub async fn schedule_addon_change(
        &self,
        tenant_id: Uuid,
        addon_id: Uuid,
        new_quantity: i32,
        immediate: bool,
        actor: Actor,
    ) -> BillingResult<ChangeResult> {
        if new_quantity < 0 {
            return Err(BillingError::Validation(format!(
                "Quantity cannot be negative: {}",
                new_quantity
            )));
        }

        let now = self.clock.now();
        let tenant = self.store.get_tenant(tenant_id).await?;
        let catalog = self.store.load_catalog().await?;
        let addon = catalog.addon(addon_id)?;
        let plan_id = tenant.subscription_plan_id.ok_or_else(|| {
            BillingError::PreconditionFailed(format!("Tenant {} has no plan", tenant_id))
        })?;
        let unit_price = catalog.unit_price(plan_id, addon_id, tenant.billing_interval)?;

        // The delta is computed from the live quantity, so it must not stack on
        // a change that has not landed yet.
        let pending = self
            .store
            .list_billing_changes(tenant_id, Some(ChangeStatus::Pending))
            .await?;
        if let Some(existing) = pending.iter().find(|c| {
            c.change_type == ChangeType::AddonChange && c.addon_id == Some(addon_id)
        }) {
            return Err(BillingError::DuplicateOperation(format!(
                "{} already has a pending change {} effective {}; cancel it first",
                addon.code,
                existing.id,
                existing.effective_date.date()
            )));
        }

        let rows = self.store.tenant_addons(tenant_id).await?;
        let current = resolve_effective_quantity(&tenant, addon, &rows);
        let delta = new_quantity - current.quantity;
        if delta == 0 {
            return Err(BillingError::Validation(format!(
                "{} is already at quantity {}",
                addon.code, new_quantity
            )));
        }

        let subscription = self.store.active_mandate_subscription(tenant_id).await?;
        let period = resolve_period(&tenant, subscription.as_ref(), now)?;
        let proration = prorate(unit_price, &period, now, delta)?;

        let effective_date = if immediate {
            now
        } else {
            first_of_next_month(now)?
        };

        let mut change = BillingChange {
            id: Uuid::new_v4(),
            tenant_id,
            change_type: ChangeType::AddonChange,
            from_plan_id: Some(plan_id),
            to_plan_id: Some(plan_id),
            addon_id: Some(addon_id),
            from_quantity: Some(current.quantity),
            to_quantity: Some(new_quantity),
            from_billing_interval: tenant.billing_interval,
            to_billing_interval: tenant.billing_interval,
            effective_date,
            prorata_credit: proration.credit,
            prorata_debit: proration.debit,
            status: ChangeStatus::Pending,
            payment_method: tenant.payment_method(),
            requested_by: actor.id,
            applied_at: None,
            cancelled_at: None,
            created_at: now,
        };

        if immediate {
            change.status = ChangeStatus::Applied;
            change.applied_at = Some(now);
            let entries = entries_for_change(&change, now)?;
            let activity = ActivityEntryBuilder::new(
                EntityType::BillingChange,
                change.id,
                ActivityAction::BillingChangeApplied,
            )
            .tenant(Some(tenant_id))
            .statuses(None::<ChangeStatus>, ChangeStatus::Applied)
            .actor(actor)
            .description(format!("Immediate {}", change.summary()))
            .metadata(serde_json::json!({
                "addon_code": addon.code,
                "days_remaining": proration.days_remaining,
                "days_in_period": proration.days_in_period,
                "period_basis": period.basis,
            }))
            .build(now);

            self.store
                .commit_addon_change(&change, current.version, &entries, &activity)
                .await?;

            tracing::info!(
                tenant_id = %tenant_id,
                change_id = %change.id,
                addon = %addon.code,
                from = current.quantity,
                to = new_quantity,
                credit = %change.prorata_credit,
                debit = %change.prorata_debit,
                "Applied add-on change"
            );

            self.sync_card(&tenant, &change).await;
        } else {
            let activity = ActivityEntryBuilder::new(
                EntityType::BillingChange,
                change.id,
                ActivityAction::BillingChangeScheduled,
            )
            .tenant(Some(tenant_id))
            .statuses(None::<ChangeStatus>, ChangeStatus::Pending)
            .actor(actor)
            .description(format!("Scheduled {}", change.summary()))
            .build(now);

            self.store.insert_billing_change(&change, &activity).await?;

            tracing::info!(
                tenant_id = %tenant_id,
                change_id = %change.id,
                addon = %addon.code,
                effective_date = %change.effective_date,
                "Scheduled add-on change"
            );
        }

        Ok(ChangeResult {
            message: effective_message(&change, now),
            change,
            already_applied: false,
        })
    }

    /// Schedule a plan swap for the first day of next month.
    ///
    /// Both prices are taken at the tenant's current interval so the proration
    /// compares like with like over the current period.
    pub async fn schedule_plan_change(
        &self,
        tenant_id: Uuid,
        new_plan_id: Uuid,
        new_interval: BillingInterval,
        actor: Actor,
    ) -> BillingResult<ChangeResult> {
        let now = self.clock.now();
        let tenant = self.store.get_tenant(tenant_id).await?;
        let catalog = self.store.load_catalog().await?;
        let new_plan = catalog.active_plan(new_plan_id)?;

        if tenant.subscription_plan_id == Some(new_plan_id)
            && tenant.billing_interval == new_interval
        {
            return Err(BillingError::Validation(format!(
                "Tenant is already on plan '{}' billed {}",
                new_plan.code, new_interval
            )));
        }

        let old_price = match tenant.subscription_plan_id {
            Some(plan_id) => catalog.plan_price(plan_id, tenant.billing_interval)?,
            None => Decimal::ZERO,
        };
        let new_price = new_plan.price(tenant.billing_interval);

        let subscription = self.store.active_mandate_subscription(tenant_id).await?;
        let period = resolve_period(&tenant, subscription.as_ref(), now)?;
        let proration = prorate_plan_change(old_price, new_price, &period, now)?;

        let change = BillingChange {
            id: Uuid::new_v4(),
            tenant_id,
            change_type: ChangeType::PlanChange,
            from_plan_id: tenant.subscription_plan_id,
            to_plan_id: Some(new_plan_id),
            addon_id: None,
            from_quantity: None,
            to_quantity: None,
            from_billing_interval: tenant.billing_interval,
            to_billing_interval: new_interval,
            effective_date: first_of_next_month(now)?,
            prorata_credit: proration.credit,
            prorata_debit: proration.debit,
            status: ChangeStatus::Pending,
            payment_method: tenant.payment_method(),
            requested_by: actor.id,
            applied_at: None,
            cancelled_at: None,
            created_at: now,
        };

        let activity = ActivityEntryBuilder::new(
            EntityType::BillingChange,
            change.id,
            ActivityAction::BillingChangeScheduled,
        )
        .tenant(Some(tenant_id))
        .statuses(None::<ChangeStatus>, ChangeStatus::Pending)
        .actor(actor)
        .description(format!("Scheduled {} ({})", change.summary(), new_plan.code))
        .metadata(serde_json::json!({
            "old_price": old_price,
            "new_price": new_price,
            "period_basis": period.basis,
        }))
        .build(now);

        self.store.insert_billing_change(&change, &activity).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            change_id = %change.id,
            new_plan = %new_plan.code,
            effective_date = %change.effective_date,
            "Scheduled plan change"
        );

        Ok(ChangeResult {
            message: effective_message(&change, now),
            change,
            already_applied: false,
        })
    }

    /// Cancel a PENDING change; anything else is `InvalidState`
    pub async fn cancel_pending_change(
        &self,
        change_id: Uuid,
        actor: Actor,
    ) -> BillingResult<ChangeResult> {
        let now = self.clock.now();
        let change = self.store.get_billing_change(change_id).await?;
        if change.status != ChangeStatus::Pending {
            return Err(BillingError::invalid_state(change.status, "cancel"));
        }

        let activity = ActivityEntryBuilder::new(
            EntityType::BillingChange,
            change_id,
            ActivityAction::BillingChangeCancelled,
        )
        .tenant(Some(change.tenant_id))
        .statuses(Some(ChangeStatus::Pending), ChangeStatus::Cancelled)
        .actor(actor)
        .description(format!("Cancelled {}", change.summary()))
        .build(now);

        let cancelled = self
            .store
            .cancel_billing_change(change_id, now, &activity)
            .await?;

        tracing::info!(
            tenant_id = %cancelled.tenant_id,
            change_id = %change_id,
            "Cancelled pending billing change"
        );

        Ok(ChangeResult {
            change: cancelled,
            message: "Change cancelled".to_string(),
            already_applied: false,
        })
    }

    /// Apply a change. Applying an already APPLIED change is a no-op.
    pub async fn apply_billing_change(
        &self,
        change_id: Uuid,
        actor: Actor,
    ) -> BillingResult<ChangeResult> {
        let now = self.clock.now();
        let change = self.store.get_billing_change(change_id).await?;

        match change.status {
            ChangeStatus::Applied => {
                return Ok(ChangeResult {
                    message: already_applied_message(&change),
                    change,
                    already_applied: true,
                })
            }
            ChangeStatus::Cancelled => {
                return Err(BillingError::invalid_state(change.status, "apply"));
            }
            ChangeStatus::Pending => {}
        }

        let entries = entries_for_change(&change, now)?;
        let activity = ActivityEntryBuilder::new(
            EntityType::BillingChange,
            change_id,
            ActivityAction::BillingChangeApplied,
        )
        .tenant(Some(change.tenant_id))
        .statuses(Some(ChangeStatus::Pending), ChangeStatus::Applied)
        .actor(actor)
        .description(format!("Applied {}", change.summary()))
        .build(now);

        match self
            .store
            .apply_billing_change(change_id, &entries, now, &activity)
            .await?
        {
            ApplyOutcome::Applied(applied) => {
                tracing::info!(
                    tenant_id = %applied.tenant_id,
                    change_id = %change_id,
                    change_type = %applied.change_type,
                    ledger_entries = entries.len(),
                    "Applied billing change"
                );

                match self.store.get_tenant(applied.tenant_id).await {
                    Ok(tenant) => self.sync_card(&tenant, &applied).await,
                    Err(e) => tracing::warn!(
                        tenant_id = %applied.tenant_id,
                        error = %e,
                        "Could not reload tenant for card sync"
                    ),
                }

                Ok(ChangeResult {
                    message: "Effective immediately".to_string(),
                    change: applied,
                    already_applied: false,
                })
            }
            ApplyOutcome::AlreadyApplied(applied) => Ok(ChangeResult {
                message: already_applied_message(&applied),
                change: applied,
                already_applied: true,
            }),
        }
    }

    /// Apply every PENDING change whose effective date has passed.
    /// A failing change is logged and left PENDING for the next run.
    pub async fn apply_due_changes(&self) -> BillingResult<DueChangesReport> {
        let now = self.clock.now();
        let due = self
            .store
            .due_billing_changes(now, DUE_CHANGES_BATCH)
            .await?;

        let mut report = DueChangesReport {
            due: due.len(),
            ..Default::default()
        };

        for change in due {
            match self.apply_billing_change(change.id, Actor::system()).await {
                Ok(result) if result.already_applied => report.already_applied += 1,
                Ok(_) => report.applied += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        tenant_id = %change.tenant_id,
                        change_id = %change.id,
                        error = %e,
                        "Failed to apply due billing change"
                    );
                }
            }
        }

        Ok(report)
    }

    pub async fn list_changes(&self, tenant_id: Uuid) -> BillingResult<Vec<BillingChange>> {
        self.store.list_billing_changes(tenant_id, None).await
    }

    pub async fn pending_changes(&self, tenant_id: Uuid) -> BillingResult<Vec<BillingChange>> {
        self.store
            .list_billing_changes(tenant_id, Some(ChangeStatus::Pending))
            .await
    }

    pub async fn get_change(&self, change_id: Uuid) -> BillingResult<BillingChange> {
        self.store.get_billing_change(change_id).await
    }

    /// Mirror an applied change on the card rail; failures never undo the commit
    async fn sync_card(&self, tenant: &Tenant, change: &BillingChange) {
        let Some(card) = &self.card else {
            return;
        };
        if !tenant.has_card_subscription() {
            return;
        }

        let catalog = match self.store.load_catalog().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(tenant_id = %tenant.id, error = %e, "Card sync skipped: catalog unavailable");
                return;
            }
        };

        if let Err(e) = card.sync_change(tenant, change, &catalog).await {
            tracing::warn!(
                tenant_id = %tenant.id,
                change_id = %change.id,
                error = %e,
                "Card processor sync failed; core change stays applied"
            );
        }
    }
}

fn already_applied_message(change: &BillingChange) -> String {
    match change.applied_at {
        Some(at) => format!("Already applied on {}", at.date()),
        None => "Already applied".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn change(effective_date: OffsetDateTime) -> BillingChange {
        BillingChange {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            change_type: ChangeType::AddonChange,
            from_plan_id: None,
            to_plan_id: None,
            addon_id: Some(Uuid::new_v4()),
            from_quantity: Some(0),
            to_quantity: Some(2),
            from_billing_interval: BillingInterval::Yearly,
            to_billing_interval: BillingInterval::Yearly,
            effective_date,
            prorata_credit: Decimal::ZERO,
            prorata_debit: Decimal::from(100),
            status: ChangeStatus::Pending,
            payment_method: PaymentMethod::Mandate,
            requested_by: None,
            applied_at: None,
            cancelled_at: None,
            created_at: effective_date,
        }
    }

    #[test]
    fn test_effective_message() {
        let now = datetime!(2026-10-17 09:00 UTC);
        assert_eq!(effective_message(&change(now), now), "Effective immediately");
        assert_eq!(
            effective_message(&change(datetime!(2026-11-01 00:00 UTC)), now),
            "Scheduled for 2026-11-01"
        );
    }

    #[test]
    fn test_summary_names_quantities() {
        let c = change(datetime!(2026-10-17 09:00 UTC));
        assert_eq!(c.summary(), "add-on quantity 0 -> 2");
    }

    #[test]
    fn test_status_round_trip() {
        for status in [ChangeStatus::Pending, ChangeStatus::Applied, ChangeStatus::Cancelled] {
            assert_eq!(ChangeStatus::from_str(status.as_str()), Some(status));
        }
    }
}
