//! Dunning and renewal reminders
//!
//! Reminders are rows with a `scheduled_for` date and a nullable `sent_at`.
//! A pull-based sweep picks the due ones, sends them and stamps `sent_at`
//! with a conditional update, so sending is at-least-once and the sweep may
//! run concurrently with itself.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::clock::Clock;
use crate::email::{ReminderNotice, ReminderNotifier};
use crate::error::BillingResult;
use crate::mandate::invoice::MandateInvoice;
use crate::mandate::subscription::MandateSubscription;
use crate::store::BillingStore;

/// Dunning reminders fire this many days after the invoice due date
pub const DUNNING_OFFSETS_DAYS: [i64; 3] = [35, 50, 65];

/// Renewal reminders fire this many days before the subscription ends
pub const RENEWAL_THRESHOLDS_DAYS: [i64; 3] = [60, 30, 15];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReminderType {
    Dunning,
    Renewal,
}

impl ReminderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderType::Dunning => "DUNNING",
            ReminderType::Renewal => "RENEWAL",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "DUNNING" => Some(ReminderType::Dunning),
            "RENEWAL" => Some(ReminderType::Renewal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReminderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MandateReminder {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
    /// Set for dunning reminders
    pub invoice_id: Option<Uuid>,
    pub reminder_type: ReminderType,
    /// 1..=3
    pub reminder_level: i16,
    pub scheduled_for: OffsetDateTime,
    /// None while pending
    pub sent_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl MandateReminder {
    /// Uniqueness key: one reminder per (subscription, type, level)
    pub fn key(&self) -> (Uuid, ReminderType, i16) {
        (self.subscription_id, self.reminder_type, self.reminder_level)
    }

    pub fn is_pending(&self) -> bool {
        self.sent_at.is_none()
    }
}

/// The three dunning reminders of an invoice, at due date +35/+50/+65 days
pub fn dunning_schedule(invoice: &MandateInvoice, now: OffsetDateTime) -> Vec<MandateReminder> {
    DUNNING_OFFSETS_DAYS
        .iter()
        .zip(1i16..)
        .map(|(offset, level)| MandateReminder {
            id: Uuid::new_v4(),
            tenant_id: invoice.tenant_id,
            subscription_id: invoice.subscription_id,
            invoice_id: Some(invoice.id),
            reminder_type: ReminderType::Dunning,
            reminder_level: level,
            scheduled_for: invoice.due_date + Duration::days(*offset),
            sent_at: None,
            created_at: now,
        })
        .collect()
}

/// Renewal reminder level for a threshold (60 -> 1, 30 -> 2, 15 -> 3)
pub fn renewal_level(threshold_days: i64) -> Option<i16> {
    RENEWAL_THRESHOLDS_DAYS
        .iter()
        .position(|t| *t == threshold_days)
        .and_then(|i| i16::try_from(i + 1).ok())
}

/// Renewal reminder scheduled `threshold_days` before the subscription ends
pub fn renewal_reminder(
    subscription: &MandateSubscription,
    threshold_days: i64,
    level: i16,
    now: OffsetDateTime,
) -> MandateReminder {
    MandateReminder {
        id: Uuid::new_v4(),
        tenant_id: subscription.tenant_id,
        subscription_id: subscription.id,
        invoice_id: None,
        reminder_type: ReminderType::Renewal,
        reminder_level: level,
        scheduled_for: subscription.end_date - Duration::days(threshold_days),
        sent_at: None,
        created_at: now,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Pending reminders picked up by this run
    pub due: usize,
    pub sent: usize,
    /// Delivery failed; left pending for the next run
    pub failed: usize,
    /// Another sweep stamped it first
    pub skipped: usize,
}

/// Sends due reminders
pub struct ReminderSweeper {
    store: Arc<dyn BillingStore>,
    notifier: Arc<dyn ReminderNotifier>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
}

impl ReminderSweeper {
    pub fn new(
        store: Arc<dyn BillingStore>,
        notifier: Arc<dyn ReminderNotifier>,
        clock: Arc<dyn Clock>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
            batch_size,
        }
    }

    pub async fn run(&self) -> BillingResult<SweepReport> {
        let now = self.clock.now();
        let due = self.store.due_reminders(now, self.batch_size).await?;
        let mut report = SweepReport {
            due: due.len(),
            ..Default::default()
        };

        for reminder in due {
            let notice = match self.notice(&reminder).await {
                Ok(n) => n,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        reminder_id = %reminder.id,
                        tenant_id = %reminder.tenant_id,
                        error = %e,
                        "Could not prepare reminder"
                    );
                    continue;
                }
            };

            if let Err(e) = self.notifier.send_reminder(&notice).await {
                report.failed += 1;
                tracing::warn!(
                    reminder_id = %reminder.id,
                    tenant_id = %reminder.tenant_id,
                    reminder_type = %reminder.reminder_type,
                    level = reminder.reminder_level,
                    error = %e,
                    "Reminder delivery failed, will retry on next sweep"
                );
                continue;
            }

            match self.store.mark_reminder_sent(reminder.id, self.clock.now()).await {
                Ok(true) => {
                    report.sent += 1;
                    tracing::info!(
                        reminder_id = %reminder.id,
                        tenant_id = %reminder.tenant_id,
                        reminder_type = %reminder.reminder_type,
                        level = reminder.reminder_level,
                        "Reminder sent"
                    );
                }
                Ok(false) => {
                    report.skipped += 1;
                    tracing::debug!(reminder_id = %reminder.id, "Reminder already stamped by another sweep");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(
                        reminder_id = %reminder.id,
                        error = %e,
                        "Reminder sent but could not be stamped"
                    );
                }
            }
        }

        if report.due > 0 {
            tracing::info!(
                due = report.due,
                sent = report.sent,
                failed = report.failed,
                skipped = report.skipped,
                "Reminder sweep finished"
            );
        }

        Ok(report)
    }

    async fn notice(&self, reminder: &MandateReminder) -> BillingResult<ReminderNotice> {
        let tenant = self.store.get_tenant(reminder.tenant_id).await?;
        let subscription = self
            .store
            .get_mandate_subscription(reminder.subscription_id)
            .await?;
        let invoice = match reminder.invoice_id {
            Some(id) => Some(self.store.get_invoice(id).await?),
            None => None,
        };

        Ok(ReminderNotice {
            reminder_id: reminder.id,
            reminder_type: reminder.reminder_type,
            level: reminder.reminder_level,
            tenant_name: tenant.name,
            recipient: tenant.billing_email,
            invoice_number: invoice.as_ref().map(|i| i.invoice_number.clone()),
            amount_due: invoice.as_ref().map(|i| i.total_with_tax),
            due_date: invoice.as_ref().map(|i| i.due_date),
            subscription_end: subscription.end_date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use time::macros::datetime;

    use crate::mandate::invoice::InvoiceStatus;

    fn invoice(due_date: OffsetDateTime) -> MandateInvoice {
        MandateInvoice {
            id: Uuid::new_v4(),
            invoice_number: "FAC-2026-00001".to_string(),
            order_id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            status: InvoiceStatus::Draft,
            plan_amount: Decimal::from(1200),
            addons_amount: Decimal::ZERO,
            discount_amount: Decimal::ZERO,
            final_amount: Decimal::from(1200),
            tax_rate: Decimal::new(20, 2),
            tax_amount: Decimal::from(240),
            total_with_tax: Decimal::from(1440),
            period_start: due_date,
            period_end: due_date,
            due_date,
            paid_at: None,
            is_deleted: false,
            created_at: due_date,
            updated_at: due_date,
        }
    }

    #[test]
    fn test_dunning_schedule_offsets_and_levels() {
        let due = datetime!(2026-06-01 00:00 UTC);
        let reminders = dunning_schedule(&invoice(due), due);

        let schedule: Vec<(i16, OffsetDateTime)> = reminders
            .iter()
            .map(|r| (r.reminder_level, r.scheduled_for))
            .collect();
        assert_eq!(
            schedule,
            vec![
                (1, datetime!(2026-07-06 00:00 UTC)),
                (2, datetime!(2026-07-21 00:00 UTC)),
                (3, datetime!(2026-08-05 00:00 UTC)),
            ]
        );
        assert!(reminders.iter().all(|r| r.is_pending()));
        assert!(reminders
            .iter()
            .all(|r| r.reminder_type == ReminderType::Dunning));
    }

    #[test]
    fn test_renewal_levels() {
        assert_eq!(renewal_level(60), Some(1));
        assert_eq!(renewal_level(30), Some(2));
        assert_eq!(renewal_level(15), Some(3));
        assert_eq!(renewal_level(10), None);
    }

    #[test]
    fn test_renewal_reminder_date() {
        let sub = MandateSubscription::open(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            datetime!(2026-01-01 00:00 UTC),
        )
        .unwrap();
        let reminder = renewal_reminder(&sub, 30, 2, datetime!(2026-12-01 00:00 UTC));
        assert_eq!(reminder.scheduled_for, datetime!(2026-12-02 00:00 UTC));
        assert_eq!(reminder.key(), (sub.id, ReminderType::Renewal, 2));
    }
}
