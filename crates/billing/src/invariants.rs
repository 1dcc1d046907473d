//! Billing Invariants Module
//!
//! Runnable consistency checks over the billing tables. They can be run after
//! a batch of transitions, a data migration or an incident to confirm the
//! store is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Tenant(s) affected
    pub tenant_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money may be owed or charged incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateReminderRow {
    tenant_id: Uuid,
    subscription_id: Uuid,
    reminder_type: String,
    reminder_level: i16,
    reminder_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateRenewalRow {
    tenant_id: Option<Uuid>,
    subscription_id: Uuid,
    order_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeLedgerRow {
    id: Uuid,
    tenant_id: Uuid,
    entry_type: String,
    amount: Decimal,
}

#[derive(Debug, sqlx::FromRow)]
struct OrderGapRow {
    id: Uuid,
    tenant_id: Option<Uuid>,
    order_number: String,
    status: String,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_unique_reminder_level().await?);
        violations.extend(self.check_single_renewal_order().await?);
        violations.extend(self.check_non_negative_ledger().await?);
        violations.extend(self.check_accepted_order_has_subscription().await?);
        violations.extend(self.check_invoiced_order_has_invoice().await?);
        violations.extend(self.check_order_status_audited().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// At most one reminder per (subscription, type, level)
    ///
    /// A duplicate means the client gets the same dunning or renewal email twice.
    async fn check_unique_reminder_level(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateReminderRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, subscription_id, reminder_type, reminder_level,
                   COUNT(*) AS reminder_count
            FROM mandate_reminders
            GROUP BY tenant_id, subscription_id, reminder_type, reminder_level
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "unique_reminder_level".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Subscription {} has {} {} reminders at level {}",
                    row.subscription_id, row.reminder_count, row.reminder_type, row.reminder_level
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "reminder_type": row.reminder_type,
                    "reminder_level": row.reminder_level,
                    "count": row.reminder_count,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// At most one renewal order per subscription
    ///
    /// Two renewal orders would invoice the same year twice.
    async fn check_single_renewal_order(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateRenewalRow> = sqlx::query_as(
            r#"
            SELECT MAX(tenant_id::TEXT)::UUID AS tenant_id,
                   renews_subscription_id AS subscription_id,
                   COUNT(*) AS order_count
            FROM mandate_orders
            WHERE renews_subscription_id IS NOT NULL AND is_deleted = FALSE
            GROUP BY renews_subscription_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_renewal_order".to_string(),
                tenant_ids: row.tenant_id.into_iter().collect(),
                description: format!(
                    "Subscription {} has {} renewal orders (expected at most 1)",
                    row.subscription_id, row.order_count
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "order_count": row.order_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Ledger amounts are never negative; the sign comes from the entry type
    async fn check_non_negative_ledger(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeLedgerRow> = sqlx::query_as(
            "SELECT id, tenant_id, entry_type, amount FROM ledger_entries WHERE amount < 0",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_negative_ledger".to_string(),
                tenant_ids: vec![row.tenant_id],
                description: format!(
                    "Ledger {} entry {} has negative amount {}",
                    row.entry_type, row.id, row.amount
                ),
                context: serde_json::json!({
                    "entry_id": row.id,
                    "amount": row.amount,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Every ACCEPTED or INVOICED order opened a mandate subscription
    async fn check_accepted_order_has_subscription(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrderGapRow> = sqlx::query_as(
            r#"
            SELECT o.id, o.tenant_id, o.order_number, o.status
            FROM mandate_orders o
            WHERE o.status IN ('ACCEPTED', 'INVOICED')
              AND o.is_deleted = FALSE
              AND NOT EXISTS (
                  SELECT 1 FROM mandate_subscriptions s WHERE s.order_id = o.id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "accepted_order_has_subscription".to_string(),
                tenant_ids: row.tenant_id.into_iter().collect(),
                description: format!(
                    "Order {} is {} but no mandate subscription was opened",
                    row.order_number, row.status
                ),
                context: serde_json::json!({ "order_id": row.id, "status": row.status }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Every INVOICED order has an invoice
    async fn check_invoiced_order_has_invoice(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrderGapRow> = sqlx::query_as(
            r#"
            SELECT o.id, o.tenant_id, o.order_number, o.status
            FROM mandate_orders o
            WHERE o.status = 'INVOICED'
              AND NOT EXISTS (
                  SELECT 1 FROM mandate_invoices i WHERE i.order_id = o.id AND i.is_deleted = FALSE
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invoiced_order_has_invoice".to_string(),
                tenant_ids: row.tenant_id.into_iter().collect(),
                description: format!("Order {} is INVOICED but has no invoice", row.order_number),
                context: serde_json::json!({ "order_id": row.id }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// The current status of every order was reached through a logged transition
    async fn check_order_status_audited(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrderGapRow> = sqlx::query_as(
            r#"
            SELECT o.id, o.tenant_id, o.order_number, o.status
            FROM mandate_orders o
            WHERE NOT EXISTS (
                SELECT 1 FROM activity_log a
                WHERE a.entity_type = 'MANDATE_ORDER'
                  AND a.entity_id = o.id
                  AND a.new_status = o.status
            )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "order_status_audited".to_string(),
                tenant_ids: row.tenant_id.into_iter().collect(),
                description: format!(
                    "Order {} reached {} without an activity log entry",
                    row.order_number, row.status
                ),
                context: serde_json::json!({ "order_id": row.id, "status": row.status }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a specific invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "unique_reminder_level" => self.check_unique_reminder_level().await,
            "single_renewal_order" => self.check_single_renewal_order().await,
            "non_negative_ledger" => self.check_non_negative_ledger().await,
            "accepted_order_has_subscription" => {
                self.check_accepted_order_has_subscription().await
            }
            "invoiced_order_has_invoice" => self.check_invoiced_order_has_invoice().await,
            "order_status_audited" => self.check_order_status_audited().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "unique_reminder_level",
            "single_renewal_order",
            "non_negative_ledger",
            "accepted_order_has_subscription",
            "invoiced_order_has_invoice",
            "order_status_audited",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"single_renewal_order"));
        assert!(checks.contains(&"order_status_audited"));
    }
}
