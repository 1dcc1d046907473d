//! PostgreSQL store
//!
//! Each trait method runs in its own transaction. Conditional updates compare
//! the stored status (or row version) in the WHERE clause and treat zero
//! affected rows as a lost race.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::BillingStore;
use crate::catalog::{Addon, AddonCode, BillingInterval, Plan, PlanAddonAccess, PricingCatalog};
use crate::changes::{ApplyOutcome, BillingChange, ChangeStatus, ChangeType};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActivityLogEntry, ActorType, EntityType};
use crate::ledger::{EntryType, LedgerEntry};
use crate::mandate::invoice::{InvoiceStatus, MandateInvoice};
use crate::mandate::order::{ClientDetails, MandateOrder, OrderSource, OrderStatus};
use crate::mandate::reminder::{MandateReminder, ReminderType};
use crate::mandate::snapshot::AddonsSnapshot;
use crate::mandate::subscription::{MandateSubscription, SubscriptionStatus};
use crate::numbering::SequenceKind;
use crate::quote::{Quote, QuoteLine, QuoteStatus};
use crate::tenant::{BillingStatus, PaymentMethod, Tenant, TenantAddon};

/// Decode a TEXT enum column
fn decode<T>(value: &str, column: &str, parse: fn(&str) -> Option<T>) -> BillingResult<T> {
    parse(value).ok_or_else(|| {
        BillingError::Integrity(format!("Unknown {} '{}' in database", column, value))
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    code: String,
    name: String,
    monthly_price: Decimal,
    yearly_price: Decimal,
    included_admins: i32,
    included_associations: i32,
    included_communes: i32,
    is_active: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct AddonRow {
    id: Uuid,
    code: String,
    name: String,
    monthly_unit_price: Decimal,
    yearly_unit_price: Decimal,
    stripe_monthly_price_id: Option<String>,
    stripe_yearly_price_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct PlanAddonRow {
    plan_id: Uuid,
    addon_id: Uuid,
    enabled: bool,
    monthly_price_override: Option<Decimal>,
    yearly_price_override: Option<Decimal>,
}

#[derive(Debug, sqlx::FromRow)]
struct TenantRow {
    id: Uuid,
    name: String,
    billing_email: Option<String>,
    subscription_plan_id: Option<Uuid>,
    billing_interval: String,
    billing_status: String,
    trial_ends_at: Option<OffsetDateTime>,
    purchased_admins: i32,
    purchased_associations: i32,
    purchased_communes: i32,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = BillingError;

    fn try_from(row: TenantRow) -> BillingResult<Self> {
        Ok(Tenant {
            id: row.id,
            name: row.name,
            billing_email: row.billing_email,
            subscription_plan_id: row.subscription_plan_id,
            billing_interval: decode(
                &row.billing_interval,
                "billing_interval",
                BillingInterval::from_str,
            )?,
            billing_status: decode(&row.billing_status, "billing_status", BillingStatus::from_str)?,
            trial_ends_at: row.trial_ends_at,
            purchased_admins: row.purchased_admins,
            purchased_associations: row.purchased_associations,
            purchased_communes: row.purchased_communes,
            stripe_customer_id: row.stripe_customer_id,
            stripe_subscription_id: row.stripe_subscription_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TenantAddonRow {
    tenant_id: Uuid,
    addon_id: Uuid,
    quantity: i32,
    version: i64,
    updated_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct BillingChangeRow {
    id: Uuid,
    tenant_id: Uuid,
    change_type: String,
    from_plan_id: Option<Uuid>,
    to_plan_id: Option<Uuid>,
    addon_id: Option<Uuid>,
    from_quantity: Option<i32>,
    to_quantity: Option<i32>,
    from_billing_interval: String,
    to_billing_interval: String,
    effective_date: OffsetDateTime,
    prorata_credit: Decimal,
    prorata_debit: Decimal,
    status: String,
    payment_method: String,
    requested_by: Option<Uuid>,
    applied_at: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<BillingChangeRow> for BillingChange {
    type Error = BillingError;

    fn try_from(row: BillingChangeRow) -> BillingResult<Self> {
        Ok(BillingChange {
            id: row.id,
            tenant_id: row.tenant_id,
            change_type: decode(&row.change_type, "change_type", ChangeType::from_str)?,
            from_plan_id: row.from_plan_id,
            to_plan_id: row.to_plan_id,
            addon_id: row.addon_id,
            from_quantity: row.from_quantity,
            to_quantity: row.to_quantity,
            from_billing_interval: decode(
                &row.from_billing_interval,
                "from_billing_interval",
                BillingInterval::from_str,
            )?,
            to_billing_interval: decode(
                &row.to_billing_interval,
                "to_billing_interval",
                BillingInterval::from_str,
            )?,
            effective_date: row.effective_date,
            prorata_credit: row.prorata_credit,
            prorata_debit: row.prorata_debit,
            status: decode(&row.status, "change status", ChangeStatus::from_str)?,
            payment_method: decode(&row.payment_method, "payment_method", PaymentMethod::from_str)?,
            requested_by: row.requested_by,
            applied_at: row.applied_at,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    tenant_id: Uuid,
    billing_change_id: Option<Uuid>,
    entry_type: String,
    amount: Decimal,
    description: String,
    created_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    order_number: String,
    commande_number: Option<String>,
    quote_id: Option<Uuid>,
    tenant_id: Option<Uuid>,
    plan_id: Uuid,
    source: String,
    status: String,
    billing_cycle: String,
    plan_amount: Decimal,
    addons_amount: Decimal,
    addons_snapshot: serde_json::Value,
    annual_amount: Decimal,
    discount_amount: Decimal,
    final_amount: Decimal,
    client: Json<ClientDetails>,
    purchase_order_number: Option<String>,
    documents: Vec<String>,
    rejection_reason: Option<String>,
    renews_subscription_id: Option<Uuid>,
    is_deleted: bool,
    deleted_by: Option<Uuid>,
    deleted_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<OrderRow> for MandateOrder {
    type Error = BillingError;

    fn try_from(row: OrderRow) -> BillingResult<Self> {
        Ok(MandateOrder {
            id: row.id,
            order_number: row.order_number,
            commande_number: row.commande_number,
            quote_id: row.quote_id,
            tenant_id: row.tenant_id,
            plan_id: row.plan_id,
            source: decode(&row.source, "order source", OrderSource::from_str)?,
            status: decode(&row.status, "order status", OrderStatus::from_str)?,
            billing_cycle: decode(&row.billing_cycle, "billing_cycle", BillingInterval::from_str)?,
            plan_amount: row.plan_amount,
            addons_amount: row.addons_amount,
            addons_snapshot: AddonsSnapshot::from_json(row.addons_snapshot)?,
            annual_amount: row.annual_amount,
            discount_amount: row.discount_amount,
            final_amount: row.final_amount,
            client: row.client.0,
            purchase_order_number: row.purchase_order_number,
            documents: row.documents,
            rejection_reason: row.rejection_reason,
            renews_subscription_id: row.renews_subscription_id,
            is_deleted: row.is_deleted,
            deleted_by: row.deleted_by,
            deleted_at: row.deleted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: Uuid,
    order_id: Uuid,
    plan_id: Uuid,
    status: String,
    start_date: OffsetDateTime,
    end_date: OffsetDateTime,
    renewal_order_id: Option<Uuid>,
    created_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for MandateSubscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(MandateSubscription {
            id: row.id,
            tenant_id: row.tenant_id,
            order_id: row.order_id,
            plan_id: row.plan_id,
            status: decode(&row.status, "subscription status", SubscriptionStatus::from_str)?,
            start_date: row.start_date,
            end_date: row.end_date,
            renewal_order_id: row.renewal_order_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    invoice_number: String,
    order_id: Uuid,
    subscription_id: Uuid,
    tenant_id: Uuid,
    status: String,
    plan_amount: Decimal,
    addons_amount: Decimal,
    discount_amount: Decimal,
    final_amount: Decimal,
    tax_rate: Decimal,
    tax_amount: Decimal,
    total_with_tax: Decimal,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    due_date: OffsetDateTime,
    paid_at: Option<OffsetDateTime>,
    is_deleted: bool,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<InvoiceRow> for MandateInvoice {
    type Error = BillingError;

    fn try_from(row: InvoiceRow) -> BillingResult<Self> {
        Ok(MandateInvoice {
            id: row.id,
            invoice_number: row.invoice_number,
            order_id: row.order_id,
            subscription_id: row.subscription_id,
            tenant_id: row.tenant_id,
            status: decode(&row.status, "invoice status", InvoiceStatus::from_str)?,
            plan_amount: row.plan_amount,
            addons_amount: row.addons_amount,
            discount_amount: row.discount_amount,
            final_amount: row.final_amount,
            tax_rate: row.tax_rate,
            tax_amount: row.tax_amount,
            total_with_tax: row.total_with_tax,
            period_start: row.period_start,
            period_end: row.period_end,
            due_date: row.due_date,
            paid_at: row.paid_at,
            is_deleted: row.is_deleted,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReminderRow {
    id: Uuid,
    tenant_id: Uuid,
    subscription_id: Uuid,
    invoice_id: Option<Uuid>,
    reminder_type: String,
    reminder_level: i16,
    scheduled_for: OffsetDateTime,
    sent_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<ReminderRow> for MandateReminder {
    type Error = BillingError;

    fn try_from(row: ReminderRow) -> BillingResult<Self> {
        Ok(MandateReminder {
            id: row.id,
            tenant_id: row.tenant_id,
            subscription_id: row.subscription_id,
            invoice_id: row.invoice_id,
            reminder_type: decode(&row.reminder_type, "reminder_type", ReminderType::from_str)?,
            reminder_level: row.reminder_level,
            scheduled_for: row.scheduled_for,
            sent_at: row.sent_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct QuoteRow {
    id: Uuid,
    quote_number: String,
    tenant_id: Option<Uuid>,
    plan_id: Uuid,
    billing_interval: String,
    lines: Json<Vec<QuoteLine>>,
    subtotal: Decimal,
    discount_amount: Decimal,
    total: Decimal,
    status: String,
    payment_method: Option<String>,
    public_token: String,
    client: Json<ClientDetails>,
    valid_until: OffsetDateTime,
    mandate_order_id: Option<Uuid>,
    rejection_reason: Option<String>,
    sent_at: Option<OffsetDateTime>,
    accepted_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<QuoteRow> for Quote {
    type Error = BillingError;

    fn try_from(row: QuoteRow) -> BillingResult<Self> {
        let payment_method = match row.payment_method.as_deref() {
            Some(m) => Some(decode(m, "payment_method", PaymentMethod::from_str)?),
            None => None,
        };
        Ok(Quote {
            id: row.id,
            quote_number: row.quote_number,
            tenant_id: row.tenant_id,
            plan_id: row.plan_id,
            billing_interval: decode(
                &row.billing_interval,
                "billing_interval",
                BillingInterval::from_str,
            )?,
            lines: row.lines.0,
            subtotal: row.subtotal,
            discount_amount: row.discount_amount,
            total: row.total,
            status: decode(&row.status, "quote status", QuoteStatus::from_str)?,
            payment_method,
            public_token: row.public_token,
            client: row.client.0,
            valid_until: row.valid_until,
            mandate_order_id: row.mandate_order_id,
            rejection_reason: row.rejection_reason,
            sent_at: row.sent_at,
            accepted_at: row.accepted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ActivityRow {
    id: Uuid,
    tenant_id: Option<Uuid>,
    entity_type: String,
    entity_id: Uuid,
    action: String,
    old_status: Option<String>,
    new_status: Option<String>,
    actor_id: Option<Uuid>,
    actor_type: String,
    description: String,
    metadata: serde_json::Value,
    created_at: OffsetDateTime,
}

const ORDER_COLUMNS: &str = "id, order_number, commande_number, quote_id, tenant_id, plan_id, \
    source, status, billing_cycle, plan_amount, addons_amount, addons_snapshot, annual_amount, \
    discount_amount, final_amount, client, purchase_order_number, documents, rejection_reason, \
    renews_subscription_id, is_deleted, deleted_by, deleted_at, created_at, updated_at";

const CHANGE_COLUMNS: &str = "id, tenant_id, change_type, from_plan_id, to_plan_id, addon_id, \
    from_quantity, to_quantity, from_billing_interval, to_billing_interval, effective_date, \
    prorata_credit, prorata_debit, status, payment_method, requested_by, applied_at, \
    cancelled_at, created_at";

const INVOICE_COLUMNS: &str = "id, invoice_number, order_id, subscription_id, tenant_id, status, \
    plan_amount, addons_amount, discount_amount, final_amount, tax_rate, tax_amount, \
    total_with_tax, period_start, period_end, due_date, paid_at, is_deleted, created_at, updated_at";

const REMINDER_COLUMNS: &str = "id, tenant_id, subscription_id, invoice_id, reminder_type, \
    reminder_level, scheduled_for, sent_at, created_at";

const SUBSCRIPTION_COLUMNS: &str =
    "id, tenant_id, order_id, plan_id, status, start_date, end_date, renewal_order_id, created_at";

const QUOTE_COLUMNS: &str = "id, quote_number, tenant_id, plan_id, billing_interval, lines, \
    subtotal, discount_amount, total, status, payment_method, public_token, client, valid_until, \
    mandate_order_id, rejection_reason, sent_at, accepted_at, created_at, updated_at";

// =============================================================================
// Statement helpers shared by several units of work
// =============================================================================

async fn insert_activity(
    conn: &mut PgConnection,
    entries: &[ActivityLogEntry],
) -> BillingResult<()> {
    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO activity_log (
                id, tenant_id, entity_type, entity_id, action, old_status, new_status,
                actor_id, actor_type, description, metadata, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.id)
        .bind(entry.tenant_id)
        .bind(entry.entity_type.as_str())
        .bind(entry.entity_id)
        .bind(&entry.action)
        .bind(&entry.old_status)
        .bind(&entry.new_status)
        .bind(entry.actor_id)
        .bind(entry.actor_type.to_string())
        .bind(&entry.description)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_ledger_entries(
    conn: &mut PgConnection,
    entries: &[LedgerEntry],
) -> BillingResult<()> {
    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id, tenant_id, billing_change_id, entry_type, amount, description, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.tenant_id)
        .bind(entry.billing_change_id)
        .bind(entry.entry_type.as_str())
        .bind(entry.amount)
        .bind(&entry.description)
        .bind(entry.created_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_change_row(conn: &mut PgConnection, change: &BillingChange) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO billing_changes (
            id, tenant_id, change_type, from_plan_id, to_plan_id, addon_id,
            from_quantity, to_quantity, from_billing_interval, to_billing_interval,
            effective_date, prorata_credit, prorata_debit, status, payment_method,
            requested_by, applied_at, cancelled_at, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(change.id)
    .bind(change.tenant_id)
    .bind(change.change_type.as_str())
    .bind(change.from_plan_id)
    .bind(change.to_plan_id)
    .bind(change.addon_id)
    .bind(change.from_quantity)
    .bind(change.to_quantity)
    .bind(change.from_billing_interval.as_str())
    .bind(change.to_billing_interval.as_str())
    .bind(change.effective_date)
    .bind(change.prorata_credit)
    .bind(change.prorata_debit)
    .bind(change.status.as_str())
    .bind(change.payment_method.as_str())
    .bind(change.requested_by)
    .bind(change.applied_at)
    .bind(change.cancelled_at)
    .bind(change.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            BillingError::DuplicateOperation(match change.change_type {
                ChangeType::PlanChange => {
                    format!("Tenant {} already has a pending plan change", change.tenant_id)
                }
                ChangeType::AddonChange => format!(
                    "Tenant {} already has a pending change for add-on {:?}",
                    change.tenant_id, change.addon_id
                ),
            })
        } else {
            e.into()
        }
    })?;
    Ok(())
}

/// Upsert the explicit add-on row, bumping its version
async fn set_addon_quantity(
    conn: &mut PgConnection,
    tenant_id: Uuid,
    addon_id: Uuid,
    quantity: i32,
    at: OffsetDateTime,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO tenant_addons (tenant_id, addon_id, quantity, version, updated_at)
        VALUES ($1, $2, $3, 1, $4)
        ON CONFLICT (tenant_id, addon_id) DO UPDATE SET
            quantity = EXCLUDED.quantity,
            version = tenant_addons.version + 1,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(tenant_id)
    .bind(addon_id)
    .bind(quantity)
    .bind(at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_order_row(conn: &mut PgConnection, order: &MandateOrder) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO mandate_orders (
            id, order_number, commande_number, quote_id, tenant_id, plan_id, source, status,
            billing_cycle, plan_amount, addons_amount, addons_snapshot, annual_amount,
            discount_amount, final_amount, client, purchase_order_number, documents,
            rejection_reason, renews_subscription_id, is_deleted, deleted_by, deleted_at,
            created_at, updated_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
            $19, $20, $21, $22, $23, $24, $25
        )
        "#,
    )
    .bind(order.id)
    .bind(&order.order_number)
    .bind(&order.commande_number)
    .bind(order.quote_id)
    .bind(order.tenant_id)
    .bind(order.plan_id)
    .bind(order.source.as_str())
    .bind(order.status.as_str())
    .bind(order.billing_cycle.as_str())
    .bind(order.plan_amount)
    .bind(order.addons_amount)
    .bind(order.addons_snapshot.to_json()?)
    .bind(order.annual_amount)
    .bind(order.discount_amount)
    .bind(order.final_amount)
    .bind(Json(&order.client))
    .bind(&order.purchase_order_number)
    .bind(&order.documents)
    .bind(&order.rejection_reason)
    .bind(order.renews_subscription_id)
    .bind(order.is_deleted)
    .bind(order.deleted_by)
    .bind(order.deleted_at)
    .bind(order.created_at)
    .bind(order.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Persist the mutable fields of an order whose stored status is `expected`.
/// The frozen amounts and snapshot are never rewritten.
async fn update_order_row(
    conn: &mut PgConnection,
    order: &MandateOrder,
    expected: OrderStatus,
) -> BillingResult<()> {
    let rows_affected = sqlx::query(
        r#"
        UPDATE mandate_orders SET
            commande_number = $1,
            tenant_id = $2,
            status = $3,
            client = $4,
            purchase_order_number = $5,
            documents = $6,
            rejection_reason = $7,
            is_deleted = $8,
            deleted_by = $9,
            deleted_at = $10,
            updated_at = $11
        WHERE id = $12 AND status = $13 AND is_deleted = FALSE
        "#,
    )
    .bind(&order.commande_number)
    .bind(order.tenant_id)
    .bind(order.status.as_str())
    .bind(Json(&order.client))
    .bind(&order.purchase_order_number)
    .bind(&order.documents)
    .bind(&order.rejection_reason)
    .bind(order.is_deleted)
    .bind(order.deleted_by)
    .bind(order.deleted_at)
    .bind(order.updated_at)
    .bind(order.id)
    .bind(expected.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if rows_affected == 0 {
        return Err(BillingError::ConcurrentModification(format!(
            "Order {} is no longer {}. Please retry.",
            order.order_number, expected
        )));
    }
    Ok(())
}

async fn update_quote_row(
    conn: &mut PgConnection,
    quote: &Quote,
    expected: QuoteStatus,
) -> BillingResult<()> {
    let rows_affected = sqlx::query(
        r#"
        UPDATE quotes SET
            status = $1,
            payment_method = $2,
            mandate_order_id = $3,
            rejection_reason = $4,
            sent_at = $5,
            accepted_at = $6,
            updated_at = $7
        WHERE id = $8 AND status = $9
        "#,
    )
    .bind(quote.status.as_str())
    .bind(quote.payment_method.map(|m| m.as_str()))
    .bind(quote.mandate_order_id)
    .bind(&quote.rejection_reason)
    .bind(quote.sent_at)
    .bind(quote.accepted_at)
    .bind(quote.updated_at)
    .bind(quote.id)
    .bind(expected.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if rows_affected == 0 {
        return Err(BillingError::ConcurrentModification(format!(
            "Quote {} is no longer {}. Please retry.",
            quote.quote_number, expected
        )));
    }
    Ok(())
}

// =============================================================================
// Store
// =============================================================================

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> BillingResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BillingError::Database(format!("Migration failed: {}", e)))
    }

    async fn fetch_change(
        conn: &mut PgConnection,
        change_id: Uuid,
        lock: bool,
    ) -> BillingResult<BillingChange> {
        let sql = format!(
            "SELECT {} FROM billing_changes WHERE id = $1{}",
            CHANGE_COLUMNS,
            if lock { " FOR UPDATE" } else { "" }
        );
        let row: Option<BillingChangeRow> = sqlx::query_as(&sql)
            .bind(change_id)
            .fetch_optional(&mut *conn)
            .await?;
        row.ok_or_else(|| BillingError::NotFound(format!("Billing change {} not found", change_id)))?
            .try_into()
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn load_catalog(&self) -> BillingResult<PricingCatalog> {
        let plans: Vec<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, code, name, monthly_price, yearly_price, included_admins,
                   included_associations, included_communes, is_active
            FROM plans
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let addons: Vec<AddonRow> = sqlx::query_as(
            r#"
            SELECT id, code, name, monthly_unit_price, yearly_unit_price,
                   stripe_monthly_price_id, stripe_yearly_price_id
            FROM addons
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let access: Vec<PlanAddonRow> = sqlx::query_as(
            r#"
            SELECT plan_id, addon_id, enabled, monthly_price_override, yearly_price_override
            FROM plan_addons
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let plans = plans
            .into_iter()
            .map(|p| Plan {
                id: p.id,
                code: p.code,
                name: p.name,
                monthly_price: p.monthly_price,
                yearly_price: p.yearly_price,
                included_admins: p.included_admins,
                included_associations: p.included_associations,
                included_communes: p.included_communes,
                is_active: p.is_active,
            })
            .collect();
        let addons = addons
            .into_iter()
            .map(|a| {
                Ok(Addon {
                    id: a.id,
                    code: decode(&a.code, "addon code", AddonCode::from_str)?,
                    name: a.name,
                    monthly_unit_price: a.monthly_unit_price,
                    yearly_unit_price: a.yearly_unit_price,
                    stripe_monthly_price_id: a.stripe_monthly_price_id,
                    stripe_yearly_price_id: a.stripe_yearly_price_id,
                })
            })
            .collect::<BillingResult<Vec<_>>>()?;
        let access = access
            .into_iter()
            .map(|a| PlanAddonAccess {
                plan_id: a.plan_id,
                addon_id: a.addon_id,
                enabled: a.enabled,
                monthly_price_override: a.monthly_price_override,
                yearly_price_override: a.yearly_price_override,
            })
            .collect();

        Ok(PricingCatalog::new(plans, addons, access))
    }

    async fn get_tenant(&self, tenant_id: Uuid) -> BillingResult<Tenant> {
        let row: Option<TenantRow> = sqlx::query_as(
            r#"
            SELECT id, name, billing_email, subscription_plan_id, billing_interval,
                   billing_status, trial_ends_at, purchased_admins, purchased_associations,
                   purchased_communes, stripe_customer_id, stripe_subscription_id, created_at
            FROM tenants WHERE id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| BillingError::NotFound(format!("Tenant {} not found", tenant_id)))?
            .try_into()
    }

    async fn tenant_addons(&self, tenant_id: Uuid) -> BillingResult<Vec<TenantAddon>> {
        let rows: Vec<TenantAddonRow> = sqlx::query_as(
            "SELECT tenant_id, addon_id, quantity, version, updated_at FROM tenant_addons WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| TenantAddon {
                tenant_id: r.tenant_id,
                addon_id: r.addon_id,
                quantity: r.quantity,
                version: r.version,
                updated_at: r.updated_at,
            })
            .collect())
    }

    async fn next_sequence(&self, kind: SequenceKind, year: i32) -> BillingResult<i64> {
        let value: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO billing_sequences (kind, year, value) VALUES ($1, $2, 1)
            ON CONFLICT (kind, year) DO UPDATE SET value = billing_sequences.value + 1
            RETURNING value
            "#,
        )
        .bind(kind.as_str())
        .bind(year)
        .fetch_one(&self.pool)
        .await?;
        Ok(value)
    }

    async fn insert_billing_change(
        &self,
        change: &BillingChange,
        activity: &ActivityLogEntry,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_change_row(&mut tx, change).await?;
        insert_activity(&mut tx, std::slice::from_ref(activity)).await?;
        tx.commit().await?;
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
        let at = change.applied_at.unwrap_or(change.created_at);

        let mut tx = self.pool.begin().await?;

        let pending: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM billing_changes
                WHERE tenant_id = $1 AND addon_id = $2
                  AND change_type = 'ADDON_CHANGE' AND status = 'PENDING'
            )
            "#,
        )
        .bind(change.tenant_id)
        .bind(addon_id)
        .fetch_one(&mut *tx)
        .await?;
        if pending {
            return Err(BillingError::DuplicateOperation(format!(
                "Tenant {} already has a pending change for add-on {}",
                change.tenant_id, addon_id
            )));
        }

        let rows_affected = match expected_version {
            Some(version) => sqlx::query(
                r#"
                UPDATE tenant_addons SET
                    quantity = $1,
                    version = version + 1,
                    updated_at = $2
                WHERE tenant_id = $3 AND addon_id = $4 AND version = $5
                "#,
            )
            .bind(quantity)
            .bind(at)
            .bind(change.tenant_id)
            .bind(addon_id)
            .bind(version)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
            None => sqlx::query(
                r#"
                INSERT INTO tenant_addons (tenant_id, addon_id, quantity, version, updated_at)
                VALUES ($1, $2, $3, 1, $4)
                ON CONFLICT (tenant_id, addon_id) DO NOTHING
                "#,
            )
            .bind(change.tenant_id)
            .bind(addon_id)
            .bind(quantity)
            .bind(at)
            .execute(&mut *tx)
            .await?
            .rows_affected(),
        };

        if rows_affected == 0 {
            return Err(BillingError::ConcurrentModification(
                "Add-on quantity was modified by another request. Please retry.".to_string(),
            ));
        }

        insert_change_row(&mut tx, change).await?;
        insert_ledger_entries(&mut tx, entries).await?;
        insert_activity(&mut tx, std::slice::from_ref(activity)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_billing_change(&self, change_id: Uuid) -> BillingResult<BillingChange> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_change(&mut conn, change_id, false).await
    }

    async fn list_billing_changes(
        &self,
        tenant_id: Uuid,
        status: Option<ChangeStatus>,
    ) -> BillingResult<Vec<BillingChange>> {
        let sql = format!(
            "SELECT {} FROM billing_changes WHERE tenant_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at DESC",
            CHANGE_COLUMNS
        );
        let rows: Vec<BillingChangeRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn due_billing_changes(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> BillingResult<Vec<BillingChange>> {
        let sql = format!(
            "SELECT {} FROM billing_changes WHERE status = 'PENDING' AND effective_date <= $1 \
             ORDER BY effective_date, created_at, id LIMIT $2",
            CHANGE_COLUMNS
        );
        let rows: Vec<BillingChangeRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn cancel_billing_change(
        &self,
        change_id: Uuid,
        at: OffsetDateTime,
        activity: &ActivityLogEntry,
    ) -> BillingResult<BillingChange> {
        let mut tx = self.pool.begin().await?;
        let mut change = Self::fetch_change(&mut tx, change_id, true).await?;
        if change.status != ChangeStatus::Pending {
            return Err(BillingError::invalid_state(change.status, "cancel"));
        }

        sqlx::query("UPDATE billing_changes SET status = 'CANCELLED', cancelled_at = $1 WHERE id = $2")
            .bind(at)
            .bind(change_id)
            .execute(&mut *tx)
            .await?;
        insert_activity(&mut tx, std::slice::from_ref(activity)).await?;
        tx.commit().await?;

        change.status = ChangeStatus::Cancelled;
        change.cancelled_at = Some(at);
        Ok(change)
    }

    async fn apply_billing_change(
        &self,
        change_id: Uuid,
        entries: &[LedgerEntry],
        at: OffsetDateTime,
        activity: &ActivityLogEntry,
    ) -> BillingResult<ApplyOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut change = Self::fetch_change(&mut tx, change_id, true).await?;

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
                set_addon_quantity(&mut tx, change.tenant_id, addon_id, quantity, at).await?;
            }
            ChangeType::PlanChange => {
                sqlx::query(
                    "UPDATE tenants SET subscription_plan_id = $1, billing_interval = $2 WHERE id = $3",
                )
                .bind(change.to_plan_id)
                .bind(change.to_billing_interval.as_str())
                .bind(change.tenant_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query("UPDATE billing_changes SET status = 'APPLIED', applied_at = $1 WHERE id = $2")
            .bind(at)
            .bind(change_id)
            .execute(&mut *tx)
            .await?;
        insert_ledger_entries(&mut tx, entries).await?;
        insert_activity(&mut tx, std::slice::from_ref(activity)).await?;
        tx.commit().await?;

        change.status = ChangeStatus::Applied;
        change.applied_at = Some(at);
        Ok(ApplyOutcome::Applied(change))
    }

    async fn ledger_entries(&self, tenant_id: Uuid) -> BillingResult<Vec<LedgerEntry>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, billing_change_id, entry_type, amount, description, created_at
            FROM ledger_entries WHERE tenant_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(LedgerEntry {
                    id: r.id,
                    tenant_id: r.tenant_id,
                    billing_change_id: r.billing_change_id,
                    entry_type: decode(&r.entry_type, "entry_type", EntryType::from_str)?,
                    amount: r.amount,
                    description: r.description,
                    created_at: r.created_at,
                })
            })
            .collect()
    }

    async fn insert_order(
        &self,
        order: &MandateOrder,
        activity: &ActivityLogEntry,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_order_row(&mut tx, order).await?;
        insert_activity(&mut tx, std::slice::from_ref(activity)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> BillingResult<MandateOrder> {
        let sql = format!(
            "SELECT {} FROM mandate_orders WHERE id = $1 AND is_deleted = FALSE",
            ORDER_COLUMNS
        );
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| BillingError::NotFound(format!("Order {} not found", order_id)))?
            .try_into()
    }

    async fn list_orders(&self, tenant_id: Option<Uuid>) -> BillingResult<Vec<MandateOrder>> {
        let sql = format!(
            "SELECT {} FROM mandate_orders WHERE is_deleted = FALSE \
             AND ($1::UUID IS NULL OR tenant_id = $1) ORDER BY created_at DESC",
            ORDER_COLUMNS
        );
        let rows: Vec<OrderRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_order(
        &self,
        order: &MandateOrder,
        expected_status: OrderStatus,
        activity: &ActivityLogEntry,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        update_order_row(&mut tx, order, expected_status).await?;
        insert_activity(&mut tx, std::slice::from_ref(activity)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn accept_order(
        &self,
        order: &MandateOrder,
        expected_status: OrderStatus,
        subscription: &MandateSubscription,
        activities: &[ActivityLogEntry],
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        update_order_row(&mut tx, order, expected_status).await?;

        sqlx::query(
            r#"
            INSERT INTO mandate_subscriptions (
                id, tenant_id, order_id, plan_id, status, start_date, end_date,
                renewal_order_id, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.tenant_id)
        .bind(subscription.order_id)
        .bind(subscription.plan_id)
        .bind(subscription.status.as_str())
        .bind(subscription.start_date)
        .bind(subscription.end_date)
        .bind(subscription.renewal_order_id)
        .bind(subscription.created_at)
        .execute(&mut *tx)
        .await?;

        let rows_affected = sqlx::query("UPDATE tenants SET billing_status = $1 WHERE id = $2")
            .bind(BillingStatus::Active.as_str())
            .bind(subscription.tenant_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if rows_affected == 0 {
            return Err(BillingError::NotFound(format!(
                "Tenant {} not found",
                subscription.tenant_id
            )));
        }

        insert_activity(&mut tx, activities).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn invoice_order(
        &self,
        order: &MandateOrder,
        invoice: &MandateInvoice,
        reminders: &[MandateReminder],
        activities: &[ActivityLogEntry],
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        update_order_row(&mut tx, order, OrderStatus::Accepted).await?;

        sqlx::query(
            r#"
            INSERT INTO mandate_invoices (
                id, invoice_number, order_id, subscription_id, tenant_id, status,
                plan_amount, addons_amount, discount_amount, final_amount, tax_rate,
                tax_amount, total_with_tax, period_start, period_end, due_date, paid_at,
                is_deleted, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(invoice.id)
        .bind(&invoice.invoice_number)
        .bind(invoice.order_id)
        .bind(invoice.subscription_id)
        .bind(invoice.tenant_id)
        .bind(invoice.status.as_str())
        .bind(invoice.plan_amount)
        .bind(invoice.addons_amount)
        .bind(invoice.discount_amount)
        .bind(invoice.final_amount)
        .bind(invoice.tax_rate)
        .bind(invoice.tax_amount)
        .bind(invoice.total_with_tax)
        .bind(invoice.period_start)
        .bind(invoice.period_end)
        .bind(invoice.due_date)
        .bind(invoice.paid_at)
        .bind(invoice.is_deleted)
        .bind(invoice.created_at)
        .bind(invoice.updated_at)
        .execute(&mut *tx)
        .await?;

        for reminder in reminders {
            insert_reminder_row(&mut tx, reminder).await?;
        }

        insert_activity(&mut tx, activities).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_mandate_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<MandateSubscription> {
        let sql = format!(
            "SELECT {} FROM mandate_subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| {
            BillingError::NotFound(format!("Subscription {} not found", subscription_id))
        })?
        .try_into()
    }

    async fn subscription_for_order(
        &self,
        order_id: Uuid,
    ) -> BillingResult<Option<MandateSubscription>> {
        let sql = format!(
            "SELECT {} FROM mandate_subscriptions WHERE order_id = $1",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn active_mandate_subscription(
        &self,
        tenant_id: Uuid,
    ) -> BillingResult<Option<MandateSubscription>> {
        let sql = format!(
            "SELECT {} FROM mandate_subscriptions WHERE tenant_id = $1 AND status = 'ACTIVE' \
             ORDER BY start_date DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn active_mandate_subscriptions(&self) -> BillingResult<Vec<MandateSubscription>> {
        let sql = format!(
            "SELECT {} FROM mandate_subscriptions WHERE status = 'ACTIVE' ORDER BY end_date",
            SUBSCRIPTION_COLUMNS
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn insert_renewal_order(
        &self,
        subscription_id: Uuid,
        order: &MandateOrder,
        activities: &[ActivityLogEntry],
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_order_row(&mut tx, order).await?;

        let rows_affected = sqlx::query(
            "UPDATE mandate_subscriptions SET renewal_order_id = $1 WHERE id = $2 AND renewal_order_id IS NULL",
        )
        .bind(order.id)
        .bind(subscription_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if rows_affected == 0 {
            return Err(BillingError::DuplicateOperation(format!(
                "Subscription {} already has a renewal order",
                subscription_id
            )));
        }

        insert_activity(&mut tx, activities).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<MandateInvoice> {
        let sql = format!(
            "SELECT {} FROM mandate_invoices WHERE id = $1 AND is_deleted = FALSE",
            INVOICE_COLUMNS
        );
        let row: Option<InvoiceRow> = sqlx::query_as(&sql)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| BillingError::NotFound(format!("Invoice {} not found", invoice_id)))?
            .try_into()
    }

    async fn invoices_for_order(&self, order_id: Uuid) -> BillingResult<Vec<MandateInvoice>> {
        let sql = format!(
            "SELECT {} FROM mandate_invoices WHERE order_id = $1 AND is_deleted = FALSE ORDER BY created_at",
            INVOICE_COLUMNS
        );
        let rows: Vec<InvoiceRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update_invoice(
        &self,
        invoice: &MandateInvoice,
        expected_status: InvoiceStatus,
        activity: &ActivityLogEntry,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        let rows_affected = sqlx::query(
            r#"
            UPDATE mandate_invoices SET status = $1, paid_at = $2, updated_at = $3
            WHERE id = $4 AND status = $5
            "#,
        )
        .bind(invoice.status.as_str())
        .bind(invoice.paid_at)
        .bind(invoice.updated_at)
        .bind(invoice.id)
        .bind(expected_status.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if rows_affected == 0 {
            return Err(BillingError::ConcurrentModification(format!(
                "Invoice {} is no longer {}. Please retry.",
                invoice.invoice_number, expected_status
            )));
        }

        insert_activity(&mut tx, std::slice::from_ref(activity)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_reminder_if_absent(&self, reminder: &MandateReminder) -> BillingResult<bool> {
        let rows_affected = sqlx::query(
            r#"
            INSERT INTO mandate_reminders (
                id, tenant_id, subscription_id, invoice_id, reminder_type, reminder_level,
                scheduled_for, sent_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (subscription_id, reminder_type, reminder_level) DO NOTHING
            "#,
        )
        .bind(reminder.id)
        .bind(reminder.tenant_id)
        .bind(reminder.subscription_id)
        .bind(reminder.invoice_id)
        .bind(reminder.reminder_type.as_str())
        .bind(reminder.reminder_level)
        .bind(reminder.scheduled_for)
        .bind(reminder.sent_at)
        .bind(reminder.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn reminders_for_subscription(
        &self,
        subscription_id: Uuid,
    ) -> BillingResult<Vec<MandateReminder>> {
        let sql = format!(
            "SELECT {} FROM mandate_reminders WHERE subscription_id = $1 ORDER BY scheduled_for",
            REMINDER_COLUMNS
        );
        let rows: Vec<ReminderRow> = sqlx::query_as(&sql)
            .bind(subscription_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn due_reminders(
        &self,
        now: OffsetDateTime,
        limit: usize,
    ) -> BillingResult<Vec<MandateReminder>> {
        let rows: Vec<ReminderRow> = sqlx::query_as(
            r#"
            SELECT r.id, r.tenant_id, r.subscription_id, r.invoice_id, r.reminder_type,
                   r.reminder_level, r.scheduled_for, r.sent_at, r.created_at
            FROM mandate_reminders r
            LEFT JOIN mandate_invoices i ON i.id = r.invoice_id
            WHERE r.sent_at IS NULL
              AND r.scheduled_for <= $1
              AND (
                  r.reminder_type <> 'DUNNING'
                  OR (i.id IS NOT NULL AND i.is_deleted = FALSE AND i.status NOT IN ('PAID', 'CANCELLED'))
              )
            ORDER BY r.scheduled_for
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn mark_reminder_sent(
        &self,
        reminder_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let rows_affected = sqlx::query(
            "UPDATE mandate_reminders SET sent_at = $1 WHERE id = $2 AND sent_at IS NULL",
        )
        .bind(at)
        .bind(reminder_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn insert_quote(&self, quote: &Quote, activity: &ActivityLogEntry) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO quotes (
                id, quote_number, tenant_id, plan_id, billing_interval, lines, subtotal,
                discount_amount, total, status, payment_method, public_token, client,
                valid_until, mandate_order_id, rejection_reason, sent_at, accepted_at,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(quote.id)
        .bind(&quote.quote_number)
        .bind(quote.tenant_id)
        .bind(quote.plan_id)
        .bind(quote.billing_interval.as_str())
        .bind(Json(&quote.lines))
        .bind(quote.subtotal)
        .bind(quote.discount_amount)
        .bind(quote.total)
        .bind(quote.status.as_str())
        .bind(quote.payment_method.map(|m| m.as_str()))
        .bind(&quote.public_token)
        .bind(Json(&quote.client))
        .bind(quote.valid_until)
        .bind(quote.mandate_order_id)
        .bind(&quote.rejection_reason)
        .bind(quote.sent_at)
        .bind(quote.accepted_at)
        .bind(quote.created_at)
        .bind(quote.updated_at)
        .execute(&mut *tx)
        .await?;
        insert_activity(&mut tx, std::slice::from_ref(activity)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_quote(&self, quote_id: Uuid) -> BillingResult<Quote> {
        let sql = format!("SELECT {} FROM quotes WHERE id = $1", QUOTE_COLUMNS);
        let row: Option<QuoteRow> = sqlx::query_as(&sql)
            .bind(quote_id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| BillingError::NotFound(format!("Quote {} not found", quote_id)))?
            .try_into()
    }

    async fn get_quote_by_token(&self, token: &str) -> BillingResult<Quote> {
        let sql = format!("SELECT {} FROM quotes WHERE public_token = $1", QUOTE_COLUMNS);
        let row: Option<QuoteRow> = sqlx::query_as(&sql)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| BillingError::NotFound("Quote not found".to_string()))?
            .try_into()
    }

    async fn update_quote(
        &self,
        quote: &Quote,
        expected_status: QuoteStatus,
        activity: &ActivityLogEntry,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        update_quote_row(&mut tx, quote, expected_status).await?;
        insert_activity(&mut tx, std::slice::from_ref(activity)).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn accept_quote_with_order(
        &self,
        quote: &Quote,
        expected_status: QuoteStatus,
        order: &MandateOrder,
        activities: &[ActivityLogEntry],
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_order_row(&mut tx, order).await?;
        update_quote_row(&mut tx, quote, expected_status).await?;
        insert_activity(&mut tx, activities).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn activity_for_entity(&self, entity_id: Uuid) -> BillingResult<Vec<ActivityLogEntry>> {
        let rows: Vec<ActivityRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, entity_type, entity_id, action, old_status, new_status,
                   actor_id, actor_type, description, metadata, created_at
            FROM activity_log WHERE entity_id = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(ActivityLogEntry {
                    id: r.id,
                    tenant_id: r.tenant_id,
                    entity_type: decode(&r.entity_type, "entity_type", EntityType::from_str)?,
                    entity_id: r.entity_id,
                    action: r.action,
                    old_status: r.old_status,
                    new_status: r.new_status,
                    actor_id: r.actor_id,
                    actor_type: decode(&r.actor_type, "actor_type", ActorType::from_str)?,
                    description: r.description,
                    metadata: r.metadata,
                    created_at: r.created_at,
                })
            })
            .collect()
    }
}

async fn insert_reminder_row(
    conn: &mut PgConnection,
    reminder: &MandateReminder,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO mandate_reminders (
            id, tenant_id, subscription_id, invoice_id, reminder_type, reminder_level,
            scheduled_for, sent_at, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(reminder.id)
    .bind(reminder.tenant_id)
    .bind(reminder.subscription_id)
    .bind(reminder.invoice_id)
    .bind(reminder.reminder_type.as_str())
    .bind(reminder.reminder_level)
    .bind(reminder.scheduled_for)
    .bind(reminder.sent_at)
    .bind(reminder.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            BillingError::DuplicateOperation(format!(
                "Reminder level {} already scheduled for subscription {}",
                reminder.reminder_level, reminder.subscription_id
            ))
        } else {
            e.into()
        }
    })?;
    Ok(())
}
