//! Proration calculator
//!
//! Pure functions computing the credit and debit owed when an add-on quantity
//! or a plan changes in the middle of a billing period. Amounts are whole
//! currency units rounded to the cent.
//!
//! The billing period depends on the tenant's interval:
//!
//! - MONTHLY: the calendar month containing `now`.
//! - YEARLY: the active mandate subscription's `[start, end]` when one exists,
//!   otherwise the anniversary window of the tenant's creation date.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime};

use crate::catalog::BillingInterval;
use crate::error::{BillingError, BillingResult};
use crate::mandate::subscription::MandateSubscription;
use crate::tenant::Tenant;

/// Where a billing period was derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodBasis {
    CalendarMonth,
    MandateSubscription,
    CreationAnniversary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub basis: PeriodBasis,
}

impl BillingPeriod {
    pub fn days_in_period(&self) -> i64 {
        (self.end.date() - self.start.date()).whole_days()
    }

    /// Days left until the period ends, floored at 0
    pub fn days_remaining(&self, now: OffsetDateTime) -> i64 {
        (self.end.date() - now.date())
            .whole_days()
            .clamp(0, self.days_in_period().max(0))
    }
}

/// Credit and debit produced by one change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proration {
    pub credit: Decimal,
    pub debit: Decimal,
    pub days_in_period: i64,
    pub days_remaining: i64,
}

impl Proration {
    pub fn zero() -> Self {
        Self {
            credit: Decimal::ZERO,
            debit: Decimal::ZERO,
            days_in_period: 0,
            days_remaining: 0,
        }
    }

    /// Credit minus debit
    pub fn net(&self) -> Decimal {
        self.credit - self.debit
    }
}

/// Round to the cent, half away from zero
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Shift by whole years; 29 February falls back to 28 February
pub fn add_years(at: OffsetDateTime, years: i32) -> BillingResult<OffsetDateTime> {
    let target = at.year() + years;
    at.replace_year(target)
        .or_else(|_| at.replace_day(28).and_then(|d| d.replace_year(target)))
        .map_err(|e| BillingError::Internal(format!("Cannot shift {} by {} years: {}", at, years, e)))
}

/// Midnight UTC on the first day of the month after `now`
pub fn first_of_next_month(now: OffsetDateTime) -> BillingResult<OffsetDateTime> {
    let (year, month) = match now.month() {
        Month::December => (now.year() + 1, Month::January),
        m => (now.year(), m.next()),
    };
    Date::from_calendar_date(year, month, 1)
        .map(|d| d.midnight().assume_utc())
        .map_err(|e| BillingError::Internal(format!("Invalid calendar date: {}", e)))
}

/// Calendar month containing `now`
pub fn calendar_month(now: OffsetDateTime) -> BillingResult<BillingPeriod> {
    let start = Date::from_calendar_date(now.year(), now.month(), 1)
        .map(|d| d.midnight().assume_utc())
        .map_err(|e| BillingError::Internal(format!("Invalid calendar date: {}", e)))?;
    Ok(BillingPeriod {
        start,
        end: first_of_next_month(now)?,
        basis: PeriodBasis::CalendarMonth,
    })
}

/// Yearly window around `now` anchored on the creation anniversary:
/// next anniversary >= now, previous = next - 1 year.
pub fn anniversary_window(
    created_at: OffsetDateTime,
    now: OffsetDateTime,
) -> BillingResult<BillingPeriod> {
    let mut next = add_years(created_at, now.year() - created_at.year())?;
    if next < now {
        next = add_years(created_at, now.year() - created_at.year() + 1)?;
    }
    let previous = add_years(next, -1)?;
    Ok(BillingPeriod {
        start: previous,
        end: next,
        basis: PeriodBasis::CreationAnniversary,
    })
}

/// Billing period a tenant's change is prorated against.
///
/// For yearly billing the concrete subscription period always takes
/// precedence over the creation anniversary; the two can disagree when the
/// subscription started long after signup.
pub fn resolve_period(
    tenant: &Tenant,
    subscription: Option<&MandateSubscription>,
    now: OffsetDateTime,
) -> BillingResult<BillingPeriod> {
    match tenant.billing_interval {
        BillingInterval::Monthly => calendar_month(now),
        BillingInterval::Yearly => match subscription {
            Some(sub) => Ok(BillingPeriod {
                start: sub.start_date,
                end: sub.end_date,
                basis: PeriodBasis::MandateSubscription,
            }),
            None => anniversary_window(tenant.created_at, now),
        },
    }
}

/// `amount * days_remaining / days_in_period`, multiplied before dividing so
/// that whole-day ratios stay exact.
fn remaining_share(amount: Decimal, days_remaining: i64, days_in_period: i64) -> BillingResult<Decimal> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(BillingError::Integrity(format!(
            "Negative price {} cannot be prorated",
            amount
        )));
    }
    if days_in_period <= 0 {
        return Err(BillingError::Integrity(format!(
            "Billing period has {} days",
            days_in_period
        )));
    }
    amount
        .checked_mul(Decimal::from(days_remaining))
        .and_then(|v| v.checked_div(Decimal::from(days_in_period)))
        .map(round_money)
        .ok_or_else(|| BillingError::Integrity("Overflow while prorating".to_string()))
}

/// Prorate a quantity change of an add-on priced `unit_price` per period.
///
/// Added units are debited, removed units credited, both for the days left.
pub fn prorate(
    unit_price: Decimal,
    period: &BillingPeriod,
    now: OffsetDateTime,
    quantity_delta: i32,
) -> BillingResult<Proration> {
    let days_in_period = period.days_in_period();
    let days_remaining = period.days_remaining(now);

    let units = Decimal::from(quantity_delta.unsigned_abs());
    let total = unit_price
        .checked_mul(units)
        .ok_or_else(|| BillingError::Integrity("Overflow while prorating".to_string()))?;
    let amount = remaining_share(total, days_remaining, days_in_period)?;

    let (credit, debit) = match quantity_delta.signum() {
        1 => (Decimal::ZERO, amount),
        -1 => (amount, Decimal::ZERO),
        _ => (Decimal::ZERO, Decimal::ZERO),
    };

    Ok(Proration {
        credit,
        debit,
        days_in_period,
        days_remaining,
    })
}

/// Prorate a plan swap.
///
/// Upgrade: credit the unused part of the old plan and debit the new plan for
/// the remaining days (net = the price difference). Downgrade or same price:
/// credit only the unused difference, no debit.
///
/// The downgrade credit is NOT `old_price × r`. It is `(old − new) × r`,
/// because the tenant keeps paying the new plan for the rest of the period
/// and no debit is posted for it. A downgrade to a free plan therefore
/// credits the full unused old price.
pub fn prorate_plan_change(
    old_price: Decimal,
    new_price: Decimal,
    period: &BillingPeriod,
    now: OffsetDateTime,
) -> BillingResult<Proration> {
    let days_in_period = period.days_in_period();
    let days_remaining = period.days_remaining(now);

    let (credit, debit) = if new_price > old_price {
        (
            remaining_share(old_price, days_remaining, days_in_period)?,
            remaining_share(new_price, days_remaining, days_in_period)?,
        )
    } else {
        (
            remaining_share(old_price - new_price, days_remaining, days_in_period)?,
            Decimal::ZERO,
        )
    };

    Ok(Proration {
        credit,
        debit,
        days_in_period,
        days_remaining,
    })
}
