//! Billing configuration loaded from the environment

use rust_decimal::Decimal;

use crate::error::{BillingError, BillingResult};

/// Default flat VAT rate (percent)
pub const DEFAULT_TAX_RATE_PERCENT: u32 = 20;

/// Default number of days between invoice creation and due date
pub const DEFAULT_INVOICE_DUE_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Flat tax rate applied to mandate invoices, in percent
    pub tax_rate_percent: Decimal,
    /// ISO currency code, lowercase (single currency)
    pub currency: String,
    pub invoice_due_days: i64,
    /// Maximum reminders processed per sweep run
    pub reminder_batch_size: usize,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            tax_rate_percent: Decimal::from(DEFAULT_TAX_RATE_PERCENT),
            currency: "eur".to_string(),
            invoice_due_days: DEFAULT_INVOICE_DUE_DAYS,
            reminder_batch_size: 200,
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let tax_rate_percent = match std::env::var("BILLING_TAX_RATE_PERCENT") {
            Ok(raw) => raw.parse::<Decimal>().map_err(|e| {
                BillingError::Config(format!("BILLING_TAX_RATE_PERCENT '{}': {}", raw, e))
            })?,
            Err(_) => defaults.tax_rate_percent,
        };
        if tax_rate_percent.is_sign_negative() || tax_rate_percent > Decimal::from(100) {
            return Err(BillingError::Config(format!(
                "BILLING_TAX_RATE_PERCENT must be within 0..=100, got {}",
                tax_rate_percent
            )));
        }

        let currency = std::env::var("BILLING_CURRENCY")
            .map(|c| c.to_lowercase())
            .unwrap_or(defaults.currency);

        let invoice_due_days = match std::env::var("MANDATE_INVOICE_DUE_DAYS") {
            Ok(raw) => raw.parse::<i64>().map_err(|e| {
                BillingError::Config(format!("MANDATE_INVOICE_DUE_DAYS '{}': {}", raw, e))
            })?,
            Err(_) => defaults.invoice_due_days,
        };

        let reminder_batch_size = match std::env::var("REMINDER_BATCH_SIZE") {
            Ok(raw) => raw.parse::<usize>().map_err(|e| {
                BillingError::Config(format!("REMINDER_BATCH_SIZE '{}': {}", raw, e))
            })?,
            Err(_) => defaults.reminder_batch_size,
        };

        Ok(Self {
            tax_rate_percent,
            currency,
            invoice_due_days,
            reminder_batch_size,
        })
    }

    /// Tax rate as a fraction (20% -> 0.20)
    pub fn tax_rate(&self) -> Decimal {
        self.tax_rate_percent / Decimal::from(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tax_rate_fraction() {
        let config = BillingConfig::default();
        assert_eq!(config.tax_rate(), Decimal::new(20, 2));
        assert_eq!(config.invoice_due_days, 30);
    }
}
