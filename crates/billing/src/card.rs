//! Card-rail synchronisation
//!
//! After an add-on or plan change is applied for a tenant paying by card, the
//! proration is mirrored on the Stripe customer as invoice items and the
//! subscription item quantity is updated with Stripe's own proration off.
//! Amounts are converted to minor units here and nowhere else.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{
    CreateInvoiceItem, Currency, CustomerId, InvoiceItem, Subscription, SubscriptionId,
    UpdateSubscription, UpdateSubscriptionItems,
};

use crate::catalog::PricingCatalog;
use crate::changes::{BillingChange, ChangeType};
use crate::error::{BillingError, BillingResult};
use crate::tenant::Tenant;

#[async_trait]
pub trait CardBillingGateway: Send + Sync {
    async fn sync_change(
        &self,
        tenant: &Tenant,
        change: &BillingChange,
        catalog: &PricingCatalog,
    ) -> BillingResult<()>;
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub currency: String,
}

impl StripeConfig {
    /// `None` when `STRIPE_SECRET_KEY` is unset: card sync is disabled
    pub fn from_env(currency: &str) -> Option<Self> {
        std::env::var("STRIPE_SECRET_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(|secret_key| Self {
                secret_key,
                currency: currency.to_string(),
            })
    }
}

/// Whole currency units to cents, half away from zero
pub fn to_minor_units(amount: Decimal) -> BillingResult<i64> {
    (amount * Decimal::from(100))
        .round_dp_with_strategy(0, rust_decimal::RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| BillingError::Integrity(format!("Amount {} out of range", amount)))
}

#[derive(Clone)]
pub struct StripeGateway {
    client: stripe::Client,
    currency: Currency,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> BillingResult<Self> {
        let currency = config
            .currency
            .parse::<Currency>()
            .map_err(|_| BillingError::Config(format!("Unknown currency '{}'", config.currency)))?;
        Ok(Self {
            client: stripe::Client::new(config.secret_key),
            currency,
        })
    }

    async fn post_invoice_item(
        &self,
        customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
        amount_minor: i64,
        description: &str,
    ) -> BillingResult<()> {
        let mut params = CreateInvoiceItem::new(customer_id.clone());
        params.amount = Some(amount_minor);
        params.currency = Some(self.currency);
        params.description = Some(description);
        params.subscription = Some(subscription_id.clone());
        InvoiceItem::create(&self.client, params).await?;
        Ok(())
    }

    /// Set the quantity of the subscription item billing this price, adding
    /// the item when the subscription does not carry it yet
    async fn set_item_quantity(
        &self,
        subscription_id: &SubscriptionId,
        price_id: &str,
        quantity: u64,
    ) -> BillingResult<()> {
        let current = Subscription::retrieve(&self.client, subscription_id, &[]).await?;
        let existing = current
            .items
            .data
            .iter()
            .find(|item| item.price.as_ref().map(|p| p.id.as_str()) == Some(price_id))
            .map(|item| item.id.to_string());

        let item = match existing {
            Some(id) => UpdateSubscriptionItems {
                id: Some(id),
                quantity: Some(quantity),
                ..Default::default()
            },
            None => UpdateSubscriptionItems {
                price: Some(price_id.to_string()),
                quantity: Some(quantity),
                ..Default::default()
            },
        };

        let params = UpdateSubscription {
            items: Some(vec![item]),
            // Proration is computed and invoiced by us
            proration_behavior: Some(SubscriptionProrationBehavior::None),
            ..Default::default()
        };
        Subscription::update(&self.client, subscription_id, params).await?;
        Ok(())
    }
}

#[async_trait]
impl CardBillingGateway for StripeGateway {
    async fn sync_change(
        &self,
        tenant: &Tenant,
        change: &BillingChange,
        catalog: &PricingCatalog,
    ) -> BillingResult<()> {
        let (Some(customer), Some(subscription)) = (
            tenant.stripe_customer_id.as_deref(),
            tenant.stripe_subscription_id.as_deref(),
        ) else {
            return Ok(());
        };
        let customer_id = customer
            .parse::<CustomerId>()
            .map_err(|e| BillingError::CardProcessor(format!("Invalid customer ID: {}", e)))?;
        let subscription_id = subscription
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::CardProcessor(format!("Invalid subscription ID: {}", e)))?;

        let summary = change.summary();
        if change.prorata_debit > Decimal::ZERO {
            self.post_invoice_item(
                &customer_id,
                &subscription_id,
                to_minor_units(change.prorata_debit)?,
                &format!("Prorated charge: {}", summary),
            )
            .await?;
        }
        if change.prorata_credit > Decimal::ZERO {
            self.post_invoice_item(
                &customer_id,
                &subscription_id,
                -to_minor_units(change.prorata_credit)?,
                &format!("Prorated credit: {}", summary),
            )
            .await?;
        }

        if change.change_type == ChangeType::AddonChange {
            if let (Some(addon_id), Some(quantity)) = (change.addon_id, change.to_quantity) {
                let addon = catalog.addon(addon_id)?;
                match addon.stripe_price_id(change.to_billing_interval) {
                    Some(price_id) => {
                        let quantity = u64::try_from(quantity).map_err(|_| {
                            BillingError::Validation(format!("Invalid quantity {}", quantity))
                        })?;
                        self.set_item_quantity(&subscription_id, price_id, quantity)
                            .await?;
                    }
                    None => tracing::warn!(
                        tenant_id = %tenant.id,
                        addon = %addon.code,
                        "Add-on has no Stripe price for this interval, quantity not synced"
                    ),
                }
            }
        }

        tracing::info!(
            tenant_id = %tenant.id,
            change_id = %change.id,
            stripe_subscription_id = %subscription_id,
            "Synced billing change to card processor"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_units_round_half_away_from_zero() {
        assert_eq!(to_minor_units(Decimal::from(100)).unwrap(), 10_000);
        assert_eq!(to_minor_units(Decimal::new(2739, 2)).unwrap(), 2_739);
        assert_eq!(to_minor_units(Decimal::new(10005, 3)).unwrap(), 1_001);
        assert_eq!(to_minor_units(Decimal::ZERO).unwrap(), 0);
    }
}
