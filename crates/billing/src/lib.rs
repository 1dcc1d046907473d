// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries owned context strings
#![allow(clippy::too_many_arguments)] // Store units of work take every row they write
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Civitas Billing Module
//!
//! Subscription billing for municipalities and associations, on two payment
//! rails: card subscriptions (Stripe) and administrative mandates backed by a
//! purchase order.
//!
//! ## Features
//!
//! - **Pricing Catalog**: Plans, add-ons and per-plan price overrides
//! - **Proration**: Credit/debit for mid-period add-on and plan changes
//! - **Billing Changes**: Immediate or scheduled changes, applied exactly once
//! - **Ledger**: Append-only credits and debits per tenant
//! - **Mandate Orders**: Validation, acceptance, invoicing and rejection
//! - **Invoices & Reminders**: Flat-VAT invoices with dunning reminders
//! - **Renewals**: J-60/J-30/J-15 reminders and renewal orders
//! - **Quotes**: Priced proposals accepted through a public token
//! - **Card Sync**: Mirror applied changes on the Stripe subscription

pub mod card;
pub mod catalog;
pub mod changes;
pub mod clock;
pub mod config;
pub mod email;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod invariants;
pub mod ledger;
pub mod mandate;
pub mod numbering;
pub mod proration;
pub mod quote;
pub mod store;
pub mod tenant;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

// Card
pub use card::{CardBillingGateway, StripeConfig, StripeGateway};

// Catalog
pub use catalog::{Addon, AddonCode, BillingInterval, Plan, PlanAddonAccess, PricingCatalog};

// Changes
pub use changes::{
    BillingChange, BillingChangeScheduler, ChangeResult, ChangeStatus, ChangeType,
    DueChangesReport,
};

// Clock
pub use clock::{Clock, FixedClock, SystemClock};

// Config
pub use config::BillingConfig;

// Email
pub use email::{BillingEmailService, EmailConfig, ReminderNotice, ReminderNotifier};

// Entitlement
pub use entitlement::{effective_addons, resolve_effective_quantity, EffectiveQuantity};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ActivityAction, ActivityLogEntry, Actor, ActorType, EntityType};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{EntryType, Ledger, LedgerEntry};

// Mandate
pub use mandate::invoice::{InvoiceStatus, MandateInvoice};
pub use mandate::order::{ClientDetails, MandateOrder, OrderSource, OrderStatus};
pub use mandate::reminder::{MandateReminder, ReminderSweeper, ReminderType, SweepReport};
pub use mandate::renewal::{RenewalEngine, RenewalReport};
pub use mandate::service::{MandateOrderService, NewOrder};
pub use mandate::snapshot::{AddonLine, AddonsSnapshot};
pub use mandate::subscription::{MandateSubscription, SubscriptionStatus};

// Proration
pub use proration::{BillingPeriod, PeriodBasis, Proration};

// Quotes
pub use quote::{NewQuote, Quote, QuoteService, QuoteStatus};

// Store
pub use store::{BillingStore, InMemoryStore, PgBillingStore};

// Tenant
pub use tenant::{BillingStatus, PaymentMethod, Tenant, TenantAddon};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub store: Arc<dyn BillingStore>,
    pub changes: BillingChangeScheduler,
    pub ledger: Ledger,
    pub orders: MandateOrderService,
    pub quotes: QuoteService,
    pub renewals: RenewalEngine,
    pub reminders: ReminderSweeper,
}

impl BillingService {
    /// Create a new billing service over Postgres from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let card = match StripeConfig::from_env(&config.currency) {
            Some(stripe) => Some(Arc::new(StripeGateway::new(stripe)?) as Arc<dyn CardBillingGateway>),
            None => {
                tracing::info!("STRIPE_SECRET_KEY not set, card sync disabled");
                None
            }
        };

        Ok(Self::new(
            Arc::new(PgBillingStore::new(pool)),
            Arc::new(SystemClock),
            config,
            Arc::new(BillingEmailService::from_env()),
            card,
        ))
    }

    /// Create a new billing service with explicit collaborators
    pub fn new(
        store: Arc<dyn BillingStore>,
        clock: Arc<dyn Clock>,
        config: BillingConfig,
        notifier: Arc<dyn ReminderNotifier>,
        card: Option<Arc<dyn CardBillingGateway>>,
    ) -> Self {
        let mut changes = BillingChangeScheduler::new(store.clone(), clock.clone());
        if let Some(card) = card {
            changes = changes.with_card_gateway(card);
        }

        Self {
            changes,
            ledger: Ledger::new(store.clone()),
            orders: MandateOrderService::new(store.clone(), clock.clone(), config.clone()),
            quotes: QuoteService::new(store.clone(), clock.clone()),
            renewals: RenewalEngine::new(store.clone(), clock.clone()),
            reminders: ReminderSweeper::new(
                store.clone(),
                notifier,
                clock,
                config.reminder_batch_size,
            ),
            store,
        }
    }
}
