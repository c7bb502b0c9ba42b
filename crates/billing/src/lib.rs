// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries descriptive payloads
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Botforge Billing Module
//!
//! Handles Stripe integration for the subscription lifecycle.
//!
//! ## Features
//!
//! - **Subscription Records**: trial creation, Stripe sync, payment
//!   failure/recovery transitions
//! - **Grace Periods**: pure, clock-injected access calculation after expiry
//! - **Access Guard**: time-based gating plus per-plan resource quotas
//! - **Webhooks**: verified, idempotent reconciliation of Stripe events
//! - **Checkout & Portal**: upgrade checkout sessions, billing portal
//! - **History**: local invoice records and live payment methods

pub mod checkout;
pub mod client;
pub mod customer;
pub mod error;
pub mod grace;
pub mod guard;
pub mod history;
pub mod portal;
pub mod subscription;
pub mod webhooks;

// Checkout
pub use checkout::CheckoutService;

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Customer
pub use customer::CustomerService;

// Error
pub use error::{BillingError, BillingResult};

// Grace periods
pub use grace::{compute_grace_period, GracePeriod, GraceReason, Urgency, GRACE_PERIOD_DAYS};

// Access guard
pub use guard::{AccessDecision, AccessGuard, QuotaStatus, TRIAL_LIMITS_PLAN};

// History
pub use history::{BillingHistoryService, InvoiceRecord, PaymentMethodSummary};

// Portal
pub use portal::{PortalResponse, PortalService};

// Subscriptions
pub use subscription::{SubscriptionService, TRIAL_PERIOD_DAYS};

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub checkout: CheckoutService,
    pub customer: CustomerService,
    pub guard: AccessGuard,
    pub history: BillingHistoryService,
    pub portal: PortalService,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_client(stripe, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_client(StripeClient::new(config), pool)
    }

    fn with_client(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            checkout: CheckoutService::new(stripe.clone(), pool.clone()),
            customer: CustomerService::new(stripe.clone(), pool.clone()),
            guard: AccessGuard::new(pool.clone()),
            history: BillingHistoryService::new(stripe.clone(), pool.clone()),
            portal: PortalService::new(stripe.clone()),
            subscriptions: SubscriptionService::new(stripe.clone(), pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool),
        }
    }
}
