//! Stripe Checkout sessions

use botforge_shared::PlanTier;
use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CustomerId,
};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Checkout service for creating Stripe checkout sessions
pub struct CheckoutService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Verify that a Stripe customer ID belongs to the given company
    /// Protects against mismatched company_id/customer_id pairs reaching checkout
    async fn verify_customer_ownership(
        &self,
        company_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<()> {
        let verified: Option<(String,)> = sqlx::query_as(
            "SELECT stripe_customer_id FROM companies WHERE id = $1 AND stripe_customer_id = $2",
        )
        .bind(company_id)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        if verified.is_none() {
            tracing::warn!(
                company_id = %company_id,
                customer_id = %customer_id,
                "Customer ID ownership verification failed"
            );
            return Err(BillingError::Internal(
                "Customer ID does not belong to this company".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a checkout session for upgrading a company onto a paid plan.
    /// The session carries `company_id` in metadata so the webhook reconciler
    /// can attribute the resulting subscription.
    pub async fn create_subscription_checkout(
        &self,
        company_id: Uuid,
        customer_id: &str,
        plan: PlanTier,
    ) -> BillingResult<CheckoutSession> {
        self.verify_customer_ownership(company_id, customer_id)
            .await?;

        let price_id = self
            .stripe
            .config()
            .price_id_for_plan(plan)
            .ok_or_else(|| BillingError::InvalidPlan(plan.to_string()))?
            .to_string();

        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let base_url = &self.stripe.config().app_base_url;
        let success_url = format!(
            "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
            base_url
        );
        let cancel_url = format!("{}/billing/cancel", base_url);

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("company_id".to_string(), company_id.to_string());
        metadata.insert("plan".to_string(), plan.to_string());

        let line_items = vec![CreateCheckoutSessionLineItems {
            price: Some(price_id),
            quantity: Some(1),
            ..Default::default()
        }];

        let params = CreateCheckoutSession {
            customer: Some(customer_id),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(line_items),
            success_url: Some(&success_url),
            cancel_url: Some(&cancel_url),
            metadata: Some(metadata),
            allow_promotion_codes: Some(true),
            billing_address_collection: Some(stripe::CheckoutSessionBillingAddressCollection::Auto),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            company_id = %company_id,
            session_id = %session.id,
            plan = %plan,
            "Created checkout session"
        );

        Ok(session)
    }
}
