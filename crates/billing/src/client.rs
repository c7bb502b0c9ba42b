//! Stripe client configuration and the plan catalog's price mapping

use std::str::FromStr;

use botforge_shared::PlanTier;
use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each subscription plan
    pub price_ids: PriceIds,
    /// Base URL for success/cancel redirects
    pub app_base_url: String,
}

/// Stripe price IDs for subscription plans
/// Plan ladder: Starter ($29) → Professional ($99) → Business ($299) → Enterprise (custom)
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub starter: String,
    pub professional: String,
    pub business: String,
    /// Enterprise deals are sales-led; a price may still exist for invoicing
    pub enterprise: Option<String>,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids: PriceIds {
                starter: std::env::var("STRIPE_PRICE_STARTER")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_STARTER not set".to_string()))?,
                professional: std::env::var("STRIPE_PRICE_PROFESSIONAL").map_err(|_| {
                    BillingError::Config("STRIPE_PRICE_PROFESSIONAL not set".to_string())
                })?,
                business: std::env::var("STRIPE_PRICE_BUSINESS")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_BUSINESS not set".to_string()))?,
                enterprise: std::env::var("STRIPE_PRICE_ENTERPRISE").ok(),
            },
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }

    /// Get the price ID for a plan
    pub fn price_id_for_plan(&self, plan: PlanTier) -> Option<&str> {
        match plan {
            PlanTier::Starter => Some(&self.price_ids.starter),
            PlanTier::Professional => Some(&self.price_ids.professional),
            PlanTier::Business => Some(&self.price_ids.business),
            PlanTier::Enterprise => self.price_ids.enterprise.as_deref(),
        }
    }

    /// Resolve a Stripe price ID back to a plan
    pub fn plan_for_price_id(&self, price_id: &str) -> Option<PlanTier> {
        if price_id == self.price_ids.starter {
            Some(PlanTier::Starter)
        } else if price_id == self.price_ids.professional {
            Some(PlanTier::Professional)
        } else if price_id == self.price_ids.business {
            Some(PlanTier::Business)
        } else if self.price_ids.enterprise.as_deref() == Some(price_id) {
            Some(PlanTier::Enterprise)
        } else {
            None
        }
    }

    /// Parse and validate a user-supplied plan identifier for checkout.
    /// Rejects unknown plans and plans that are not self-serve purchasable.
    pub fn purchasable_plan(&self, plan_id: &str) -> BillingResult<PlanTier> {
        let plan = PlanTier::from_str(plan_id)
            .map_err(|_| BillingError::InvalidPlan(plan_id.to_string()))?;
        if !plan.is_purchasable() {
            return Err(BillingError::InvalidPlan(format!(
                "{} is not available through self-serve checkout",
                plan
            )));
        }
        Ok(plan)
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_test_secret".to_string(),
            price_ids: PriceIds {
                starter: "price_starter".to_string(),
                professional: "price_professional".to_string(),
                business: "price_business".to_string(),
                enterprise: None,
            },
            app_base_url: "http://localhost:3000".to_string(),
        }
    }

    #[test]
    fn test_price_mapping_round_trip() {
        let config = test_config();
        for plan in [
            PlanTier::Starter,
            PlanTier::Professional,
            PlanTier::Business,
        ] {
            let price_id = config.price_id_for_plan(plan).unwrap();
            assert_eq!(config.plan_for_price_id(price_id), Some(plan));
        }
    }

    #[test]
    fn test_unmapped_price_resolves_to_none() {
        let config = test_config();
        assert_eq!(config.plan_for_price_id("price_unknown"), None);
        // Enterprise price unset in this config
        assert_eq!(config.price_id_for_plan(PlanTier::Enterprise), None);
    }

    #[test]
    fn test_purchasable_plan_validation() {
        let config = test_config();
        assert_eq!(
            config.purchasable_plan("professional").unwrap(),
            PlanTier::Professional
        );
        assert!(matches!(
            config.purchasable_plan("enterprise"),
            Err(BillingError::InvalidPlan(_))
        ));
        assert!(matches!(
            config.purchasable_plan("gold"),
            Err(BillingError::InvalidPlan(_))
        ));
    }
}
