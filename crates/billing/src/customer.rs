//! Stripe customer management

use sqlx::PgPool;
use stripe::{CreateCustomer, Customer, CustomerId};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Customer service for managing Stripe customers
pub struct CustomerService {
    stripe: StripeClient,
    pool: PgPool,
}

impl CustomerService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Create or get a Stripe customer for a company.
    ///
    /// If the stored customer id turns out to be stale (Stripe reports the
    /// customer gone or deleted), the reference is cleared and a fresh
    /// customer is created instead of retrying against a dead id.
    pub async fn get_or_create_customer(
        &self,
        company_id: Uuid,
        email: &str,
        name: &str,
    ) -> BillingResult<Customer> {
        let existing: Option<(Option<String>,)> =
            sqlx::query_as("SELECT stripe_customer_id FROM companies WHERE id = $1")
                .bind(company_id)
                .fetch_optional(&self.pool)
                .await?;

        if let Some((Some(customer_id),)) = existing {
            match self.retrieve_customer(&customer_id).await {
                Ok(Some(customer)) => return Ok(customer),
                Ok(None) => {
                    tracing::warn!(
                        company_id = %company_id,
                        customer_id = %customer_id,
                        "Stored Stripe customer no longer exists, clearing reference"
                    );
                    self.clear_customer_reference(company_id).await?;
                }
                Err(e) => return Err(e),
            }
        }

        self.create_customer(company_id, email, name).await
    }

    /// Create a new Stripe customer bound to a company
    pub async fn create_customer(
        &self,
        company_id: Uuid,
        email: &str,
        name: &str,
    ) -> BillingResult<Customer> {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("company_id".to_string(), company_id.to_string());
        metadata.insert("platform".to_string(), "botforge".to_string());

        let params = CreateCustomer {
            email: Some(email),
            name: Some(name),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), params).await?;

        sqlx::query(
            "UPDATE companies SET stripe_customer_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(customer.id.as_str())
        .bind(company_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            company_id = %company_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer)
    }

    /// Get the Stripe customer ID for a company
    pub async fn get_customer_id(&self, company_id: Uuid) -> BillingResult<CustomerId> {
        let result: Option<(Option<String>,)> =
            sqlx::query_as("SELECT stripe_customer_id FROM companies WHERE id = $1")
                .bind(company_id)
                .fetch_optional(&self.pool)
                .await?;

        match result {
            Some((Some(id),)) => id
                .parse::<CustomerId>()
                .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e))),
            _ => Err(BillingError::CustomerNotFound(company_id.to_string())),
        }
    }

    /// Retrieve a customer, distinguishing "gone" from real failures.
    /// Ok(None) means Stripe reports the customer missing or deleted.
    pub async fn retrieve_customer(&self, customer_id: &str) -> BillingResult<Option<Customer>> {
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        match Customer::retrieve(self.stripe.inner(), &customer_id, &[]).await {
            Ok(customer) => {
                if customer.deleted {
                    Ok(None)
                } else {
                    Ok(Some(customer))
                }
            }
            Err(stripe::StripeError::Stripe(request_err))
                if request_err.http_status == 404 =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Null out a stale customer reference everywhere it is stored
    pub async fn clear_customer_reference(&self, company_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "UPDATE companies SET stripe_customer_id = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(company_id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET stripe_customer_id = NULL, updated_at = NOW()
            WHERE company_id = $1
            "#,
        )
        .bind(company_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
