//! Billing history: local invoice records and live payment methods

use serde::Serialize;
use sqlx::PgPool;
use stripe::{ListPaymentMethods, PaymentMethod, PaymentMethodTypeFilter};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::customer::CustomerService;
use crate::error::BillingResult;

/// A locally stored invoice record, written by the webhook reconciler
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InvoiceRecord {
    pub id: Uuid,
    pub company_id: Uuid,
    pub stripe_invoice_id: String,
    pub amount_due_cents: i64,
    pub amount_paid_cents: i64,
    pub currency: String,
    pub status: String,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
    pub hosted_invoice_url: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Card on file, as shown on the billing page
#[derive(Debug, Clone, Serialize)]
pub struct PaymentMethodSummary {
    pub id: String,
    pub brand: String,
    pub last4: String,
    pub exp_month: i64,
    pub exp_year: i64,
}

/// Billing history service
pub struct BillingHistoryService {
    stripe: StripeClient,
    pool: PgPool,
}

impl BillingHistoryService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// List recent invoices for a company, newest first
    pub async fn list_invoices(
        &self,
        company_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<InvoiceRecord>> {
        let invoices: Vec<InvoiceRecord> = sqlx::query_as(
            r#"
            SELECT id, company_id, stripe_invoice_id, amount_due_cents, amount_paid_cents,
                   currency, status, period_start, period_end, paid_at, hosted_invoice_url,
                   created_at
            FROM invoices
            WHERE company_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(company_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(invoices)
    }

    /// List the company's cards on file, fetched live from Stripe.
    ///
    /// A company without a Stripe customer simply has no payment methods. If
    /// the stored customer id turns out to be stale the reference is cleared
    /// and an empty list returned, so a dead id never breaks the billing page.
    pub async fn list_payment_methods(
        &self,
        company_id: Uuid,
    ) -> BillingResult<Vec<PaymentMethodSummary>> {
        let stored: Option<(Option<String>,)> =
            sqlx::query_as("SELECT stripe_customer_id FROM companies WHERE id = $1")
                .bind(company_id)
                .fetch_optional(&self.pool)
                .await?;

        let customer_id = match stored {
            Some((Some(id),)) => id,
            _ => return Ok(Vec::new()),
        };

        let customers = CustomerService::new(self.stripe.clone(), self.pool.clone());
        match customers.retrieve_customer(&customer_id).await? {
            Some(_) => {}
            None => {
                tracing::warn!(
                    company_id = %company_id,
                    customer_id = %customer_id,
                    "Stored Stripe customer gone while listing payment methods, clearing reference"
                );
                customers.clear_customer_reference(company_id).await?;
                return Ok(Vec::new());
            }
        }

        let parsed = customers.get_customer_id(company_id).await?;

        let mut params = ListPaymentMethods::new();
        params.customer = Some(parsed);
        params.type_ = Some(PaymentMethodTypeFilter::Card);

        let methods = PaymentMethod::list(self.stripe.inner(), &params).await?;

        let summaries = methods
            .data
            .into_iter()
            .filter_map(|pm| {
                let card = pm.card?;
                Some(PaymentMethodSummary {
                    id: pm.id.to_string(),
                    brand: format!("{:?}", card.brand).to_lowercase(),
                    last4: card.last4,
                    exp_month: card.exp_month as i64,
                    exp_year: card.exp_year as i64,
                })
            })
            .collect();

        Ok(summaries)
    }
}
