//! Stripe webhook handling
//!
//! Translates asynchronous Stripe events into subscription record updates,
//! tolerating duplicate delivery, out-of-order delivery, and unknown or stale
//! references. Handlers are idempotent: updates are absolute field
//! assignments keyed by the external object's current state, so redelivery is
//! a no-op in effect.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Event, EventObject, EventType, Invoice, Subscription, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::subscription::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Verify and parse a Stripe webhook event
    ///
    /// Uses manual signature verification as a fallback to work around
    /// async-stripe version incompatibility with newer Stripe API versions.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        // Try the library verification first
        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Library webhook parsing failed, trying manual verification"
                );
            }
        }

        // Manual verification: parse the signature header t=timestamp,v1=signature
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in webhook signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::warn!("Missing v1 signature in webhook signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        // Reject replayed payloads (5 minute tolerance)
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|_| BillingError::WebhookSignatureInvalid)?
            .as_secs() as i64;

        if (now - timestamp).abs() > 300 {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret_key = webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        Ok(event)
    }

    /// Handle a verified Stripe event
    ///
    /// Claims exclusive processing rights atomically via
    /// INSERT...ON CONFLICT...RETURNING so duplicate deliveries and concurrent
    /// workers short-circuit before any handler runs. Events stuck in
    /// 'processing' for over 30 minutes can be re-claimed.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();

        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);

        const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE stripe_webhook_events.processing_result = 'processing'
              AND stripe_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type_str)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_none() {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type_str,
                "Duplicate webhook event, skipping"
            );
            return Ok(());
        }

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );

        let result = self.process_event_internal(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to record webhook processing outcome"
            );
        }

        result
    }

    /// Internal event dispatch
    async fn process_event_internal(&self, event: &Event) -> BillingResult<()> {
        let event_owned = event.clone();

        match event.type_ {
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                self.handle_subscription_change(event_owned).await?;
            }
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(event_owned).await?;
            }
            EventType::InvoicePaid | EventType::InvoicePaymentSucceeded => {
                self.handle_invoice_paid(event_owned).await?;
            }
            EventType::InvoicePaymentFailed => {
                self.handle_invoice_payment_failed(event_owned).await?;
            }
            EventType::CheckoutSessionCompleted => {
                self.handle_checkout_completed(event_owned).await?;
            }
            _ => {
                // Tracked so new event types that may need handlers show up in logs
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
            }
        }

        Ok(())
    }

    /// subscription.created / subscription.updated: sync the record from the
    /// event's subscription object
    async fn handle_subscription_change(&self, event: Event) -> BillingResult<()> {
        let subscription = self.extract_subscription(event)?;

        let customer_id = expandable_customer_id(&subscription.customer);
        let company_id = match self.get_company_id_from_customer(&customer_id).await? {
            Some(id) => id,
            None => {
                // An unmatched webhook must not fail the response; Stripe would
                // retry forever against a permanently-unresolvable state
                tracing::warn!(
                    customer_id = %customer_id,
                    subscription_id = %subscription.id,
                    "Webhook for unknown Stripe customer, skipping"
                );
                return Ok(());
            }
        };

        let sub_service = SubscriptionService::new(self.stripe.clone(), self.pool.clone());
        sub_service
            .sync_from_stripe(company_id, &subscription)
            .await?;

        if subscription.status == stripe::SubscriptionStatus::PastDue {
            tracing::warn!(
                company_id = %company_id,
                subscription_id = %subscription.id,
                "Subscription is past due"
            );
        }

        tracing::info!(
            company_id = %company_id,
            subscription_id = %subscription.id,
            status = ?subscription.status,
            "Subscription change applied"
        );

        Ok(())
    }

    /// subscription.deleted: close the paid period now
    async fn handle_subscription_deleted(&self, event: Event) -> BillingResult<()> {
        let subscription = self.extract_subscription(event)?;

        let customer_id = expandable_customer_id(&subscription.customer);
        let company_id = match self.get_company_id_from_customer(&customer_id).await? {
            Some(id) => id,
            None => {
                tracing::warn!(
                    customer_id = %customer_id,
                    subscription_id = %subscription.id,
                    "subscription.deleted for unknown Stripe customer, skipping"
                );
                return Ok(());
            }
        };

        let sub_service = SubscriptionService::new(self.stripe.clone(), self.pool.clone());
        sub_service.mark_deleted(company_id).await?;

        tracing::info!(
            company_id = %company_id,
            subscription_id = %subscription.id,
            "Subscription cancelled"
        );

        Ok(())
    }

    /// invoice.paid / invoice.payment_succeeded: recover delinquent records,
    /// otherwise informational
    async fn handle_invoice_paid(&self, event: Event) -> BillingResult<()> {
        let invoice = self.extract_invoice(event)?;

        let customer_id = match invoice_customer_id(&invoice) {
            Some(id) => id,
            None => {
                tracing::warn!(invoice_id = %invoice.id, "Invoice without customer, skipping");
                return Ok(());
            }
        };

        let company_id = match self.get_company_id_from_customer(&customer_id).await? {
            Some(id) => id,
            None => {
                tracing::warn!(
                    customer_id = %customer_id,
                    invoice_id = %invoice.id,
                    "invoice.paid for unknown Stripe customer, skipping"
                );
                return Ok(());
            }
        };

        self.store_invoice(company_id, &invoice, "paid").await?;

        let sub_service = SubscriptionService::new(self.stripe.clone(), self.pool.clone());
        sub_service.apply_payment_recovery(company_id).await?;

        tracing::info!(
            company_id = %company_id,
            invoice_id = %invoice.id,
            amount = invoice.amount_paid,
            "Invoice paid"
        );

        Ok(())
    }

    /// invoice.payment_failed: delinquency, except terminal statuses
    async fn handle_invoice_payment_failed(&self, event: Event) -> BillingResult<()> {
        let invoice = self.extract_invoice(event)?;

        let customer_id = match invoice_customer_id(&invoice) {
            Some(id) => id,
            None => {
                tracing::warn!(invoice_id = %invoice.id, "Invoice without customer, skipping");
                return Ok(());
            }
        };

        let company_id = match self.get_company_id_from_customer(&customer_id).await? {
            Some(id) => id,
            None => {
                tracing::warn!(
                    customer_id = %customer_id,
                    invoice_id = %invoice.id,
                    "invoice.payment_failed for unknown Stripe customer, skipping"
                );
                return Ok(());
            }
        };

        self.store_invoice(company_id, &invoice, "uncollectible")
            .await?;

        let sub_service = SubscriptionService::new(self.stripe.clone(), self.pool.clone());
        sub_service.apply_payment_failure(company_id).await?;

        tracing::warn!(
            company_id = %company_id,
            invoice_id = %invoice.id,
            amount = invoice.amount_due,
            "Invoice payment failed"
        );

        Ok(())
    }

    /// checkout.session.completed: resolve the created subscription and apply
    /// the same update path as subscription.created
    async fn handle_checkout_completed(&self, event: Event) -> BillingResult<()> {
        let session = match event.data.object {
            EventObject::CheckoutSession(session) => session,
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected CheckoutSession".to_string(),
                ))
            }
        };

        let company_id = session
            .metadata
            .as_ref()
            .and_then(|m| m.get("company_id"))
            .and_then(|id| Uuid::parse_str(id).ok());

        let company_id = match company_id {
            Some(id) => id,
            None => {
                tracing::warn!(
                    session_id = %session.id,
                    "Checkout session without company_id metadata, skipping"
                );
                return Ok(());
            }
        };

        let subscription_ref = match session.subscription {
            Some(subscription) => subscription,
            None => {
                tracing::warn!(
                    company_id = %company_id,
                    session_id = %session.id,
                    "Checkout session completed without subscription, skipping"
                );
                return Ok(());
            }
        };

        let parsed_sub_id = subscription_ref.id().parse().map_err(|_| {
            BillingError::SubscriptionNotFound(subscription_ref.id().to_string())
        })?;
        let subscription =
            Subscription::retrieve(self.stripe.inner(), &parsed_sub_id, &[]).await?;

        let sub_service = SubscriptionService::new(self.stripe.clone(), self.pool.clone());
        sub_service
            .sync_from_stripe(company_id, &subscription)
            .await?;

        tracing::info!(
            company_id = %company_id,
            subscription_id = %subscription.id,
            "Checkout completed, subscription created"
        );

        Ok(())
    }

    fn extract_subscription(&self, event: Event) -> BillingResult<Subscription> {
        match event.data.object {
            EventObject::Subscription(subscription) => Ok(subscription),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected Subscription".to_string(),
            )),
        }
    }

    fn extract_invoice(&self, event: Event) -> BillingResult<Invoice> {
        match event.data.object {
            EventObject::Invoice(invoice) => Ok(invoice),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected Invoice".to_string(),
            )),
        }
    }

    /// Resolve the company bound to a Stripe customer. None means the webhook
    /// references a customer this deployment does not know about.
    async fn get_company_id_from_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        let result: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM companies WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(result.map(|(id,)| id))
    }

    /// Upsert the local invoice record backing the billing history endpoint
    async fn store_invoice(
        &self,
        company_id: Uuid,
        invoice: &Invoice,
        status: &str,
    ) -> BillingResult<()> {
        let paid_at = if status == "paid" {
            Some(OffsetDateTime::now_utc())
        } else {
            None
        };

        let period_start = invoice
            .period_start
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok());
        let period_end = invoice
            .period_end
            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok());

        sqlx::query(
            r#"
            INSERT INTO invoices (
                id, company_id, stripe_invoice_id, amount_due_cents, amount_paid_cents,
                currency, status, period_start, period_end, paid_at, hosted_invoice_url
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (stripe_invoice_id) DO UPDATE SET
                status = EXCLUDED.status,
                amount_due_cents = EXCLUDED.amount_due_cents,
                amount_paid_cents = EXCLUDED.amount_paid_cents,
                paid_at = EXCLUDED.paid_at,
                hosted_invoice_url = EXCLUDED.hosted_invoice_url,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(company_id)
        .bind(invoice.id.as_str())
        .bind(invoice.amount_due.unwrap_or(0))
        .bind(invoice.amount_paid.unwrap_or(0))
        .bind(
            invoice
                .currency
                .as_ref()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "usd".to_string()),
        )
        .bind(status)
        .bind(period_start)
        .bind(period_end)
        .bind(paid_at)
        .bind(invoice.hosted_invoice_url.as_ref())
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            company_id = %company_id,
            stripe_invoice_id = %invoice.id,
            status = %status,
            "Stored invoice record"
        );

        Ok(())
    }
}

fn expandable_customer_id(customer: &stripe::Expandable<stripe::Customer>) -> String {
    match customer {
        stripe::Expandable::Id(id) => id.to_string(),
        stripe::Expandable::Object(customer) => customer.id.to_string(),
    }
}

fn invoice_customer_id(invoice: &Invoice) -> Option<String> {
    match &invoice.customer {
        Some(stripe::Expandable::Id(id)) => Some(id.to_string()),
        Some(stripe::Expandable::Object(customer)) => Some(customer.id.to_string()),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{PriceIds, StripeConfig};

    const TEST_SECRET: &str = "whsec_test_secret_for_unit_tests";

    fn test_handler(pool: PgPool) -> WebhookHandler {
        let config = StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: TEST_SECRET.to_string(),
            price_ids: PriceIds {
                starter: "price_starter".to_string(),
                professional: "price_professional".to_string(),
                business: "price_business".to_string(),
                enterprise: None,
            },
            app_base_url: "http://localhost:3000".to_string(),
        };
        WebhookHandler::new(StripeClient::new(config), pool)
    }

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        format!("t={},v1={}", timestamp, signature)
    }

    fn unix_now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    fn event_payload(created: i64) -> String {
        serde_json::json!({
            "id": "evt_test_1",
            "object": "event",
            "api_version": "2023-10-16",
            "created": created,
            "data": {
                "object": {
                    "id": "cus_unit_test",
                    "object": "customer"
                }
            },
            "livemode": false,
            "pending_webhooks": 0,
            "request": null,
            "type": "customer.created"
        })
        .to_string()
    }

    fn lazy_test_pool() -> PgPool {
        // Connection is never used by the verification tests
        sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/botforge_test")
            .unwrap()
    }

    #[tokio::test]
    async fn test_verify_rejects_malformed_signature_header() {
        let handler = test_handler(lazy_test_pool());
        let payload = event_payload(unix_now());

        let result = handler.verify_event(&payload, "not-a-signature");
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_secret() {
        let handler = test_handler(lazy_test_pool());
        let now = unix_now();
        let payload = event_payload(now);
        let signature = sign(&payload, "whsec_some_other_secret", now);

        let result = handler.verify_event(&payload, &signature);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[tokio::test]
    async fn test_verify_rejects_stale_timestamp() {
        let handler = test_handler(lazy_test_pool());
        let stale = unix_now() - 3600;
        let payload = event_payload(stale);
        let signature = sign(&payload, TEST_SECRET, stale);

        let result = handler.verify_event(&payload, &signature);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[tokio::test]
    async fn test_verify_accepts_valid_signature() {
        let handler = test_handler(lazy_test_pool());
        let now = unix_now();
        let payload = event_payload(now);
        let signature = sign(&payload, TEST_SECRET, now);

        let event = handler.verify_event(&payload, &signature).unwrap();
        assert_eq!(event.id.as_str(), "evt_test_1");
        assert_eq!(event.type_, EventType::CustomerCreated);
    }

    #[tokio::test]
    async fn test_verify_rejects_tampered_payload() {
        let handler = test_handler(lazy_test_pool());
        let now = unix_now();
        let payload = event_payload(now);
        let signature = sign(&payload, TEST_SECRET, now);

        let tampered = payload.replace("cus_unit_test", "cus_attacker");
        let result = handler.verify_event(&tampered, &signature);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }
}
