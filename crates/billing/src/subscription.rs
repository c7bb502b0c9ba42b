//! Subscription record management
//!
//! The subscriptions table is the local source of truth for access gating.
//! Every mutation here is a single-statement absolute assignment keyed by the
//! external object's current state, so webhook redelivery is a no-op in effect
//! and concurrent readers never observe a half-applied event.

use botforge_shared::{Subscription, SubscriptionStatus};
use sqlx::PgPool;
use stripe::SubscriptionStatus as StripeSubStatus;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::BillingResult;

/// Trial length granted at registration
pub const TRIAL_PERIOD_DAYS: i64 = 30;

/// Subscription record service
pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Get the Stripe client for config access
    pub fn stripe(&self) -> &StripeClient {
        &self.stripe
    }

    /// Create the trial record at registration. Idempotent: a company that
    /// already has a record keeps it untouched, so the trial window is set
    /// exactly once.
    pub async fn start_trial(&self, company_id: Uuid) -> BillingResult<()> {
        start_trial(&self.pool, company_id).await
    }

    /// Load the subscription record for a company
    pub async fn get_record(&self, company_id: Uuid) -> BillingResult<Option<Subscription>> {
        let record: Option<Subscription> = sqlx::query_as(
            r#"
            SELECT company_id, status, plan, trial_start, trial_end,
                   subscription_start, subscription_end, subscription_cancel_at,
                   subscription_canceled, stripe_customer_id, stripe_subscription_id,
                   created_at, updated_at
            FROM subscriptions
            WHERE company_id = $1
            "#,
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Apply a Stripe subscription object to the local record.
    ///
    /// All fields are written in one statement. An unmapped price leaves the
    /// previously stored plan in place (logged, not fatal) so a catalog gap
    /// never wipes out the rest of the event's updates.
    pub async fn sync_from_stripe(
        &self,
        company_id: Uuid,
        subscription: &stripe::Subscription,
    ) -> BillingResult<()> {
        let status = map_stripe_status(subscription.status);

        let price_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string());

        let plan = match price_id.as_deref() {
            Some(price_id) => {
                let mapped = self.stripe.config().plan_for_price_id(price_id);
                if mapped.is_none() {
                    tracing::error!(
                        company_id = %company_id,
                        subscription_id = %subscription.id,
                        price_id = %price_id,
                        "Stripe price not in plan catalog, keeping previously stored plan"
                    );
                }
                mapped
            }
            None => None,
        };

        let period_start = timestamp(subscription.current_period_start);
        let period_end = timestamp(subscription.current_period_end);
        let cancel_at = subscription.cancel_at.and_then(opt_timestamp);
        let canceled = subscription.cancel_at_period_end
            || subscription.canceled_at.is_some()
            || status == SubscriptionStatus::Canceled;

        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(customer) => customer.id.to_string(),
        };

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                company_id, status, plan, subscription_start, subscription_end,
                subscription_cancel_at, subscription_canceled,
                stripe_customer_id, stripe_subscription_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (company_id) DO UPDATE SET
                status = EXCLUDED.status,
                plan = COALESCE(EXCLUDED.plan, subscriptions.plan),
                subscription_start = EXCLUDED.subscription_start,
                subscription_end = EXCLUDED.subscription_end,
                subscription_cancel_at = EXCLUDED.subscription_cancel_at,
                subscription_canceled = EXCLUDED.subscription_canceled,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                updated_at = NOW()
            "#,
        )
        .bind(company_id)
        .bind(status)
        .bind(plan)
        .bind(period_start)
        .bind(period_end)
        .bind(cancel_at)
        .bind(canceled)
        .bind(&customer_id)
        .bind(subscription.id.as_str())
        .execute(&self.pool)
        .await?;

        tracing::info!(
            company_id = %company_id,
            subscription_id = %subscription.id,
            status = %status,
            plan = ?plan,
            "Subscription record synced"
        );

        Ok(())
    }

    /// Finalize a deleted subscription: Canceled, cancellation flagged, paid
    /// period closed as of now
    pub async fn mark_deleted(&self, company_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'canceled',
                subscription_canceled = TRUE,
                subscription_end = NOW(),
                updated_at = NOW()
            WHERE company_id = $1
            "#,
        )
        .bind(company_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(company_id = %company_id, "Subscription marked canceled");

        Ok(())
    }

    /// A failed invoice moves the record to PastDue. Terminal statuses are not
    /// reopened by a failed invoice.
    pub async fn apply_payment_failure(&self, company_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'past_due', updated_at = NOW()
            WHERE company_id = $1
              AND status NOT IN ('canceled', 'incomplete_expired')
            "#,
        )
        .bind(company_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::warn!(company_id = %company_id, "Subscription moved to past_due");
        }

        Ok(())
    }

    /// A successful payment recovers a delinquent record to Active. Any other
    /// status is left alone; the payment is informational.
    pub async fn apply_payment_recovery(&self, company_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'active', updated_at = NOW()
            WHERE company_id = $1
              AND status IN ('past_due', 'unpaid')
            "#,
        )
        .bind(company_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!(company_id = %company_id, "Subscription recovered to active");
        }

        Ok(())
    }

}

/// Create the trial record for a newly registered company. Needs only a pool,
/// so registration works before Stripe is configured.
pub async fn start_trial(pool: &PgPool, company_id: Uuid) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO subscriptions (company_id, status, trial_start, trial_end)
        VALUES ($1, 'trial', NOW(), NOW() + ($2 || ' days')::INTERVAL)
        ON CONFLICT (company_id) DO NOTHING
        "#,
    )
    .bind(company_id)
    .bind(TRIAL_PERIOD_DAYS)
    .execute(pool)
    .await?;

    tracing::info!(
        company_id = %company_id,
        trial_days = TRIAL_PERIOD_DAYS,
        "Trial subscription ensured"
    );

    Ok(())
}

/// Map a Stripe subscription status onto the local enum
pub fn map_stripe_status(status: StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Trialing => SubscriptionStatus::Trial,
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::Canceled => SubscriptionStatus::Canceled,
        StripeSubStatus::PastDue => SubscriptionStatus::PastDue,
        StripeSubStatus::Unpaid => SubscriptionStatus::Unpaid,
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        StripeSubStatus::Paused => SubscriptionStatus::Paused,
    }
}

fn timestamp(unix: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(unix).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn opt_timestamp(unix: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(unix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stripe_status_mapping() {
        assert_eq!(
            map_stripe_status(StripeSubStatus::Trialing),
            SubscriptionStatus::Trial
        );
        assert_eq!(
            map_stripe_status(StripeSubStatus::Active),
            SubscriptionStatus::Active
        );
        assert_eq!(
            map_stripe_status(StripeSubStatus::PastDue),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            map_stripe_status(StripeSubStatus::IncompleteExpired),
            SubscriptionStatus::IncompleteExpired
        );
        assert_eq!(
            map_stripe_status(StripeSubStatus::Paused),
            SubscriptionStatus::Paused
        );
    }

    #[test]
    fn test_timestamp_conversion() {
        let ts = timestamp(1_706_745_600); // 2024-02-01T00:00:00Z
        assert_eq!(ts.unix_timestamp(), 1_706_745_600);
        // Out-of-range values degrade to the epoch instead of panicking
        assert_eq!(timestamp(i64::MAX), OffsetDateTime::UNIX_EPOCH);
        assert_eq!(opt_timestamp(i64::MAX), None);
    }
}
