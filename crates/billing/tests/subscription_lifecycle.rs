//! Integration tests for the subscription lifecycle
//!
//! These tests exercise the record transitions and webhook idempotency
//! against a real database.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/botforge_test"
//! cargo test -p botforge-billing -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use botforge_billing::{
    AccessGuard, BillingService, PriceIds, StripeConfig, GRACE_PERIOD_DAYS,
};
use botforge_shared::{ResourceKind, SubscriptionStatus};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

// ============================================================================
// Test Utilities
// ============================================================================

fn test_stripe_config() -> StripeConfig {
    StripeConfig {
        secret_key: std::env::var("STRIPE_SECRET_KEY")
            .unwrap_or_else(|_| "sk_test_placeholder".to_string()),
        webhook_secret: "whsec_test_secret".to_string(),
        price_ids: PriceIds {
            starter: "price_test_starter".to_string(),
            professional: "price_test_professional".to_string(),
            business: "price_test_business".to_string(),
            enterprise: None,
        },
        app_base_url: "http://localhost:3000".to_string(),
    }
}

async fn setup() -> (BillingService, PgPool) {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");

    let billing = BillingService::new(test_stripe_config(), pool.clone());
    (billing, pool)
}

/// Create a test company
async fn create_test_company(pool: &PgPool) -> Uuid {
    let company_id = Uuid::new_v4();

    sqlx::query(
        r#"
        INSERT INTO companies (id, name, created_at, updated_at)
        VALUES ($1, $2, NOW(), NOW())
        "#,
    )
    .bind(company_id)
    .bind(format!("Test Company {}", company_id))
    .execute(pool)
    .await
    .expect("Failed to create test company");

    company_id
}

async fn cleanup(pool: &PgPool, company_id: Uuid) {
    for table in ["assistants", "invoices", "subscriptions", "companies"] {
        let query = match table {
            "companies" => format!("DELETE FROM {} WHERE id = $1", table),
            _ => format!("DELETE FROM {} WHERE company_id = $1", table),
        };
        sqlx::query(&query)
            .bind(company_id)
            .execute(pool)
            .await
            .expect("cleanup failed");
    }
}

async fn current_status(pool: &PgPool, company_id: Uuid) -> SubscriptionStatus {
    let (status,): (SubscriptionStatus,) =
        sqlx::query_as("SELECT status FROM subscriptions WHERE company_id = $1")
            .bind(company_id)
            .fetch_one(pool)
            .await
            .expect("subscription row missing");
    status
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_start_trial_is_idempotent() {
    let (billing, pool) = setup().await;
    let company_id = create_test_company(&pool).await;

    billing.subscriptions.start_trial(company_id).await.unwrap();

    let first = billing
        .subscriptions
        .get_record(company_id)
        .await
        .unwrap()
        .expect("trial record created");
    assert_eq!(first.status, SubscriptionStatus::Trial);
    let trial_end = first.trial_end.expect("trial end set");

    // Re-registering must not move the trial window
    billing.subscriptions.start_trial(company_id).await.unwrap();
    let second = billing
        .subscriptions
        .get_record(company_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.trial_end, Some(trial_end));

    cleanup(&pool, company_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_payment_failure_then_recovery() {
    let (billing, pool) = setup().await;
    let company_id = create_test_company(&pool).await;

    billing.subscriptions.start_trial(company_id).await.unwrap();
    sqlx::query("UPDATE subscriptions SET status = 'active' WHERE company_id = $1")
        .bind(company_id)
        .execute(&pool)
        .await
        .unwrap();

    // failed -> past_due even from active
    billing
        .subscriptions
        .apply_payment_failure(company_id)
        .await
        .unwrap();
    assert_eq!(
        current_status(&pool, company_id).await,
        SubscriptionStatus::PastDue
    );

    // paid -> recovered to active
    billing
        .subscriptions
        .apply_payment_recovery(company_id)
        .await
        .unwrap();
    assert_eq!(
        current_status(&pool, company_id).await,
        SubscriptionStatus::Active
    );

    // replaying the failure after the recovery moves it back to past_due
    billing
        .subscriptions
        .apply_payment_failure(company_id)
        .await
        .unwrap();
    assert_eq!(
        current_status(&pool, company_id).await,
        SubscriptionStatus::PastDue
    );

    cleanup(&pool, company_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_payment_failure_does_not_reopen_canceled() {
    let (billing, pool) = setup().await;
    let company_id = create_test_company(&pool).await;

    billing.subscriptions.start_trial(company_id).await.unwrap();
    billing.subscriptions.mark_deleted(company_id).await.unwrap();
    assert_eq!(
        current_status(&pool, company_id).await,
        SubscriptionStatus::Canceled
    );

    billing
        .subscriptions
        .apply_payment_failure(company_id)
        .await
        .unwrap();
    assert_eq!(
        current_status(&pool, company_id).await,
        SubscriptionStatus::Canceled
    );

    // a stray successful payment does not resurrect it either
    billing
        .subscriptions
        .apply_payment_recovery(company_id)
        .await
        .unwrap();
    assert_eq!(
        current_status(&pool, company_id).await,
        SubscriptionStatus::Canceled
    );

    cleanup(&pool, company_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_access_decision_for_expired_trial() {
    let (billing, pool) = setup().await;
    let company_id = create_test_company(&pool).await;

    billing.subscriptions.start_trial(company_id).await.unwrap();

    // Age the trial past its window plus grace
    let expired_end = OffsetDateTime::now_utc() - Duration::days(GRACE_PERIOD_DAYS + 2);
    sqlx::query("UPDATE subscriptions SET trial_end = $1 WHERE company_id = $2")
        .bind(expired_end)
        .bind(company_id)
        .execute(&pool)
        .await
        .unwrap();

    let guard = AccessGuard::new(pool.clone());
    let decision = guard
        .access_decision(company_id, OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert!(decision.grace.should_block_access);

    cleanup(&pool, company_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_quota_counts_live_rows() {
    let (billing, pool) = setup().await;
    let company_id = create_test_company(&pool).await;

    billing.subscriptions.start_trial(company_id).await.unwrap();

    for i in 0..3 {
        sqlx::query(
            "INSERT INTO assistants (id, company_id, name) VALUES ($1, $2, $3)",
        )
        .bind(Uuid::new_v4())
        .bind(company_id)
        .bind(format!("assistant-{}", i))
        .execute(&pool)
        .await
        .unwrap();
    }

    let guard = AccessGuard::new(pool.clone());
    let quota = guard
        .check_resource_quota(company_id, ResourceKind::Assistants)
        .await
        .unwrap();
    assert_eq!(quota.current, 3);
    // Trial limits are Professional limits: 3 assistants, so the next one is denied
    assert_eq!(quota.limit, 3);
    assert!(!quota.allowed);

    cleanup(&pool, company_id).await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_webhook_event_claim_is_idempotent() {
    let (_billing, pool) = setup().await;

    let event_id = format!("evt_test_{}", Uuid::new_v4());

    // First claim wins
    let first: Option<(Uuid,)> = sqlx::query_as(
        r#"
        INSERT INTO stripe_webhook_events
            (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
        VALUES ($1, 'customer.subscription.updated', NOW(), 'processing', NOW())
        ON CONFLICT (stripe_event_id) DO UPDATE SET
            processing_result = 'processing',
            processing_started_at = NOW()
        WHERE stripe_webhook_events.processing_result = 'processing'
          AND stripe_webhook_events.processing_started_at < NOW() - INTERVAL '30 minutes'
        RETURNING id
        "#,
    )
    .bind(&event_id)
    .fetch_optional(&pool)
    .await
    .unwrap();
    assert!(first.is_some());

    // Redelivery of the same event does not re-claim
    let second: Option<(Uuid,)> = sqlx::query_as(
        r#"
        INSERT INTO stripe_webhook_events
            (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
        VALUES ($1, 'customer.subscription.updated', NOW(), 'processing', NOW())
        ON CONFLICT (stripe_event_id) DO UPDATE SET
            processing_result = 'processing',
            processing_started_at = NOW()
        WHERE stripe_webhook_events.processing_result = 'processing'
          AND stripe_webhook_events.processing_started_at < NOW() - INTERVAL '30 minutes'
        RETURNING id
        "#,
    )
    .bind(&event_id)
    .fetch_optional(&pool)
    .await
    .unwrap();
    assert!(second.is_none());

    sqlx::query("DELETE FROM stripe_webhook_events WHERE stripe_event_id = $1")
        .bind(&event_id)
        .execute(&pool)
        .await
        .unwrap();
}
