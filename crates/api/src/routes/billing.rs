//! Billing routes for Stripe integration

use axum::{
    extract::{Extension, State},
    http::HeaderMap,
    Json,
};
use botforge_billing::{AccessGuard, BillingError, GracePeriod, GraceReason};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Request to start a subscription upgrade checkout
#[derive(Debug, Deserialize)]
pub struct UpgradeRequest {
    pub plan_id: String,
    pub company_id: Uuid,
}

/// Response from starting an upgrade checkout
#[derive(Debug, Serialize)]
pub struct UpgradeResponse {
    pub session_id: String,
    pub checkout_url: Option<String>,
}

/// Response from creating a portal session
#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub portal_url: String,
}

/// Grace metadata as rendered on the billing page and warning banners
#[derive(Debug, Serialize)]
pub struct GraceInfo {
    pub is_in_grace_period: bool,
    pub days_remaining_in_grace: i64,
    pub should_block_access: bool,
    pub urgency: botforge_billing::Urgency,
    pub grace_period_ends_at: Option<String>,
    pub reason: &'static str,
    pub message: &'static str,
}

impl From<GracePeriod> for GraceInfo {
    fn from(grace: GracePeriod) -> Self {
        Self {
            is_in_grace_period: grace.is_in_grace_period,
            days_remaining_in_grace: grace.days_remaining_in_grace,
            should_block_access: grace.should_block_access,
            urgency: grace.urgency,
            grace_period_ends_at: grace.grace_period_ends_at.map(format_datetime),
            reason: grace.reason.code(),
            message: describe_reason(grace.reason),
        }
    }
}

/// Invoice line on the billing page
#[derive(Debug, Serialize)]
pub struct InvoiceItem {
    pub stripe_invoice_id: String,
    pub amount_due_cents: i64,
    pub amount_paid_cents: i64,
    pub currency: String,
    pub status: String,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
    pub paid_at: Option<String>,
    pub hosted_invoice_url: Option<String>,
}

/// Full billing overview response
#[derive(Debug, Serialize)]
pub struct BillingOverview {
    pub status: String,
    pub plan: Option<String>,
    pub trial_start: Option<String>,
    pub trial_end: Option<String>,
    pub subscription_start: Option<String>,
    pub subscription_end: Option<String>,
    pub subscription_cancel_at: Option<String>,
    pub subscription_canceled: bool,
    pub grace: GraceInfo,
    pub invoices: Vec<InvoiceItem>,
    pub payment_methods: Vec<botforge_billing::PaymentMethodSummary>,
}

/// Get the current subscription state, grace metadata, invoice history and
/// payment methods
pub async fn get_billing(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<BillingOverview>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let company_id = auth_user.company_id.ok_or(ApiError::NoCompany)?;

    let record = billing
        .subscriptions
        .get_record(company_id)
        .await
        .map_err(|e| {
            tracing::error!(company_id = %company_id, error = %e, "Failed to load subscription");
            ApiError::Database(format!("Failed to load subscription: {}", e))
        })?
        .ok_or(ApiError::NotFound)?;

    let decision = AccessGuard::evaluate(Some(&record), OffsetDateTime::now_utc());

    let invoices = billing
        .history
        .list_invoices(company_id, 24)
        .await
        .map_err(|e| ApiError::Database(format!("Failed to load invoices: {}", e)))?
        .into_iter()
        .map(|inv| InvoiceItem {
            stripe_invoice_id: inv.stripe_invoice_id,
            amount_due_cents: inv.amount_due_cents,
            amount_paid_cents: inv.amount_paid_cents,
            currency: inv.currency,
            status: inv.status,
            period_start: inv.period_start.map(format_datetime),
            period_end: inv.period_end.map(format_datetime),
            paid_at: inv.paid_at.map(format_datetime),
            hosted_invoice_url: inv.hosted_invoice_url,
        })
        .collect();

    // Live fetch; a stale customer reference is cleared internally and shows
    // up here as simply "no payment methods"
    let payment_methods = billing
        .history
        .list_payment_methods(company_id)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(
                company_id = %company_id,
                error = %e,
                "Failed to fetch payment methods from Stripe"
            );
            Vec::new()
        });

    Ok(Json(BillingOverview {
        status: record.status.to_string(),
        plan: record.plan.map(|p| p.to_string()),
        trial_start: record.trial_start.map(format_datetime),
        trial_end: record.trial_end.map(format_datetime),
        subscription_start: record.subscription_start.map(format_datetime),
        subscription_end: record.subscription_end.map(format_datetime),
        subscription_cancel_at: record.subscription_cancel_at.map(format_datetime),
        subscription_canceled: record.subscription_canceled,
        grace: decision.grace.into(),
        invoices,
        payment_methods,
    }))
}

/// Start a checkout session for upgrading onto a paid plan
pub async fn upgrade_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<UpgradeRequest>,
) -> Result<Json<UpgradeResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let company_id = auth_user.company_id.ok_or(ApiError::NoCompany)?;
    if company_id != req.company_id {
        tracing::warn!(
            user_id = %auth_user.user_id,
            token_company = %company_id,
            requested_company = %req.company_id,
            "Upgrade requested for a company the caller does not belong to"
        );
        return Err(ApiError::Forbidden);
    }
    if !auth_user.role.can_manage_billing() {
        return Err(ApiError::Forbidden);
    }

    let plan = billing
        .subscriptions
        .stripe()
        .config()
        .purchasable_plan(&req.plan_id)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let company_name: Option<(String,)> =
        sqlx::query_as("SELECT name FROM companies WHERE id = $1")
            .bind(company_id)
            .fetch_optional(&state.pool)
            .await?;
    let company_name = company_name.map(|(n,)| n).ok_or(ApiError::NoCompany)?;

    let email = auth_user.email.as_deref().unwrap_or("");
    let customer = billing
        .customer
        .get_or_create_customer(company_id, email, &company_name)
        .await
        .map_err(|e| {
            tracing::error!(company_id = %company_id, error = %e, "Failed to resolve customer");
            ApiError::Database(format!("Failed to resolve customer: {}", e))
        })?;

    let session = billing
        .checkout
        .create_subscription_checkout(company_id, customer.id.as_str(), plan)
        .await
        .map_err(|e| {
            tracing::error!(
                company_id = %company_id,
                plan = %plan,
                error = %e,
                "Failed to create checkout session"
            );
            ApiError::Database(format!("Failed to create checkout: {}", e))
        })?;

    tracing::info!(
        company_id = %company_id,
        plan = %plan,
        session_id = %session.id,
        "Upgrade checkout session created"
    );

    Ok(Json(UpgradeResponse {
        session_id: session.id.to_string(),
        checkout_url: session.url,
    }))
}

/// Create a billing portal session
pub async fn create_portal_session(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<PortalResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let company_id = auth_user.company_id.ok_or(ApiError::NoCompany)?;

    let customer_id = billing
        .customer
        .get_customer_id(company_id)
        .await
        .map_err(|e| match e {
            BillingError::CustomerNotFound(_) => ApiError::BadRequest(
                "No billing account yet. Start an upgrade first.".to_string(),
            ),
            e => ApiError::Database(format!("Failed to resolve customer: {}", e)),
        })?;

    let session = billing
        .portal
        .create_portal_session(company_id, customer_id.as_str())
        .await
        .map_err(|e| ApiError::Database(format!("Failed to create portal session: {}", e)))?;

    Ok(Json(PortalResponse {
        portal_url: session.url,
    }))
}

/// Handle Stripe webhook events
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    // A webhook endpoint without a verification secret would let forged
    // events mutate billing state; that is a 5xx, never a silent accept
    let billing = state.billing.as_ref().ok_or_else(|| {
        tracing::error!("Stripe webhook received but billing is not configured");
        ApiError::Internal
    })?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = billing.webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = ?e, "Stripe webhook signature verification failed");
        ApiError::BadRequest("Invalid webhook signature".to_string())
    })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    // Known-event handler failures surface as 5xx so Stripe redelivers;
    // handlers are idempotent, so redelivery is safe
    billing.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!("Webhook handling error: {}", e);
        ApiError::Database(format!("Webhook handling error: {}", e))
    })?;

    Ok(Json(serde_json::json!({ "received": true })))
}

/// Default copy for grace reason codes; localization happens client-side off
/// the `reason` code
fn describe_reason(reason: GraceReason) -> &'static str {
    match reason {
        GraceReason::TrialActive => "Your trial is active.",
        GraceReason::TrialEndingSoon => "Your trial ends soon. Upgrade to keep access.",
        GraceReason::TrialGracePeriod => {
            "Your trial has ended. Access continues for a short grace period."
        }
        GraceReason::TrialExpired => "Your trial has expired. Upgrade to restore access.",
        GraceReason::SubscriptionActive => "Your subscription is active.",
        GraceReason::SubscriptionEndingSoon => "Your subscription period ends soon.",
        GraceReason::SubscriptionGracePeriod => {
            "Your subscription has lapsed. Access continues for a short grace period."
        }
        GraceReason::SubscriptionExpired => {
            "Your subscription has expired. Upgrade to restore access."
        }
        GraceReason::SubscriptionCanceled => "Your subscription has been canceled.",
        GraceReason::PaymentPastDue => {
            "Your last payment failed. Please update your payment method."
        }
        GraceReason::PaymentIncomplete => "Your payment is still being processed.",
        GraceReason::CollectionPaused => "Billing for your subscription is paused.",
    }
}

pub(crate) fn format_datetime(dt: OffsetDateTime) -> String {
    dt.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
