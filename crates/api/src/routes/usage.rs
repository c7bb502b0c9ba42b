//! Usage and quota API routes

use axum::{
    extract::{Extension, State},
    Json,
};
use botforge_billing::AccessGuard;
use serde::Serialize;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// Per-resource quota line
#[derive(Debug, Serialize)]
pub struct ResourceUsageItem {
    pub resource: String,
    /// -1 means unlimited
    pub limit: i64,
    pub current: i64,
    pub allowed: bool,
}

/// Usage summary response
#[derive(Debug, Serialize)]
pub struct UsageResponse {
    pub company_id: Uuid,
    pub plan: String,
    pub resources: Vec<ResourceUsageItem>,
}

/// Current resource counts against plan limits for the calling company
pub async fn get_usage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<UsageResponse>, ApiError> {
    let company_id = auth_user.company_id.ok_or(ApiError::NoCompany)?;

    let guard = AccessGuard::new(state.pool.clone());

    let statuses = guard.usage_summary(company_id).await.map_err(|e| {
        tracing::error!(company_id = %company_id, error = %e, "Failed to compute usage summary");
        ApiError::Database(format!("Failed to compute usage: {}", e))
    })?;

    let plan: Option<(Option<botforge_shared::PlanTier>,)> =
        sqlx::query_as("SELECT plan FROM subscriptions WHERE company_id = $1")
            .bind(company_id)
            .fetch_optional(&state.pool)
            .await?;
    let plan = botforge_billing::guard::effective_plan(plan.and_then(|(p,)| p));

    Ok(Json(UsageResponse {
        company_id,
        plan: plan.to_string(),
        resources: statuses
            .into_iter()
            .map(|s| ResourceUsageItem {
                resource: s.resource.to_string(),
                limit: s.limit,
                current: s.current,
                allowed: s.allowed,
            })
            .collect(),
    }))
}
