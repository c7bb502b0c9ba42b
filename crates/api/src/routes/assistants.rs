//! Assistant management routes
//!
//! Assistant creation is the representative gated operation: it passes the
//! time-based access check first, then the plan quota, and only then writes.

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    Json,
};
use botforge_billing::{AccessGuard, Urgency};
use botforge_shared::ResourceKind;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiError, routes::billing::format_datetime, state::AppState};

/// Request to create an assistant
#[derive(Debug, Deserialize)]
pub struct CreateAssistantRequest {
    pub name: String,
}

/// Warning banner metadata attached to successful responses during grace
#[derive(Debug, Serialize)]
pub struct GraceWarning {
    pub days_remaining_in_grace: i64,
    pub urgency: Urgency,
    pub grace_period_ends_at: Option<String>,
}

/// Created assistant response
#[derive(Debug, Serialize)]
pub struct AssistantResponse {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_warning: Option<GraceWarning>,
}

/// Assistant list item
#[derive(Debug, Serialize)]
pub struct AssistantItem {
    pub id: Uuid,
    pub name: String,
    pub created_at: String,
}

/// Create an assistant (gated by subscription state and plan quota)
pub async fn create_assistant(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CreateAssistantRequest>,
) -> Result<(StatusCode, Json<AssistantResponse>), ApiError> {
    let company_id = auth_user.company_id.ok_or(ApiError::NoCompany)?;

    if req.name.trim().is_empty() {
        return Err(ApiError::Validation("Assistant name is required".to_string()));
    }

    let guard = AccessGuard::new(state.pool.clone());

    let decision = guard
        .access_decision(company_id, OffsetDateTime::now_utc())
        .await
        .map_err(|e| ApiError::Database(format!("Failed to check access: {}", e)))?;

    if !decision.allowed {
        tracing::info!(
            company_id = %company_id,
            status = %decision.status,
            reason = decision.grace.reason.code(),
            "Blocked assistant creation for expired subscription"
        );
        return Err(ApiError::SubscriptionExpired);
    }

    let quota = guard
        .check_resource_quota(company_id, ResourceKind::Assistants)
        .await
        .map_err(|e| ApiError::Database(format!("Failed to check quota: {}", e)))?;

    if !quota.allowed {
        return Err(ApiError::QuotaExceeded(format!(
            "Assistant limit reached ({}/{}). Upgrade your plan to add more.",
            quota.current, quota.limit
        )));
    }

    let assistant_id = Uuid::new_v4();
    sqlx::query("INSERT INTO assistants (id, company_id, name) VALUES ($1, $2, $3)")
        .bind(assistant_id)
        .bind(company_id)
        .bind(req.name.trim())
        .execute(&state.pool)
        .await?;

    tracing::info!(
        company_id = %company_id,
        assistant_id = %assistant_id,
        "Assistant created"
    );

    let grace_warning = decision.grace.is_in_grace_period.then(|| GraceWarning {
        days_remaining_in_grace: decision.grace.days_remaining_in_grace,
        urgency: decision.grace.urgency,
        grace_period_ends_at: decision.grace.grace_period_ends_at.map(format_datetime),
    });

    Ok((
        StatusCode::CREATED,
        Json(AssistantResponse {
            id: assistant_id,
            name: req.name.trim().to_string(),
            grace_warning,
        }),
    ))
}

/// List the company's assistants
pub async fn list_assistants(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<Vec<AssistantItem>>, ApiError> {
    let company_id = auth_user.company_id.ok_or(ApiError::NoCompany)?;

    let rows: Vec<(Uuid, String, OffsetDateTime)> = sqlx::query_as(
        "SELECT id, name, created_at FROM assistants WHERE company_id = $1 ORDER BY created_at",
    )
    .bind(company_id)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(
        rows.into_iter()
            .map(|(id, name, created_at)| AssistantItem {
                id,
                name,
                created_at: format_datetime(created_at),
            })
            .collect(),
    ))
}
