//! Company registration hook
//!
//! Called by the account-creation flow. Creating a company also creates its
//! subscription record with the trial window, which is where the lifecycle of
//! every record begins.

use axum::{extract::State, http::StatusCode, Json};
use botforge_shared::Company;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

/// Request to register a company
#[derive(Debug, Deserialize)]
pub struct CreateCompanyRequest {
    pub name: String,
}

/// Registered company response
#[derive(Debug, Serialize)]
pub struct CompanyResponse {
    pub id: Uuid,
    pub name: String,
    pub trial_end: Option<String>,
}

/// Register a company and start its trial
pub async fn create_company(
    State(state): State<AppState>,
    Json(req): Json<CreateCompanyRequest>,
) -> Result<(StatusCode, Json<CompanyResponse>), ApiError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(ApiError::Validation("Company name is required".to_string()));
    }

    let company: Company = sqlx::query_as(
        r#"
        INSERT INTO companies (id, name)
        VALUES ($1, $2)
        RETURNING id, name, stripe_customer_id, created_at, updated_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .fetch_one(&state.pool)
    .await?;

    botforge_billing::subscription::start_trial(&state.pool, company.id)
        .await
        .map_err(|e| {
            tracing::error!(company_id = %company.id, error = %e, "Failed to start trial");
            ApiError::Database(format!("Failed to start trial: {}", e))
        })?;

    let trial_end: Option<(Option<time::OffsetDateTime>,)> =
        sqlx::query_as("SELECT trial_end FROM subscriptions WHERE company_id = $1")
            .bind(company.id)
            .fetch_optional(&state.pool)
            .await?;

    tracing::info!(company_id = %company.id, name = %company.name, "Company registered");

    Ok((
        StatusCode::CREATED,
        Json(CompanyResponse {
            id: company.id,
            name: company.name,
            trial_end: trial_end
                .and_then(|(t,)| t)
                .map(crate::routes::billing::format_datetime),
        }),
    ))
}
