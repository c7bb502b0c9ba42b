//! API route definitions

pub mod assistants;
pub mod billing;
pub mod companies;
pub mod health;
pub mod usage;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{auth::require_auth, state::AppState};

/// Build the application router
pub fn router(state: AppState) -> Router {
    // Routes that carry their own authentication (webhook signatures) or none
    // (registration hook, health)
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/api/companies", post(companies::create_company))
        .route("/api/stripe/webhook", post(billing::webhook));

    let authenticated = Router::new()
        .route("/api/billing", get(billing::get_billing))
        .route("/api/billing/portal", post(billing::create_portal_session))
        .route("/api/subscription/upgrade", post(billing::upgrade_subscription))
        .route("/api/usage", get(usage::get_usage))
        .route(
            "/api/assistants",
            get(assistants::list_assistants).post(assistants::create_assistant),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public)
        .merge(authenticated)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .with_state(state)
}
