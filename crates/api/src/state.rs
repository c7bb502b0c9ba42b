//! Shared application state

use std::sync::Arc;

use botforge_billing::BillingService;
use sqlx::PgPool;

use crate::auth::JwtManager;
use crate::config::Config;

/// State shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub jwt: JwtManager,
    /// None when billing is disabled or Stripe is not configured; billing
    /// routes answer 5xx in that case rather than silently degrading
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: Option<BillingService>) -> Self {
        let jwt = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        Self {
            pool,
            config: Arc::new(config),
            jwt,
            billing: billing.map(Arc::new),
        }
    }
}
