//! Botforge API server entry point

use botforge_api::{routes, AppState, Config};
use botforge_billing::BillingService;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let pool = botforge_shared::db::create_pool(&config.database_url).await?;
    botforge_shared::db::run_migrations(&pool).await?;

    let billing = if config.enable_billing {
        match BillingService::from_env(pool.clone()) {
            Ok(service) => Some(service),
            Err(e) => {
                // Visible in operational logs: the webhook endpoint answers
                // 5xx until Stripe is configured
                tracing::error!(error = %e, "Billing disabled: Stripe configuration incomplete");
                None
            }
        }
    } else {
        tracing::warn!("Billing disabled by ENABLE_BILLING");
        None
    };

    let bind_address = config.bind_address.clone();
    let state = AppState::new(pool, config, billing);
    let app = routes::router(state);

    tracing::info!(bind_address = %bind_address, "Starting Botforge API");

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
