mod checkout;
mod ledger;
mod problem;
mod reconcile;
mod router;
mod status;
mod telemetry;
#[cfg(test)]
mod test_support;
mod webhook;

use std::{net::SocketAddr, time::Duration};

use tracing::{info, warn};
use url::Url;

use license_sync_storage::Database;
use license_sync_stripe::StripeClient;
use license_sync_util::{load_env_file, AppConfig};

const STRIPE_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;
    info!(stage = "app", billing = ?config.billing, "loaded configuration");

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let billing = &config.billing;
    let stripe = match billing.secret_key.as_deref() {
        Some(secret_key) => {
            let http = reqwest::Client::builder()
                .timeout(STRIPE_HTTP_TIMEOUT)
                .build()?;
            let base_url = Url::parse(&billing.api_base)?;
            Some(StripeClient::new(secret_key, base_url, http))
        }
        None => {
            warn!(stage = "app", "STRIPE_SECRET_KEY is not set; checkout is disabled");
            None
        }
    };
    if billing.is_test_mode() {
        info!(stage = "app", "stripe secret key is a test-mode key");
    }

    let state = router::AppState::new(metrics, database, billing, stripe);
    if !state.verifier().has_secret() {
        warn!(
            stage = "app",
            "STRIPE_WEBHOOK_SIGNING_SECRET is not set; every webhook delivery will be rejected"
        );
    }

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
