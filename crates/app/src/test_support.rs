use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, Response},
};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use license_sync_storage::Database;
use license_sync_stripe::StripeClient;
use license_sync_util::config::{
    DEFAULT_CHECKOUT_LOCALE, DEFAULT_SIGNATURE_TOLERANCE_SECS, DEFAULT_STRIPE_API_BASE,
};
use license_sync_util::BillingConfig;

use crate::router::{app_router, AppState};
use crate::telemetry;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

pub fn at(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .expect("timestamp")
        .with_timezone(&Utc)
}

pub async fn memory_database() -> Database {
    let database = Database::connect("sqlite::memory:")
        .await
        .expect("connect");
    database.run_migrations().await.expect("migrations");
    database
}

pub fn billing_config() -> BillingConfig {
    BillingConfig {
        webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        api_base: DEFAULT_STRIPE_API_BASE.to_string(),
        signature_tolerance_secs: DEFAULT_SIGNATURE_TOLERANCE_SECS,
        checkout_locale: DEFAULT_CHECKOUT_LOCALE.to_string(),
        ..BillingConfig::default()
    }
}

pub fn test_state(
    database: &Database,
    billing: BillingConfig,
    stripe: Option<StripeClient>,
    now: DateTime<Utc>,
) -> AppState {
    let metrics = telemetry::init_metrics().expect("metrics init");
    AppState::new(metrics, database.clone(), &billing, stripe).with_clock(Arc::new(move || now))
}

pub async fn send(state: AppState, request: Request<Body>) -> Response<Body> {
    app_router(state).oneshot(request).await.expect("response")
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}
