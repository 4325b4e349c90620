use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};

use license_sync_core::{RenewalPolicy, SignatureVerifier};
use license_sync_storage::Database;
use license_sync_stripe::StripeClient;
use license_sync_util::BillingConfig;

use crate::checkout::{self, CheckoutSettings};
use crate::ledger::PaymentLedger;
use crate::reconcile::EntitlementReconciler;
use crate::{status, telemetry, webhook};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    verifier: SignatureVerifier,
    clock: Clock,
    reconciler: EntitlementReconciler,
    ledger: PaymentLedger,
    checkout: Arc<CheckoutSettings>,
    stripe: Option<StripeClient>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        billing: &BillingConfig,
        stripe: Option<StripeClient>,
    ) -> Self {
        let clock: Clock = Arc::new(Utc::now);
        let verifier = SignatureVerifier::new(
            billing.webhook_secret.as_deref(),
            billing.signature_tolerance_secs,
        );
        let checkout = CheckoutSettings {
            price_id: billing.price_id.clone(),
            public_base_url: billing.public_base_url.clone(),
            locale: billing.checkout_locale.clone(),
        };
        Self {
            metrics,
            reconciler: EntitlementReconciler::new(
                storage.clone(),
                RenewalPolicy::annual(),
                clock.clone(),
            ),
            ledger: PaymentLedger::new(storage.clone(), clock.clone()),
            storage,
            verifier,
            clock,
            checkout: Arc::new(checkout),
            stripe,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock.clone();
        self.reconciler =
            EntitlementReconciler::new(self.storage.clone(), RenewalPolicy::annual(), clock.clone());
        self.ledger = PaymentLedger::new(self.storage.clone(), clock);
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn reconciler(&self) -> &EntitlementReconciler {
        &self.reconciler
    }

    pub fn ledger(&self) -> &PaymentLedger {
        &self.ledger
    }

    pub fn checkout_settings(&self) -> &CheckoutSettings {
        &self.checkout
    }

    pub fn stripe(&self) -> Option<&StripeClient> {
        self.stripe.as_ref()
    }
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/webhook", post(webhook::handle))
        .route("/checkout", post(checkout::create).layer(cors))
        .route("/entitlements/status", get(status::lookup))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}
