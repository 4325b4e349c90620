use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use license_sync_stripe::{CheckoutSessionRequest, StripeClient};

use crate::problem::ErrorResponse;
use crate::router::AppState;

/// Settings needed to start a hosted checkout, resolved once at startup.
#[derive(Clone, Debug, Default)]
pub struct CheckoutSettings {
    pub price_id: Option<String>,
    pub public_base_url: Option<String>,
    pub locale: String,
}

impl CheckoutSettings {
    fn urls(base: &str) -> (String, String) {
        let base = base.trim_end_matches('/');
        (
            format!("{base}/checkout/success?session_id={{CHECKOUT_SESSION_ID}}"),
            format!("{base}/checkout/cancel"),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    url: String,
}

/// Starts a hosted checkout session for the requesting device.
///
/// Configuration is checked before the request body so a misconfigured
/// deployment answers 500 regardless of input.
pub async fn create(
    State(state): State<AppState>,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<Json<CheckoutResponse>, ErrorResponse> {
    let settings = state.checkout_settings();
    let (stripe, price_id, base_url) =
        match (state.stripe(), settings.price_id.as_deref(), settings.public_base_url.as_deref()) {
            (Some(stripe), Some(price_id), Some(base_url)) => (stripe, price_id, base_url),
            (stripe, price_id, base_url) => {
                let missing = missing_settings(stripe, price_id, base_url);
                counter!("checkout_sessions_total", "result" => "unconfigured").increment(1);
                error!(stage = "checkout", %missing, "checkout is not configured");
                return Err(ErrorResponse::internal(format!(
                    "checkout is not configured: missing {missing}"
                )));
            }
        };

    let Json(request) = payload.map_err(|rejection| {
        counter!("checkout_sessions_total", "result" => "bad_request").increment(1);
        warn!(stage = "checkout", error = %rejection, "unreadable checkout request");
        ErrorResponse::bad_request(rejection.body_text())
    })?;

    let device_id = non_blank(request.device_id.as_deref()).ok_or_else(|| {
        counter!("checkout_sessions_total", "result" => "bad_request").increment(1);
        ErrorResponse::bad_request("device_id required")
    })?;
    let user_id = non_blank(request.user_id.as_deref());

    let (success_url, cancel_url) = CheckoutSettings::urls(base_url);
    let session = stripe
        .create_checkout_session(&CheckoutSessionRequest {
            price_id,
            device_id,
            user_id,
            success_url: &success_url,
            cancel_url: &cancel_url,
            locale: &settings.locale,
        })
        .await
        .map_err(|err| {
            counter!("checkout_sessions_total", "result" => "error").increment(1);
            error!(stage = "checkout", %device_id, error = %err, "failed to create checkout session");
            ErrorResponse::internal(err.to_string())
        })?;

    counter!("checkout_sessions_total", "result" => "ok").increment(1);
    info!(
        stage = "checkout",
        session_id = %session.id,
        %device_id,
        has_account = user_id.is_some(),
        "checkout session created"
    );

    Ok(Json(CheckoutResponse { url: session.url }))
}

fn missing_settings(
    stripe: Option<&StripeClient>,
    price_id: Option<&str>,
    base_url: Option<&str>,
) -> String {
    let mut missing = Vec::new();
    if stripe.is_none() {
        missing.push("STRIPE_SECRET_KEY");
    }
    if price_id.is_none() {
        missing.push("STRIPE_PRICE_ID");
    }
    if base_url.is_none() {
        missing.push("PUBLIC_BASE_URL");
    }
    missing.join(", ")
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}
