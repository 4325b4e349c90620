use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

/// Client for the Stripe endpoints used to start a subscription purchase.
#[derive(Clone)]
pub struct StripeClient {
    http: Client,
    base_url: Url,
    secret_key: String,
}

impl StripeClient {
    /// Creates a new client with the provided configuration.
    pub fn new(secret_key: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            secret_key: secret_key.into(),
        }
    }

    /// Creates a hosted Checkout Session for a single subscription seat.
    ///
    /// The device and account identifiers are attached as session metadata and
    /// come back verbatim on the `checkout.session.completed` webhook.
    pub async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest<'_>,
    ) -> Result<CheckoutSession, StripeError> {
        let url = self.base_url.join("v1/checkout/sessions")?;

        let mut form: Vec<(&str, &str)> = vec![
            ("mode", "subscription"),
            ("line_items[0][price]", request.price_id),
            ("line_items[0][quantity]", "1"),
            ("payment_method_types[0]", "card"),
            ("locale", request.locale),
            ("success_url", request.success_url),
            ("cancel_url", request.cancel_url),
            ("metadata[device_id]", request.device_id),
        ];
        if let Some(user_id) = request.user_id {
            form.push(("metadata[user_id]", user_id));
        }

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await?;

        let session: SessionObject = parse_json(response).await?;
        match session.url {
            Some(url) => Ok(CheckoutSession { id: session.id, url }),
            None => Err(StripeError::MissingUrl(session.id)),
        }
    }
}

/// Parameters for creating a Checkout Session.
pub struct CheckoutSessionRequest<'a> {
    pub price_id: &'a str,
    pub device_id: &'a str,
    pub user_id: Option<&'a str>,
    pub success_url: &'a str,
    pub cancel_url: &'a str,
    pub locale: &'a str,
}

/// Checkout Session that carries a hosted payment page.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

/// Subset of the Checkout Session object returned by Stripe.
#[derive(Debug, Deserialize)]
struct SessionObject {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

/// Errors produced by the Stripe client.
#[derive(Debug, Error)]
pub enum StripeError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("stripe returned {status}: {message}")]
    Api { status: StatusCode, message: String },
    #[error("checkout session {0} has no hosted url")]
    MissingUrl(String),
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: Option<String>,
}

async fn parse_json<T>(response: Response) -> Result<T, StripeError>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        let message = serde_json::from_str::<ApiErrorEnvelope>(&body)
            .ok()
            .and_then(|envelope| envelope.error.message)
            .unwrap_or(body);
        return Err(StripeError::Api { status, message });
    }

    Ok(response.json().await?)
}
