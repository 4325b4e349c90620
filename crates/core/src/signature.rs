use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::types::ProviderEvent;

/// Name of the header carrying the provider signature.
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Errors raised while authenticating a webhook delivery.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("missing signature header or webhook secret")]
    MissingCredentials,
    #[error("invalid signature: {0}")]
    InvalidSignature(&'static str),
    #[error("signed payload is not a valid event: {0}")]
    InvalidPayload(#[source] serde_json::Error),
}

impl SignatureError {
    /// Short label used for metrics.
    pub fn metric_reason(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "missing_credentials",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::InvalidPayload(_) => "invalid_payload",
        }
    }
}

/// Verifies `Stripe-Signature` headers (`t=<unix>,v1=<hex>`) over the raw body.
///
/// The signed payload is `"{t}.{body}"` and the MAC is HMAC-SHA256 keyed with
/// the webhook signing secret. Deliveries whose timestamp is further than the
/// tolerance from `now`, in either direction, are rejected.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<Arc<[u8]>>,
    tolerance_secs: i64,
}

impl SignatureVerifier {
    pub fn new(secret: Option<&str>, tolerance_secs: u64) -> Self {
        let secret = secret
            .filter(|value| !value.is_empty())
            .map(|value| Arc::from(value.as_bytes().to_vec().into_boxed_slice()));
        Self {
            secret,
            tolerance_secs: i64::try_from(tolerance_secs).unwrap_or(i64::MAX),
        }
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    /// Authenticates `body` and parses it into a [`ProviderEvent`].
    pub fn verify(
        &self,
        body: &[u8],
        header: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ProviderEvent, SignatureError> {
        let secret = self.secret.as_ref().ok_or(SignatureError::MissingCredentials)?;
        let header = header
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(SignatureError::MissingCredentials)?;

        let parsed = parse_header(header)?;
        let expected = compute_mac(secret, parsed.timestamp, body)?;

        let matched = parsed.signatures.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| bool::from(expected.as_slice().ct_eq(bytes.as_slice())))
                .unwrap_or(false)
        });
        if !matched {
            return Err(SignatureError::InvalidSignature("no matching v1 signature"));
        }

        let signed_at = DateTime::from_timestamp(parsed.timestamp, 0)
            .ok_or(SignatureError::InvalidSignature("timestamp out of range"))?;
        let skew = now.signed_duration_since(signed_at).num_seconds().abs();
        if skew > self.tolerance_secs {
            return Err(SignatureError::InvalidSignature(
                "timestamp outside the tolerance window",
            ));
        }

        serde_json::from_slice(body).map_err(SignatureError::InvalidPayload)
    }
}

/// Builds a header value for `body` signed at `timestamp`.
///
/// Used to produce deliveries for local replay and tests.
pub fn signature_header(secret: &[u8], timestamp: i64, body: &[u8]) -> String {
    let mac = compute_mac(secret, timestamp, body).unwrap_or_default();
    format!("t={timestamp},v1={}", hex::encode(mac))
}

struct ParsedHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Result<ParsedHeader<'_>, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        match key.trim() {
            "t" => {
                let parsed = value
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| SignatureError::InvalidSignature("timestamp is not numeric"))?;
                timestamp = Some(parsed);
            }
            "v1" => signatures.push(value.trim()),
            _ => {}
        }
    }

    let timestamp =
        timestamp.ok_or(SignatureError::InvalidSignature("missing timestamp in header"))?;
    if signatures.is_empty() {
        return Err(SignatureError::InvalidSignature("missing v1 signature in header"));
    }

    Ok(ParsedHeader {
        timestamp,
        signatures,
    })
}

fn compute_mac(secret: &[u8], timestamp: i64, body: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| SignatureError::InvalidSignature("failed to initialize verifier"))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac.finalize().into_bytes().to_vec())
}
