use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Verified event envelope as delivered by the payment provider.
///
/// Only the fields needed for classification are modelled; everything else in
/// the envelope is ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub livemode: Option<bool>,
    #[serde(default)]
    pub data: ProviderEventData,
}

/// The `data` block of a provider event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProviderEventData {
    #[serde(default)]
    pub object: Value,
}

/// Typed billing event produced by the classifier.
#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    EntitlementGranted(GrantEvent),
    InvoicePaid(InvoiceDetails),
    InvoiceFailed(InvoiceDetails),
    Ignored { event_id: String, event_type: String },
}

impl BillingEvent {
    /// Short label used for metrics and structured logs.
    pub fn metric_kind(&self) -> &'static str {
        match self {
            Self::EntitlementGranted(_) => "entitlement_granted",
            Self::InvoicePaid(_) => "invoice_paid",
            Self::InvoiceFailed(_) => "invoice_failed",
            Self::Ignored { .. } => "ignored",
        }
    }
}

/// A completed checkout that grants an entitlement.
#[derive(Debug, Clone, PartialEq)]
pub struct GrantEvent {
    pub event_id: String,
    pub session_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Invoice level payment details shared by paid and failed invoice events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoiceDetails {
    pub event_id: String,
    pub customer_email: Option<String>,
    pub amount_paid: Option<i64>,
    pub amount_due: Option<i64>,
    pub currency: Option<String>,
    pub failure_message: Option<String>,
}

/// Outcome recorded in the payment ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Paid,
    Failed,
}

impl PaymentOutcome {
    /// Returns the canonical database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "paid" => Some(Self::Paid),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Subject an entitlement is keyed by.
///
/// An account identifier takes precedence; a device-only subject is used when
/// the checkout carried no account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    Account {
        account_id: String,
        device_id: Option<String>,
    },
    Device {
        device_id: String,
    },
}

impl Subject {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::Account { device_id, .. } => device_id.as_deref(),
            Self::Device { device_id } => Some(device_id),
        }
    }

    pub fn account_id(&self) -> Option<&str> {
        match self {
            Self::Account { account_id, .. } => Some(account_id),
            Self::Device { .. } => None,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Account {
                account_id,
                device_id: Some(device_id),
            } => write!(f, "account:{account_id} (device:{device_id})"),
            Self::Account { account_id, .. } => write!(f, "account:{account_id}"),
            Self::Device { device_id } => write!(f, "device:{device_id}"),
        }
    }
}

/// Plan tier granted by an entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Annual,
}

impl Plan {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Annual => "annual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "annual" => Some(Self::Annual),
            _ => None,
        }
    }
}

/// Persisted entitlement state for a subject.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entitlement {
    pub id: String,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub plan: Plan,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entitlement {
    /// An entitlement is valid while `now < expires_at`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}
