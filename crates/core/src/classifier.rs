use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::types::{BillingEvent, GrantEvent, InvoiceDetails, ProviderEvent};

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const INVOICE_PAID: &str = "invoice.paid";
pub const INVOICE_PAYMENT_FAILED: &str = "invoice.payment_failed";

/// Errors raised when a recognized event carries a malformed object.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("malformed {event_type} object: {source}")]
    MalformedObject {
        event_type: &'static str,
        source: serde_json::Error,
    },
}

/// Maps a verified provider event onto a [`BillingEvent`].
///
/// Unknown fields are ignored and missing optional fields become `None`;
/// event types outside the recognized set are returned as
/// [`BillingEvent::Ignored`].
pub fn classify(event: &ProviderEvent) -> Result<BillingEvent, ClassifierError> {
    match event.event_type.as_str() {
        CHECKOUT_SESSION_COMPLETED => {
            let session: CheckoutSessionObject =
                decode(CHECKOUT_SESSION_COMPLETED, &event.data.object)?;
            Ok(BillingEvent::EntitlementGranted(GrantEvent {
                event_id: event.id.clone(),
                session_id: session.id,
                metadata: session.metadata.unwrap_or_default(),
            }))
        }
        INVOICE_PAID => {
            let invoice: InvoiceObject = decode(INVOICE_PAID, &event.data.object)?;
            Ok(BillingEvent::InvoicePaid(invoice.into_details(&event.id)))
        }
        INVOICE_PAYMENT_FAILED => {
            let invoice: InvoiceObject = decode(INVOICE_PAYMENT_FAILED, &event.data.object)?;
            Ok(BillingEvent::InvoiceFailed(invoice.into_details(&event.id)))
        }
        other => Ok(BillingEvent::Ignored {
            event_id: event.id.clone(),
            event_type: other.to_string(),
        }),
    }
}

fn decode<T>(event_type: &'static str, object: &Value) -> Result<T, ClassifierError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if object.is_null() {
        return Ok(T::default());
    }
    T::deserialize(object).map_err(|source| ClassifierError::MalformedObject { event_type, source })
}

#[derive(Debug, Default, Deserialize)]
struct CheckoutSessionObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct InvoiceObject {
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    customer_details: Option<CustomerDetails>,
    #[serde(default)]
    amount_paid: Option<i64>,
    #[serde(default)]
    amount_due: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    last_finalization_error: Option<FinalizationError>,
}

#[derive(Debug, Default, Deserialize)]
struct CustomerDetails {
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FinalizationError {
    #[serde(default)]
    message: Option<String>,
}

impl InvoiceObject {
    fn into_details(self, event_id: &str) -> InvoiceDetails {
        let customer_email = self
            .customer_email
            .or_else(|| self.customer_details.and_then(|details| details.email));
        InvoiceDetails {
            event_id: event_id.to_string(),
            customer_email,
            amount_paid: self.amount_paid,
            amount_due: self.amount_due,
            currency: self.currency,
            failure_message: self.last_finalization_error.and_then(|err| err.message),
        }
    }
}
