use crate::types::{InvoiceDetails, PaymentOutcome};

pub const DEFAULT_CURRENCY: &str = "eur";
pub const DEFAULT_FAILURE_REASON: &str = "payment_failed";

/// Row appended to the payment ledger for a single invoice event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub provider_event_id: String,
    pub outcome: PaymentOutcome,
    pub subject_email: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub failure_reason: Option<String>,
}

impl LedgerEntry {
    /// Derives the ledger row for an invoice outcome.
    ///
    /// Paid invoices record the amount actually paid, falling back to the
    /// amount due; failed invoices record the amount due.
    pub fn from_invoice(outcome: PaymentOutcome, invoice: &InvoiceDetails) -> Self {
        let (amount_cents, failure_reason) = match outcome {
            PaymentOutcome::Paid => (invoice.amount_paid.or(invoice.amount_due).unwrap_or(0), None),
            PaymentOutcome::Failed => (
                invoice.amount_due.unwrap_or(0),
                Some(
                    invoice
                        .failure_message
                        .clone()
                        .unwrap_or_else(|| DEFAULT_FAILURE_REASON.to_string()),
                ),
            ),
        };

        Self {
            provider_event_id: invoice.event_id.clone(),
            outcome,
            subject_email: invoice.customer_email.clone(),
            amount_cents,
            currency: invoice
                .currency
                .clone()
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            failure_reason,
        }
    }
}
