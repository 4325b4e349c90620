use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{error, info};

use license_sync_core::{InvoiceDetails, LedgerEntry, PaymentOutcome};
use license_sync_storage::Database;

use crate::router::Clock;

/// Best-effort writer for the append-only payment ledger.
///
/// Failures are logged and counted but never reach the caller, so an invoice
/// delivery is acknowledged even when the ledger write did not land.
#[derive(Clone)]
pub struct PaymentLedger {
    database: Database,
    clock: Clock,
}

impl PaymentLedger {
    pub fn new(database: Database, clock: Clock) -> Self {
        Self { database, clock }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Appends one ledger row; returns the new row id when the write succeeded.
    pub async fn record(&self, outcome: PaymentOutcome, invoice: &InvoiceDetails) -> Option<String> {
        let entry = LedgerEntry::from_invoice(outcome, invoice);
        match self
            .database
            .payment_events()
            .append(&entry, self.now())
            .await
        {
            Ok(id) => {
                counter!("payment_ledger_writes_total", "result" => "ok").increment(1);
                info!(
                    stage = "ledger",
                    event_id = %entry.provider_event_id,
                    outcome = outcome.as_str(),
                    amount_cents = entry.amount_cents,
                    currency = %entry.currency,
                    "payment event recorded"
                );
                Some(id)
            }
            Err(err) => {
                counter!("payment_ledger_writes_total", "result" => "error").increment(1);
                error!(
                    stage = "ledger",
                    event_id = %entry.provider_event_id,
                    outcome = outcome.as_str(),
                    error = %err,
                    "failed to record payment event"
                );
                None
            }
        }
    }
}
