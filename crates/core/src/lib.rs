//! Domain logic for reconciling subscription entitlements with billing events.
//!
//! Everything in this crate is pure: callers supply the clock, the raw bytes,
//! and the secrets, and receive typed values back. Persistence and HTTP live in
//! the storage and app crates.
pub mod classifier;
pub mod identity;
pub mod ledger;
pub mod policy;
pub mod signature;
pub mod types;

pub use classifier::{classify, ClassifierError};
pub use identity::{resolve_subject, IdentityError};
pub use ledger::LedgerEntry;
pub use policy::RenewalPolicy;
pub use signature::{SignatureError, SignatureVerifier};
pub use types::{
    BillingEvent, Entitlement, GrantEvent, InvoiceDetails, PaymentOutcome, Plan, ProviderEvent,
    Subject,
};
