pub mod checkout;

pub use checkout::{CheckoutSession, CheckoutSessionRequest, StripeClient, StripeError};
