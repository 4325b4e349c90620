use thiserror::Error;

use crate::types::{GrantEvent, Subject};

pub const ACCOUNT_ID_KEY: &str = "user_id";
pub const DEVICE_ID_KEY: &str = "device_id";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("grant event carries neither user_id nor device_id metadata")]
    MissingIdentity,
}

/// Extracts the entitlement subject from a grant event's metadata.
///
/// Blank values count as absent; anything else is kept verbatim, since the
/// ids are keys written by the checkout flow. No identity is fabricated here.
pub fn resolve_subject(grant: &GrantEvent) -> Result<Subject, IdentityError> {
    let lookup = |key: &str| {
        grant
            .metadata
            .get(key)
            .filter(|value| !value.trim().is_empty())
            .cloned()
    };

    match (lookup(ACCOUNT_ID_KEY), lookup(DEVICE_ID_KEY)) {
        (Some(account_id), device_id) => Ok(Subject::Account {
            account_id,
            device_id,
        }),
        (None, Some(device_id)) => Ok(Subject::Device { device_id }),
        (None, None) => Err(IdentityError::MissingIdentity),
    }
}
