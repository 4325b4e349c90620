use chrono::{DateTime, Months, Utc};

use crate::types::Plan;

/// Fixed renewal policy applied to every grant event.
///
/// Each grant resets the expiry to twelve calendar months after the grant
/// time; it never accumulates on top of a previous expiry. Dates that do not
/// exist in the target year (Feb 29) clamp to the last day of the month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalPolicy {
    plan: Plan,
    months: u32,
}

impl RenewalPolicy {
    pub const fn annual() -> Self {
        Self {
            plan: Plan::Annual,
            months: 12,
        }
    }

    pub fn plan(&self) -> Plan {
        self.plan
    }

    pub fn expires_at(&self, granted_at: DateTime<Utc>) -> DateTime<Utc> {
        granted_at
            .checked_add_months(Months::new(self.months))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Provenance note stored alongside the entitlement.
    pub fn notes(&self, event_id: &str) -> String {
        format!("stripe checkout.session.completed {event_id}")
    }
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self::annual()
    }
}
