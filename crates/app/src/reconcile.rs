use chrono::{DateTime, Utc};
use metrics::counter;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use license_sync_core::{Entitlement, RenewalPolicy, Subject};
use license_sync_storage::{Database, EntitlementError, EntitlementGrant};

use crate::router::Clock;

/// Applies grant events to persisted entitlement state.
#[derive(Clone)]
pub struct EntitlementReconciler {
    database: Database,
    policy: RenewalPolicy,
    clock: Clock,
}

impl EntitlementReconciler {
    pub fn new(database: Database, policy: RenewalPolicy, clock: Clock) -> Self {
        Self {
            database,
            policy,
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Creates or renews exactly one entitlement row for `subject`.
    ///
    /// The grant time is the processing time, so the new expiry is a reset to
    /// one renewal period from now rather than an extension of the old expiry.
    pub async fn reconcile(
        &self,
        subject: &Subject,
        event_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let granted_at = self.now();
        let notes = self.policy.notes(event_id);
        let grant = EntitlementGrant {
            device_id: subject.device_id(),
            expires_at: self.policy.expires_at(granted_at),
            plan: self.policy.plan(),
            notes: &notes,
            granted_at,
        };
        let repo = self.database.entitlements();

        let (path, entitlement) = match subject {
            Subject::Account { account_id, .. } => {
                let entitlement = repo.upsert_for_account(account_id, &grant).await?;
                (ReconcilePath::Account, entitlement)
            }
            Subject::Device { device_id } => match repo.find_latest_by_device(device_id).await? {
                Some(existing) => {
                    let entitlement = repo.renew(&existing.id, &grant).await?;
                    (ReconcilePath::DeviceRenewed, entitlement)
                }
                None => {
                    let synthetic_account = Uuid::new_v4().to_string();
                    let entitlement = repo.insert(&synthetic_account, &grant).await?;
                    (ReconcilePath::DeviceCreated, entitlement)
                }
            },
        };

        counter!("entitlement_grants_total", "path" => path.metric_label()).increment(1);
        info!(
            stage = "reconcile",
            %event_id,
            %subject,
            path = path.metric_label(),
            account_id = %entitlement.account_id,
            expires_at = %entitlement.expires_at.to_rfc3339(),
            "entitlement reconciled"
        );

        Ok(ReconcileOutcome { path, entitlement })
    }
}

/// Which write path a grant took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilePath {
    Account,
    DeviceRenewed,
    DeviceCreated,
}

impl ReconcilePath {
    pub fn metric_label(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::DeviceRenewed => "device_renewed",
            Self::DeviceCreated => "device_created",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub path: ReconcilePath,
    pub entitlement: Entitlement,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to persist entitlement: {0}")]
    Persistence(#[from] EntitlementError),
}
