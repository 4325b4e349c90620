use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use thiserror::Error;
use uuid::Uuid;

use license_sync_core::{Entitlement, LedgerEntry, PaymentOutcome, Plan};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// Every pooled connection runs with foreign keys on, WAL journaling and a
    /// busy timeout. Acquiring a connection is bounded so a saturated pool
    /// surfaces as an error instead of hanging the request.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the entitlements table.
    pub fn entitlements(&self) -> EntitlementRepository {
        EntitlementRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the append-only payment ledger.
    pub fn payment_events(&self) -> PaymentEventRepository {
        PaymentEventRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Values written by a grant, shared by every entitlement write path.
#[derive(Debug, Clone)]
pub struct EntitlementGrant<'a> {
    pub device_id: Option<&'a str>,
    pub expires_at: DateTime<Utc>,
    pub plan: Plan,
    pub notes: &'a str,
    pub granted_at: DateTime<Utc>,
}

/// Repository responsible for the `entitlements` table.
///
/// `expires_at` is only ever raised by these writes; a grant carrying an
/// earlier expiry than the stored one leaves the expiry untouched.
#[derive(Clone)]
pub struct EntitlementRepository {
    pool: SqlitePool,
}

const ENTITLEMENT_COLUMNS: &str =
    "id, account_id, device_id, expires_at, plan, notes, created_at, updated_at";

impl EntitlementRepository {
    /// Inserts or updates the entitlement keyed by `account_id` in one statement.
    ///
    /// Concurrent calls for the same account are serialized by the unique key,
    /// so duplicate deliveries never produce a second row. A grant without a
    /// device id keeps the device already on record.
    pub async fn upsert_for_account(
        &self,
        account_id: &str,
        grant: &EntitlementGrant<'_>,
    ) -> Result<Entitlement, EntitlementError> {
        let granted_at = to_rfc3339(grant.granted_at);
        let sql = format!(
            "INSERT INTO entitlements \
             (id, account_id, device_id, expires_at, plan, notes, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(account_id) DO UPDATE SET \
                 device_id = COALESCE(excluded.device_id, entitlements.device_id), \
                 expires_at = MAX(entitlements.expires_at, excluded.expires_at), \
                 plan = excluded.plan, \
                 notes = excluded.notes, \
                 updated_at = excluded.updated_at \
             RETURNING {ENTITLEMENT_COLUMNS}"
        );

        let row = sqlx::query_as::<_, EntitlementRow>(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(account_id)
            .bind(grant.device_id)
            .bind(to_rfc3339(grant.expires_at))
            .bind(grant.plan.as_str())
            .bind(grant.notes)
            .bind(&granted_at)
            .bind(&granted_at)
            .fetch_one(&self.pool)
            .await?;

        row.into_domain()
    }

    /// Returns the most recently updated entitlement recorded for `device_id`.
    ///
    /// Device ids carry no uniqueness constraint, so the lookup-then-write
    /// sequence used for device-only grants can race: two concurrent first
    /// grants for the same device may both miss here and insert two rows.
    /// Picking the latest row keeps reads deterministic when that happens.
    pub async fn find_latest_by_device(
        &self,
        device_id: &str,
    ) -> Result<Option<Entitlement>, EntitlementError> {
        let sql = format!(
            "SELECT {ENTITLEMENT_COLUMNS} FROM entitlements \
             WHERE device_id = ? \
             ORDER BY updated_at DESC, created_at DESC \
             LIMIT 1"
        );
        let row = sqlx::query_as::<_, EntitlementRow>(&sql)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(EntitlementRow::into_domain).transpose()
    }

    /// Loads the entitlement for an account.
    pub async fn fetch_by_account(
        &self,
        account_id: &str,
    ) -> Result<Option<Entitlement>, EntitlementError> {
        let sql = format!("SELECT {ENTITLEMENT_COLUMNS} FROM entitlements WHERE account_id = ?");
        let row = sqlx::query_as::<_, EntitlementRow>(&sql)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(EntitlementRow::into_domain).transpose()
    }

    /// Renews an existing row in place, leaving its keys untouched.
    pub async fn renew(
        &self,
        id: &str,
        grant: &EntitlementGrant<'_>,
    ) -> Result<Entitlement, EntitlementError> {
        let sql = format!(
            "UPDATE entitlements \
             SET expires_at = MAX(expires_at, ?), \
                 plan = ?, \
                 notes = ?, \
                 updated_at = ? \
             WHERE id = ? \
             RETURNING {ENTITLEMENT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, EntitlementRow>(&sql)
            .bind(to_rfc3339(grant.expires_at))
            .bind(grant.plan.as_str())
            .bind(grant.notes)
            .bind(to_rfc3339(grant.granted_at))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EntitlementError::NotFound)?;

        row.into_domain()
    }

    /// Inserts a fresh entitlement row.
    pub async fn insert(
        &self,
        account_id: &str,
        grant: &EntitlementGrant<'_>,
    ) -> Result<Entitlement, EntitlementError> {
        let granted_at = to_rfc3339(grant.granted_at);
        let sql = format!(
            "INSERT INTO entitlements \
             (id, account_id, device_id, expires_at, plan, notes, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {ENTITLEMENT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, EntitlementRow>(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(account_id)
            .bind(grant.device_id)
            .bind(to_rfc3339(grant.expires_at))
            .bind(grant.plan.as_str())
            .bind(grant.notes)
            .bind(&granted_at)
            .bind(&granted_at)
            .fetch_one(&self.pool)
            .await?;

        row.into_domain()
    }
}

/// Raw row of the `entitlements` table.
#[derive(Debug, sqlx::FromRow)]
pub struct EntitlementRow {
    pub id: String,
    pub account_id: String,
    pub device_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub plan: String,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntitlementRow {
    /// Converts the database row into a domain entitlement.
    pub fn into_domain(self) -> Result<Entitlement, EntitlementError> {
        let plan = Plan::parse(&self.plan).ok_or(EntitlementError::UnknownPlan(self.plan))?;
        Ok(Entitlement {
            id: self.id,
            account_id: self.account_id,
            device_id: self.device_id,
            expires_at: self.expires_at,
            plan,
            notes: self.notes,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Errors that can occur while reading or writing entitlements.
#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("entitlement row disappeared before it could be renewed")]
    NotFound,
    #[error("stored plan '{0}' is not recognized")]
    UnknownPlan(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the append-only `payment_events` ledger.
#[derive(Clone)]
pub struct PaymentEventRepository {
    pool: SqlitePool,
}

impl PaymentEventRepository {
    /// Appends one ledger row and returns its generated id.
    ///
    /// `provider_event_id` is stored for audit only; redelivered events append
    /// another row.
    pub async fn append(
        &self,
        entry: &LedgerEntry,
        recorded_at: DateTime<Utc>,
    ) -> Result<String, PaymentEventError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO payment_events \
             (id, provider_event_id, event_type, subject_email, amount_cents, currency, failure_reason, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&entry.provider_event_id)
        .bind(entry.outcome.as_str())
        .bind(&entry.subject_email)
        .bind(entry.amount_cents)
        .bind(&entry.currency)
        .bind(&entry.failure_reason)
        .bind(to_rfc3339(recorded_at))
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Lists ledger rows recorded for a provider event, oldest first.
    pub async fn list_for_provider_event(
        &self,
        provider_event_id: &str,
    ) -> Result<Vec<PaymentEventRecord>, PaymentEventError> {
        let rows = sqlx::query_as::<_, PaymentEventRow>(
            "SELECT id, provider_event_id, event_type, subject_email, amount_cents, currency, failure_reason, created_at \
             FROM payment_events \
             WHERE provider_event_id = ? \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(provider_event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PaymentEventRow::into_record).collect()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentEventRow {
    id: String,
    provider_event_id: String,
    event_type: String,
    subject_email: Option<String>,
    amount_cents: i64,
    currency: String,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl PaymentEventRow {
    fn into_record(self) -> Result<PaymentEventRecord, PaymentEventError> {
        let outcome = PaymentOutcome::parse(&self.event_type)
            .ok_or(PaymentEventError::UnknownOutcome(self.event_type))?;
        Ok(PaymentEventRecord {
            id: self.id,
            entry: LedgerEntry {
                provider_event_id: self.provider_event_id,
                outcome,
                subject_email: self.subject_email,
                amount_cents: self.amount_cents,
                currency: self.currency,
                failure_reason: self.failure_reason,
            },
            created_at: self.created_at,
        })
    }
}

/// Ledger row as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentEventRecord {
    pub id: String,
    pub entry: LedgerEntry,
    pub created_at: DateTime<Utc>,
}

/// Errors that can occur while appending to or reading the ledger.
#[derive(Debug, Error)]
pub enum PaymentEventError {
    #[error("stored event type '{0}' is not recognized")]
    UnknownOutcome(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn grant<'a>(device_id: Option<&'a str>, granted_at: DateTime<Utc>) -> EntitlementGrant<'a> {
        EntitlementGrant {
            device_id,
            expires_at: granted_at + Duration::days(365),
            plan: Plan::Annual,
            notes: "test grant",
            granted_at,
        }
    }

    async fn count_rows(db: &Database, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(db.pool())
            .await
            .expect("count")
    }

    #[tokio::test]
    async fn migrations_apply() {
        let db = setup_db().await;
        let tables: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('entitlements', 'payment_events')",
        )
        .fetch_one(db.pool())
        .await
        .expect("fetch tables");
        assert_eq!(tables.0, 2);
    }

    #[tokio::test]
    async fn upsert_for_account_is_idempotent() {
        let db = setup_db().await;
        let repo = db.entitlements();
        let now = at("2024-01-01T00:00:00Z");

        let first = repo
            .upsert_for_account("acct-1", &grant(Some("dev-1"), now))
            .await
            .expect("insert");
        let second = repo
            .upsert_for_account("acct-1", &grant(Some("dev-1"), now))
            .await
            .expect("update");

        assert_eq!(first.id, second.id);
        assert_eq!(second.expires_at, now + Duration::days(365));
        assert_eq!(count_rows(&db, "entitlements").await, 1);
    }

    #[tokio::test]
    async fn upsert_keeps_known_device_and_takes_latest() {
        let db = setup_db().await;
        let repo = db.entitlements();
        let now = at("2024-01-01T00:00:00Z");

        repo.upsert_for_account("acct-1", &grant(Some("dev-1"), now))
            .await
            .expect("insert");
        let kept = repo
            .upsert_for_account("acct-1", &grant(None, now + Duration::days(1)))
            .await
            .expect("update without device");
        assert_eq!(kept.device_id.as_deref(), Some("dev-1"));

        let moved = repo
            .upsert_for_account("acct-1", &grant(Some("dev-2"), now + Duration::days(2)))
            .await
            .expect("update with new device");
        assert_eq!(moved.device_id.as_deref(), Some("dev-2"));
        assert_eq!(moved.updated_at, now + Duration::days(2));
        assert_eq!(moved.created_at, now);
    }

    #[tokio::test]
    async fn expiry_never_moves_backwards() {
        let db = setup_db().await;
        let repo = db.entitlements();
        let later = at("2024-06-01T00:00:00Z");
        let earlier = at("2024-01-01T00:00:00Z");

        let stored = repo
            .upsert_for_account("acct-1", &grant(None, later))
            .await
            .expect("insert");
        let after = repo
            .upsert_for_account("acct-1", &grant(None, earlier))
            .await
            .expect("stale grant");
        assert_eq!(after.expires_at, stored.expires_at);

        let renewed = repo
            .renew(&stored.id, &grant(None, earlier))
            .await
            .expect("stale renew");
        assert_eq!(renewed.expires_at, stored.expires_at);
    }

    #[tokio::test]
    async fn device_lookup_then_renew_in_place() {
        let db = setup_db().await;
        let repo = db.entitlements();
        let now = at("2024-01-01T00:00:00Z");

        assert!(repo
            .find_latest_by_device("dev-9")
            .await
            .expect("lookup")
            .is_none());

        let inserted = repo
            .insert("synthetic-1", &grant(Some("dev-9"), now))
            .await
            .expect("insert");
        let found = repo
            .find_latest_by_device("dev-9")
            .await
            .expect("lookup")
            .expect("row present");
        assert_eq!(found.id, inserted.id);

        let renewed = repo
            .renew(&found.id, &grant(Some("dev-9"), now + Duration::days(30)))
            .await
            .expect("renew");
        assert_eq!(renewed.account_id, "synthetic-1");
        assert_eq!(renewed.expires_at, now + Duration::days(395));
        assert_eq!(count_rows(&db, "entitlements").await, 1);
    }

    #[tokio::test]
    async fn renew_missing_row_is_not_found() {
        let db = setup_db().await;
        let err = db
            .entitlements()
            .renew("missing", &grant(None, Utc::now()))
            .await
            .expect_err("no row");
        assert!(matches!(err, EntitlementError::NotFound));
    }

    #[tokio::test]
    async fn unknown_plan_is_reported() {
        let db = setup_db().await;
        sqlx::query(
            "INSERT INTO entitlements (id, account_id, device_id, expires_at, plan, notes, created_at, updated_at) \
             VALUES ('row-1', 'acct-x', NULL, '2025-01-01T00:00:00.000Z', 'lifetime', '', '2024-01-01T00:00:00.000Z', '2024-01-01T00:00:00.000Z')",
        )
        .execute(db.pool())
        .await
        .expect("seed");

        let err = db
            .entitlements()
            .fetch_by_account("acct-x")
            .await
            .expect_err("unknown plan");
        assert!(matches!(err, EntitlementError::UnknownPlan(plan) if plan == "lifetime"));
    }

    #[tokio::test]
    async fn concurrent_account_upserts_create_one_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("race.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        let now = at("2024-01-01T00:00:00Z");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let repo = db.entitlements();
            handles.push(tokio::spawn(async move {
                repo.upsert_for_account("acct-race", &grant(Some("dev-r"), now))
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("upsert");
        }

        assert_eq!(count_rows(&db, "entitlements").await, 1);
    }

    #[tokio::test]
    async fn ledger_appends_every_delivery() {
        let db = setup_db().await;
        let repo = db.payment_events();
        let entry = LedgerEntry {
            provider_event_id: "evt_1".to_string(),
            outcome: PaymentOutcome::Failed,
            subject_email: None,
            amount_cents: 990,
            currency: "eur".to_string(),
            failure_reason: Some("payment_failed".to_string()),
        };
        let now = at("2024-01-01T00:00:00Z");

        repo.append(&entry, now).await.expect("append");
        repo.append(&entry, now + Duration::seconds(1))
            .await
            .expect("append duplicate delivery");

        let rows = repo
            .list_for_provider_event("evt_1")
            .await
            .expect("list");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].entry, entry);
        assert_eq!(rows[0].created_at, now);
    }
}
