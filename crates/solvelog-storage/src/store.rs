//! Submission store: tracked-user directory, existence checks and batched upserts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use solvelog_core::{RecordKey, SubmissionRecord, Username};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

const INSERT_HEAD: &str = "INSERT INTO submissions \
    (username, problem_id, submission_id, problem_url, submitted_at, memory_used, time_spent) ";

const UPSERT_TAIL: &str = " ON CONFLICT (username, problem_id) DO UPDATE SET \
    submission_id = EXCLUDED.submission_id, \
    problem_url = EXCLUDED.problem_url, \
    submitted_at = EXCLUDED.submitted_at, \
    memory_used = EXCLUDED.memory_used, \
    time_spent = EXCLUDED.time_spent, \
    updated_at = NOW()";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable while {operation}: {message}")]
    Unavailable {
        operation: &'static str,
        message: String,
    },
    #[error("applying migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn unavailable(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            operation,
            message: err.to_string(),
        }
    }
}

/// Outcome of a batched write. Item failures never fail the whole call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub written: usize,
    pub failed: Vec<RecordKey>,
}

impl SaveReport {
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn list_tracked_users(&self) -> Result<Vec<Username>, StoreError>;
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn exists(&self, username: &str, problem_id: &str) -> Result<bool, StoreError>;

    /// Upserts keyed by `(username, problem_id)`; a repeated key overwrites.
    async fn save_all(&self, records: &[SubmissionRecord]) -> SaveReport;
}

/// Keeps the last record per key, in first-seen key order.
pub fn collapse_by_key(records: &[SubmissionRecord]) -> Vec<SubmissionRecord> {
    let mut slots: HashMap<RecordKey, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<SubmissionRecord> = Vec::with_capacity(records.len());
    for record in records {
        match slots.get(&record.key()) {
            Some(&idx) => out[idx] = record.clone(),
            None => {
                slots.insert(record.key(), out.len());
                out.push(record.clone());
            }
        }
    }
    out
}

/// What to conclude when the existence check itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupFailurePolicy {
    /// Treat the candidate as new. Risks an overwrite, never drops data.
    #[default]
    FailOpen,
    /// Treat the candidate as already stored and skip it.
    FailClosed,
}

impl FromStr for DedupFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" | "fail-open" | "fail_open" => Ok(Self::FailOpen),
            "closed" | "fail-closed" | "fail_closed" => Ok(Self::FailClosed),
            other => Err(format!("unknown dedup failure policy `{other}` (expected open|closed)")),
        }
    }
}

/// Cross-run dedup guard over the store's existence check.
#[derive(Clone)]
pub struct DuplicateFilter {
    store: Arc<dyn SubmissionStore>,
    policy: DedupFailurePolicy,
}

impl DuplicateFilter {
    pub fn new(store: Arc<dyn SubmissionStore>, policy: DedupFailurePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> DedupFailurePolicy {
        self.policy
    }

    pub async fn exists(&self, username: &str, problem_id: &str) -> bool {
        match self.store.exists(username, problem_id).await {
            Ok(found) => found,
            Err(err) => {
                let assume_duplicate = self.policy == DedupFailurePolicy::FailClosed;
                warn!(
                    username,
                    problem_id,
                    error = %err,
                    assume_duplicate,
                    "duplicate check failed"
                );
                assume_duplicate
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WritePolicy {
    pub batch_size: usize,
    pub item_attempts: usize,
    pub retry_delay: Duration,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            batch_size: 25,
            item_attempts: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Statement-level writes driven by [`save_in_batches`].
#[async_trait]
pub trait RecordWriter: Send + Sync {
    type Error: std::fmt::Display + Send;

    async fn write_batch(&self, chunk: &[SubmissionRecord]) -> Result<(), Self::Error>;

    async fn write_one(&self, record: &SubmissionRecord) -> Result<(), Self::Error>;
}

/// Collapses repeated keys, then writes chunk by chunk. A rejected chunk is
/// retried item by item; items that exhaust their attempts end up in `failed`.
pub async fn save_in_batches<W>(writer: &W, records: &[SubmissionRecord], policy: &WritePolicy) -> SaveReport
where
    W: RecordWriter + ?Sized,
{
    let records = collapse_by_key(records);
    let mut report = SaveReport::default();

    for chunk in records.chunks(policy.batch_size.max(1)) {
        match writer.write_batch(chunk).await {
            Ok(()) => report.written += chunk.len(),
            Err(err) => {
                warn!(
                    batch_len = chunk.len(),
                    error = %err,
                    "batch write failed; falling back to item writes"
                );
                for record in chunk {
                    if write_one_with_retries(writer, record, policy).await {
                        report.written += 1;
                    } else {
                        report.failed.push(record.key());
                    }
                }
            }
        }
    }

    info!(
        written = report.written,
        failed = report.failed_count(),
        "saved submissions"
    );
    report
}

async fn write_one_with_retries<W>(writer: &W, record: &SubmissionRecord, policy: &WritePolicy) -> bool
where
    W: RecordWriter + ?Sized,
{
    let attempts = policy.item_attempts.max(1);
    for attempt in 1..=attempts {
        match writer.write_one(record).await {
            Ok(()) => return true,
            Err(err) if attempt < attempts => {
                warn!(
                    username = %record.username,
                    problem_id = %record.problem_id,
                    attempt,
                    error = %err,
                    "item write failed; retrying"
                );
                tokio::time::sleep(policy.retry_delay).await;
            }
            Err(err) => {
                warn!(
                    username = %record.username,
                    problem_id = %record.problem_id,
                    error = %err,
                    "item write failed after retries"
                );
            }
        }
    }
    false
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    write: WritePolicy,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::unavailable("connecting", e))?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            write: WritePolicy::default(),
        }
    }

    pub fn with_write_policy(mut self, write: WritePolicy) -> Self {
        self.write = write;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordWriter for PgStore {
    type Error = sqlx::Error;

    async fn write_batch(&self, chunk: &[SubmissionRecord]) -> Result<(), sqlx::Error> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(INSERT_HEAD);
        builder.push_values(chunk, |mut row, record| {
            row.push_bind(record.username.as_str())
                .push_bind(record.problem_id.as_str())
                .push_bind(record.submission_id.as_str())
                .push_bind(record.problem_url.as_str())
                .push_bind(record.submitted_at)
                .push_bind(record.memory_used.as_str())
                .push_bind(record.time_spent.as_str());
        });
        builder.push(UPSERT_TAIL);
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn write_one(&self, record: &SubmissionRecord) -> Result<(), sqlx::Error> {
        let sql = format!("{INSERT_HEAD}VALUES ($1, $2, $3, $4, $5, $6, $7){UPSERT_TAIL}");
        sqlx::query(&sql)
            .bind(&record.username)
            .bind(&record.problem_id)
            .bind(&record.submission_id)
            .bind(&record.problem_url)
            .bind(record.submitted_at)
            .bind(&record.memory_used)
            .bind(&record.time_spent)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for PgStore {
    async fn list_tracked_users(&self) -> Result<Vec<Username>, StoreError> {
        sqlx::query_scalar::<_, String>("SELECT username FROM tracked_users ORDER BY username")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::unavailable("listing tracked users", e))
    }
}

#[async_trait]
impl SubmissionStore for PgStore {
    async fn exists(&self, username: &str, problem_id: &str) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                  FROM submissions
                 WHERE username = $1
                   AND problem_id = $2
            )
            "#,
        )
        .bind(username)
        .bind(problem_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::unavailable("checking submission existence", e))
    }

    async fn save_all(&self, records: &[SubmissionRecord]) -> SaveReport {
        save_in_batches(self, records, &self.write).await
    }
}

/// Injected failures for [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryFaults {
    pub directory_unavailable: bool,
    pub lookups_unavailable: bool,
    pub rejected_writes: HashSet<RecordKey>,
}

/// In-process store with the same upsert semantics as [`PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: Mutex<Vec<Username>>,
    records: Mutex<BTreeMap<RecordKey, SubmissionRecord>>,
    faults: Mutex<MemoryFaults>,
    lookups: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Username>,
    {
        Self {
            users: Mutex::new(users.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub async fn insert_existing(&self, record: SubmissionRecord) {
        self.records.lock().await.insert(record.key(), record);
    }

    pub async fn set_faults(&self, faults: MemoryFaults) {
        *self.faults.lock().await = faults;
    }

    pub async fn records(&self) -> Vec<SubmissionRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    /// Number of existence checks served so far.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn list_tracked_users(&self) -> Result<Vec<Username>, StoreError> {
        if self.faults.lock().await.directory_unavailable {
            return Err(StoreError::unavailable("listing tracked users", "injected fault"));
        }
        Ok(self.users.lock().await.clone())
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn exists(&self, username: &str, problem_id: &str) -> Result<bool, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.faults.lock().await.lookups_unavailable {
            return Err(StoreError::unavailable(
                "checking submission existence",
                "injected fault",
            ));
        }
        let key = RecordKey::new(username, problem_id);
        Ok(self.records.lock().await.contains_key(&key))
    }

    async fn save_all(&self, records: &[SubmissionRecord]) -> SaveReport {
        let rejected = self.faults.lock().await.rejected_writes.clone();
        let mut stored = self.records.lock().await;
        let mut report = SaveReport::default();
        for record in collapse_by_key(records) {
            let key = record.key();
            if rejected.contains(&key) {
                warn!(username = %key.username, problem_id = %key.problem_id, "item write rejected");
                report.failed.push(key);
                continue;
            }
            stored.insert(key, record);
            report.written += 1;
        }
        report
    }
}
