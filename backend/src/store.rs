use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use shared::{InsertResult, OptionId, VoteRecord};
use sqlx::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(e) => match e {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => db.code().is_some_and(|code| {
                    // connection exceptions, admin shutdown, serialization failures and deadlocks
                    code.starts_with("08") || code.starts_with("57P") || code == "40001" || code == "40P01"
                }),
                _ => false,
            },
        }
    }
}

/// Append-only vote storage.
#[rocket::async_trait]
pub trait VoteStore: Send + Sync {
    /// Persists the vote unless a record with `delivery_id` already exists.
    async fn insert_vote_if_absent(
        &self,
        delivery_id: &str,
        option_id: &OptionId,
        voter_token: &str,
    ) -> Result<InsertResult, StoreError>;

    async fn count_by_option(&self) -> Result<HashMap<String, u64>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgVoteStore {
    pool: PgPool,
}

impl PgVoteStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[rocket::async_trait]
impl VoteStore for PgVoteStore {
    async fn insert_vote_if_absent(
        &self,
        delivery_id: &str,
        option_id: &OptionId,
        voter_token: &str,
    ) -> Result<InsertResult, StoreError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "INSERT INTO votes.vote_records (delivery_id, option_id, voter_token)
             VALUES ($1, $2, $3)
             ON CONFLICT (delivery_id) DO NOTHING",
        )
        .bind(delivery_id)
        .bind(option_id.as_str())
        .bind(voter_token)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(InsertResult { inserted: result.rows_affected() == 1 })
    }

    async fn count_by_option(&self) -> Result<HashMap<String, u64>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT option_id, COUNT(*) FROM votes.vote_records GROUP BY option_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(option, count)| (option, count.max(0) as u64))
            .collect())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<VoteRecord>,
    delivered: HashSet<String>,
}

/// In-process store with fault injection, used by tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryVoteStore {
    state: Mutex<MemoryState>,
    failing_writes: AtomicU32,
    refused_writes: AtomicU32,
    failing_reads: AtomicU32,
    write_attempts: AtomicU32,
}

impl InMemoryVoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` writes fail as if the connection were refused.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// The next `n` writes fail with a non-transient database error.
    pub fn refuse_next_writes(&self, n: u32) {
        self.refused_writes.store(n, Ordering::SeqCst);
    }

    /// The next `n` count queries fail as if the connection were refused.
    pub fn fail_next_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    pub fn write_attempts(&self) -> u32 {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<VoteRecord> {
        self.state
            .lock()
            .map(|state| state.records.clone())
            .unwrap_or_default()
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }
}

#[rocket::async_trait]
impl VoteStore for InMemoryVoteStore {
    async fn insert_vote_if_absent(
        &self,
        delivery_id: &str,
        option_id: &OptionId,
        voter_token: &str,
    ) -> Result<InsertResult, StoreError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take_fault(&self.failing_writes) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        if Self::take_fault(&self.refused_writes) {
            return Err(StoreError::Database(sqlx::Error::RowNotFound));
        }

        let mut state = self.lock()?;
        if !state.delivered.insert(delivery_id.to_string()) {
            debug!(delivery_id, "Record already present");
            return Ok(InsertResult { inserted: false });
        }

        let id = state.records.len() as i64 + 1;
        state.records.push(VoteRecord {
            id,
            delivery_id: delivery_id.to_string(),
            option_id: option_id.to_string(),
            voter_token: voter_token.to_string(),
            accepted_at: OffsetDateTime::now_utc(),
        });
        Ok(InsertResult { inserted: true })
    }

    async fn count_by_option(&self) -> Result<HashMap<String, u64>, StoreError> {
        if Self::take_fault(&self.failing_reads) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }

        let state = self.lock()?;
        let mut counts = HashMap::new();
        for record in &state.records {
            *counts.entry(record.option_id.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
