//! Ledger Store contract.
//!
//! The store owns all persisted state. Every record carries a version that starts at 1
//! and increases on each write; commits validate the versions observed at read time so
//! the Mutator can detect read-write and write-write conflicts optimistically.

mod memory;
mod postgres;

pub use memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;

use crate::error::{RewardsError, RewardsResult};
use crate::types::{Account, Mission, PointsTransaction, Redemption, Voucher};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Name of the unique index over redemption codes.
pub const REDEMPTION_CODE_INDEX: &str = "redemption_code";

pub type StoreResult<T> = Result<T, StoreError>;

/// Store-layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict: {0}")]
    Conflict(String),

    #[error("unique index '{index}' already holds '{value}'")]
    Duplicate { index: String, value: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for RewardsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(detail) => RewardsError::Conflict(detail),
            StoreError::Duplicate { index, value } => {
                RewardsError::UniqueViolation { index, value }
            }
            other => RewardsError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Account,
    Mission,
    Voucher,
    Redemption,
    Transaction,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Mission => "mission",
            Self::Voucher => "voucher",
            Self::Redemption => "redemption",
            Self::Transaction => "transaction",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub kind: RecordKind,
    pub id: String,
}

impl RecordKey {
    pub fn new(kind: RecordKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn account(id: impl Into<String>) -> Self {
        Self::new(RecordKind::Account, id)
    }

    pub fn mission(id: impl Into<String>) -> Self {
        Self::new(RecordKind::Mission, id)
    }

    pub fn voucher(id: impl Into<String>) -> Self {
        Self::new(RecordKind::Voucher, id)
    }

    pub fn redemption(id: impl Into<String>) -> Self {
        Self::new(RecordKind::Redemption, id)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.id)
    }
}

/// Any persisted ledger record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Record {
    Account(Account),
    Mission(Mission),
    Voucher(Voucher),
    Redemption(Redemption),
    Transaction(PointsTransaction),
}

impl Record {
    pub fn key(&self) -> RecordKey {
        match self {
            Self::Account(a) => RecordKey::account(&a.account_id),
            Self::Mission(m) => RecordKey::mission(&m.mission_id),
            Self::Voucher(v) => RecordKey::voucher(&v.voucher_id),
            Self::Redemption(r) => RecordKey::redemption(&r.redemption_id),
            Self::Transaction(t) => RecordKey::new(RecordKind::Transaction, &t.transaction_id),
        }
    }

    /// Value held in a unique secondary index, if this record participates in one.
    pub fn unique_key(&self) -> Option<(&'static str, String)> {
        match self {
            Self::Redemption(r) => Some((REDEMPTION_CODE_INDEX, r.redemption_code.clone())),
            _ => None,
        }
    }
}

/// A record paired with its store version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub record: Record,
}

/// Expected pre-state of a written key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    Absent,
    Version(u64),
}

#[derive(Debug, Clone)]
pub struct Write {
    pub record: Record,
    pub expected: Expectation,
}

/// Atomic batch: observed read versions plus the writes to apply.
#[derive(Debug, Clone, Default)]
pub struct CommitRequest {
    pub reads: Vec<(RecordKey, Option<u64>)>,
    pub writes: Vec<Write>,
}

/// Consistent view of a declared read set.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: BTreeMap<RecordKey, Option<Versioned>>,
}

impl Snapshot {
    pub fn new(entries: BTreeMap<RecordKey, Option<Versioned>>) -> Self {
        Self { entries }
    }

    pub fn get(&self, key: &RecordKey) -> Option<&Versioned> {
        self.entries.get(key).and_then(Option::as_ref)
    }

    /// Version observed for a key in the read set; `None` if the key was not read.
    pub fn observed_version(&self, key: &RecordKey) -> Option<Option<u64>> {
        self.entries
            .get(key)
            .map(|entry| entry.as_ref().map(|v| v.version))
    }

    pub fn observed_versions(&self) -> Vec<(RecordKey, Option<u64>)> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.as_ref().map(|v| v.version)))
            .collect()
    }

    pub fn account(&self, id: &str) -> Option<&Account> {
        match self.get(&RecordKey::account(id)).map(|v| &v.record) {
            Some(Record::Account(account)) => Some(account),
            _ => None,
        }
    }

    pub fn mission(&self, id: &str) -> Option<&Mission> {
        match self.get(&RecordKey::mission(id)).map(|v| &v.record) {
            Some(Record::Mission(mission)) => Some(mission),
            _ => None,
        }
    }

    pub fn voucher(&self, id: &str) -> Option<&Voucher> {
        match self.get(&RecordKey::voucher(id)).map(|v| &v.record) {
            Some(Record::Voucher(voucher)) => Some(voucher),
            _ => None,
        }
    }

    pub fn redemption(&self, id: &str) -> Option<&Redemption> {
        match self.get(&RecordKey::redemption(id)).map(|v| &v.record) {
            Some(Record::Redemption(redemption)) => Some(redemption),
            _ => None,
        }
    }
}

/// Durable keyed storage with atomic multi-record read-modify-write.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    /// Read every key at one consistent point in time.
    async fn read(&self, keys: &[RecordKey]) -> StoreResult<Snapshot>;

    /// Apply all writes atomically, or none if any observed version moved.
    async fn commit(&self, request: CommitRequest) -> StoreResult<()>;

    /// Single-record conditional write. Returns the new version.
    async fn compare_and_swap(&self, record: Record, expected_version: u64) -> StoreResult<u64>;

    /// All records of one kind, unordered.
    async fn scan(&self, kind: RecordKind) -> StoreResult<Vec<Versioned>>;

    async fn get(&self, key: &RecordKey) -> StoreResult<Option<Versioned>> {
        let snapshot = self.read(std::slice::from_ref(key)).await?;
        Ok(snapshot.get(key).cloned())
    }
}

/// Outcome of a single-record update closure.
pub enum SingleUpdate<T> {
    Write(Record, T),
    Skip(T),
}

/// Conditional single-record update with bounded re-evaluation on version races.
///
/// Used only for the narrow writes that live outside the Mutator: partner issuance,
/// mark-as-used and the expiry sweep.
pub async fn update_single<T, F>(
    store: &dyn LedgerStore,
    key: &RecordKey,
    max_attempts: u32,
    mut apply: F,
) -> RewardsResult<T>
where
    F: FnMut(&Record) -> RewardsResult<SingleUpdate<T>>,
{
    for _ in 0..max_attempts.max(1) {
        let current = store
            .get(key)
            .await?
            .ok_or_else(|| RewardsError::not_found(key.kind.as_str(), &key.id))?;

        match apply(&current.record)? {
            SingleUpdate::Skip(value) => return Ok(value),
            SingleUpdate::Write(record, value) => {
                match store.compare_and_swap(record, current.version).await {
                    Ok(_) => return Ok(value),
                    Err(StoreError::Conflict(detail)) => {
                        tracing::debug!(key = %key, %detail, "single-record update raced, re-reading");
                    }
                    Err(other) => return Err(other.into()),
                }
            }
        }
    }

    Err(RewardsError::Conflict(format!(
        "update of {key} exceeded {max_attempts} attempts"
    )))
}

/// Ledger persistence backend configuration.
#[derive(Debug, Clone, Default)]
pub enum LedgerStorageConfig {
    /// Keep all records in process memory only.
    #[default]
    Memory,
    /// Persist records in PostgreSQL.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl LedgerStorageConfig {
    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

/// Open the configured backend, creating schema where needed.
pub async fn open_store(config: &LedgerStorageConfig) -> RewardsResult<Arc<dyn LedgerStore>> {
    match config {
        LedgerStorageConfig::Memory => Ok(Arc::new(InMemoryLedgerStore::new())),
        LedgerStorageConfig::Postgres {
            database_url,
            max_connections,
        } => {
            let store = PostgresLedgerStore::connect(database_url, *max_connections).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Account, Role};
    use chrono::Utc;

    #[test]
    fn record_roundtrips_through_tagged_json() {
        let record = Record::Account(Account::new("u1", Role::Participant, Utc::now()));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value.get("kind"), Some(&serde_json::json!("account")));
        let back: Record = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn store_errors_map_into_taxonomy() {
        let err: RewardsError = StoreError::Conflict("account/u1".to_string()).into();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);

        let err: RewardsError = StoreError::Backend("down".to_string()).into();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }

    #[tokio::test]
    async fn update_single_rejects_missing_record() {
        let store = InMemoryLedgerStore::new();
        let err = update_single(&store, &RecordKey::redemption("nope"), 3, |record| {
            Ok(SingleUpdate::Write(record.clone(), ()))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
