//! In-memory reference backend.
//!
//! Validation and application of a commit happen under one write lock, so a batch is
//! observed either entirely or not at all.

use super::{
    CommitRequest, Expectation, LedgerStore, Record, RecordKey, RecordKind, Snapshot,
    StoreError, StoreResult, Versioned,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

#[derive(Default)]
struct MemoryState {
    records: HashMap<RecordKey, Versioned>,
    unique: HashMap<(&'static str, String), RecordKey>,
}

impl MemoryState {
    fn version_of(&self, key: &RecordKey) -> Option<u64> {
        self.records.get(key).map(|v| v.version)
    }

    fn check_unique(&self, record: &Record, owner: &RecordKey) -> StoreResult<()> {
        if let Some((index, value)) = record.unique_key() {
            if let Some(holder) = self.unique.get(&(index, value.clone())) {
                if holder != owner {
                    return Err(StoreError::Duplicate {
                        index: index.to_string(),
                        value,
                    });
                }
            }
        }
        Ok(())
    }

    fn put(&mut self, record: Record, version: u64) {
        let key = record.key();
        if let Some(previous) = self.records.get(&key) {
            if let Some(old) = previous.record.unique_key() {
                self.unique.remove(&old);
            }
        }
        if let Some(unique) = record.unique_key() {
            self.unique.insert(unique, key.clone());
        }
        self.records.insert(key, Versioned { version, record });
    }
}

/// In-memory ledger store.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<MemoryState>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("ledger store lock poisoned".to_string())
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, keys: &[RecordKey]) -> StoreResult<Snapshot> {
        let guard = self.state.read().map_err(|_| poisoned())?;
        let entries = keys
            .iter()
            .map(|key| (key.clone(), guard.records.get(key).cloned()))
            .collect::<BTreeMap<_, _>>();
        Ok(Snapshot::new(entries))
    }

    async fn commit(&self, request: CommitRequest) -> StoreResult<()> {
        let mut guard = self.state.write().map_err(|_| poisoned())?;

        for (key, observed) in &request.reads {
            let current = guard.version_of(key);
            if current != *observed {
                return Err(StoreError::Conflict(format!(
                    "{key} moved from {observed:?} to {current:?}"
                )));
            }
        }

        let mut written = HashSet::new();
        let mut batch_unique = HashSet::new();
        for write in &request.writes {
            let key = write.record.key();
            if !written.insert(key.clone()) {
                return Err(StoreError::Backend(format!(
                    "commit writes {key} more than once"
                )));
            }

            let current = guard.version_of(&key);
            let matches = match write.expected {
                Expectation::Absent => current.is_none(),
                Expectation::Version(version) => current == Some(version),
            };
            if !matches {
                return Err(StoreError::Conflict(format!(
                    "{key} expected {:?}, found {current:?}",
                    write.expected
                )));
            }

            guard.check_unique(&write.record, &key)?;
            if let Some((index, value)) = write.record.unique_key() {
                if !batch_unique.insert((index, value.clone())) {
                    return Err(StoreError::Duplicate {
                        index: index.to_string(),
                        value,
                    });
                }
            }
        }

        for write in request.writes {
            let version = match write.expected {
                Expectation::Absent => 1,
                Expectation::Version(version) => version + 1,
            };
            guard.put(write.record, version);
        }

        Ok(())
    }

    async fn compare_and_swap(&self, record: Record, expected_version: u64) -> StoreResult<u64> {
        let mut guard = self.state.write().map_err(|_| poisoned())?;
        let key = record.key();
        let current = guard.version_of(&key);
        if current != Some(expected_version) {
            return Err(StoreError::Conflict(format!(
                "{key} expected version {expected_version}, found {current:?}"
            )));
        }
        guard.check_unique(&record, &key)?;

        let version = expected_version + 1;
        guard.put(record, version);
        Ok(version)
    }

    async fn scan(&self, kind: RecordKind) -> StoreResult<Vec<Versioned>> {
        let guard = self.state.read().map_err(|_| poisoned())?;
        Ok(guard
            .records
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .map(|(_, value)| value.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Write;
    use crate::types::{Account, Redemption, RedemptionStatus, Role};
    use chrono::{Duration, Utc};

    fn account(id: &str) -> Record {
        Record::Account(Account::new(id, Role::Participant, Utc::now()))
    }

    fn redemption(id: &str, code: &str) -> Record {
        let now = Utc::now();
        Record::Redemption(Redemption {
            redemption_id: id.to_string(),
            account_id: "u1".to_string(),
            voucher_id: "v1".to_string(),
            points_spent: 10,
            redemption_code: code.to_string(),
            status: RedemptionStatus::Pending,
            redeemed_at: now,
            expires_at: now + Duration::days(30),
            used_at: None,
            partner_reference: None,
            updated_at: now,
        })
    }

    fn insert(record: Record) -> CommitRequest {
        CommitRequest {
            reads: vec![],
            writes: vec![Write {
                record,
                expected: Expectation::Absent,
            }],
        }
    }

    #[tokio::test]
    async fn commit_rejects_stale_read_versions() {
        let store = InMemoryLedgerStore::new();
        store.commit(insert(account("u1"))).await.unwrap();

        let key = RecordKey::account("u1");
        let snapshot = store.read(std::slice::from_ref(&key)).await.unwrap();
        let observed = snapshot.observed_versions();

        // A concurrent writer bumps the version.
        store.compare_and_swap(account("u1"), 1).await.unwrap();

        let err = store
            .commit(CommitRequest {
                reads: observed,
                writes: vec![Write {
                    record: account("u1"),
                    expected: Expectation::Version(1),
                }],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.get(&key).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn failed_commit_applies_nothing() {
        let store = InMemoryLedgerStore::new();
        store.commit(insert(account("u1"))).await.unwrap();

        let err = store
            .commit(CommitRequest {
                reads: vec![],
                writes: vec![
                    Write {
                        record: account("u2"),
                        expected: Expectation::Absent,
                    },
                    Write {
                        record: account("u1"),
                        expected: Expectation::Absent,
                    },
                ],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.get(&RecordKey::account("u2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn redemption_codes_are_unique() {
        let store = InMemoryLedgerStore::new();
        store
            .commit(insert(redemption("r1", "AAAA-BBBB-CCCC")))
            .await
            .unwrap();

        let err = store
            .commit(insert(redemption("r2", "AAAA-BBBB-CCCC")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));

        // The owner may rewrite its own row without tripping the index.
        store
            .compare_and_swap(redemption("r1", "AAAA-BBBB-CCCC"), 1)
            .await
            .unwrap();
        assert_eq!(store.scan(RecordKind::Redemption).await.unwrap().len(), 1);
    }
}
