//! Transactional Mutator.
//!
//! A mutation is an explicit two-phase contract: a declared read set and a pure
//! transition over a consistent snapshot of it. The Mutator fetches, computes and
//! commits; if the commit reports that any observed record moved, the attempt is
//! discarded and re-run from the fetch. This is the only path that writes more than
//! one record at a time.

use crate::clock::Clock;
use crate::error::{RewardsError, RewardsResult};
use crate::events::{EventBus, LedgerEvent};
use crate::store::{
    CommitRequest, Expectation, LedgerStore, Record, RecordKey, Snapshot, StoreError, Write,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Pure state transition over a declared read set.
///
/// `apply` may be invoked several times for one logical request and must not perform
/// external calls; everything it needs arrives through the snapshot and `now`.
pub trait Transition: Send + Sync {
    type Output: Send;

    fn name(&self) -> &'static str;

    fn read_set(&self) -> Vec<RecordKey>;

    fn apply(&self, snapshot: &Snapshot, now: DateTime<Utc>)
        -> RewardsResult<Plan<Self::Output>>;
}

/// Writes and result computed by one transition attempt.
#[derive(Debug)]
pub struct Plan<T> {
    updates: Vec<Record>,
    inserts: Vec<Record>,
    events: Vec<LedgerEvent>,
    output: T,
}

impl<T> Plan<T> {
    pub fn new(output: T) -> Self {
        Self {
            updates: Vec::new(),
            inserts: Vec::new(),
            events: Vec::new(),
            output,
        }
    }

    /// Overwrite a record that was part of the read set.
    pub fn update(mut self, record: Record) -> Self {
        self.updates.push(record);
        self
    }

    /// Insert a record that must not exist yet.
    pub fn insert(mut self, record: Record) -> Self {
        self.inserts.push(record);
        self
    }

    pub fn emit(mut self, event: LedgerEvent) -> Self {
        self.events.push(event);
        self
    }

    fn commit_request(&self, snapshot: &Snapshot) -> RewardsResult<CommitRequest> {
        let mut writes = Vec::with_capacity(self.updates.len() + self.inserts.len());

        for record in &self.updates {
            let key = record.key();
            let expected = match snapshot.observed_version(&key) {
                Some(Some(version)) => Expectation::Version(version),
                Some(None) => Expectation::Absent,
                None => {
                    return Err(RewardsError::Internal(format!(
                        "transition updated {key} outside its read set"
                    )))
                }
            };
            writes.push(Write {
                record: record.clone(),
                expected,
            });
        }

        for record in &self.inserts {
            writes.push(Write {
                record: record.clone(),
                expected: Expectation::Absent,
            });
        }

        Ok(CommitRequest {
            reads: snapshot.observed_versions(),
            writes,
        })
    }
}

/// Retry policy for optimistic commits.
#[derive(Debug, Clone)]
pub struct MutatorConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff_ms: 2,
            max_backoff_ms: 50,
        }
    }
}

#[derive(Clone)]
pub struct Mutator {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: MutatorConfig,
}

impl Mutator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: MutatorConfig,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn execute<T: Transition>(&self, transition: &T) -> RewardsResult<T::Output> {
        let keys = transition.read_set();
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let snapshot = self.store.read(&keys).await?;
            let plan = transition.apply(&snapshot, self.clock.now())?;
            let request = plan.commit_request(&snapshot)?;

            match self.store.commit(request).await {
                Ok(()) => {
                    for event in plan.events {
                        self.events.publish(event);
                    }
                    return Ok(plan.output);
                }
                Err(StoreError::Conflict(detail)) => {
                    tracing::debug!(
                        transition = transition.name(),
                        attempt,
                        %detail,
                        "optimistic commit conflicted"
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
                Err(other) => return Err(other.into()),
            }
        }

        tracing::warn!(
            transition = transition.name(),
            max_attempts,
            "retry budget exhausted under contention"
        );
        Err(RewardsError::Conflict(format!(
            "{} did not commit after {max_attempts} attempts",
            transition.name()
        )))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_backoff_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.config.max_backoff_ms);
        let jittered = rand::thread_rng().gen_range(0..=exp);
        Duration::from_millis(jittered)
    }
}
