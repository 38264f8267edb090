//! Partner Integration Adapter boundary and post-commit dispatch.
//!
//! Redemptions commit first; fulfilment is handed to a bounded outbox drained by a
//! background worker. The worker never touches balances or stock. Its only write is
//! a single-record `pending -> issued` transition on the redemption.

use crate::clock::Clock;
use crate::error::{RewardsError, RewardsResult};
use crate::store::{update_single, LedgerStore, Record, RecordKey, SingleUpdate};
use crate::types::{RedemptionStatus, Voucher};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

/// Fulfilment request handed to a partner after the ledger committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssueRequest {
    pub redemption_id: String,
    pub account_id: String,
    pub redemption_code: String,
    pub voucher: Voucher,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartnerIssue {
    pub success: bool,
    pub partner_reference: Option<String>,
}

/// External partner that fulfils redeemed vouchers.
#[async_trait]
pub trait PartnerAdapter: Send + Sync {
    fn partner_id(&self) -> &str;

    async fn issue(&self, request: &IssueRequest) -> RewardsResult<PartnerIssue>;
}

/// Registry of partner adapters keyed by partner id.
#[derive(Default)]
pub struct PartnerRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn PartnerAdapter>>>,
    fallback: RwLock<Option<Arc<dyn PartnerAdapter>>>,
}

impl PartnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: Arc<dyn PartnerAdapter>) -> RewardsResult<()> {
        let mut adapters = self
            .adapters
            .write()
            .map_err(|_| RewardsError::Internal("partner registry lock poisoned".to_string()))?;
        adapters.insert(adapter.partner_id().to_string(), adapter);
        Ok(())
    }

    /// Adapter used for vouchers whose partner has no dedicated registration.
    pub fn set_fallback(&self, adapter: Arc<dyn PartnerAdapter>) -> RewardsResult<()> {
        let mut fallback = self
            .fallback
            .write()
            .map_err(|_| RewardsError::Internal("partner registry lock poisoned".to_string()))?;
        *fallback = Some(adapter);
        Ok(())
    }

    pub fn resolve(&self, partner_id: &str) -> Option<Arc<dyn PartnerAdapter>> {
        let dedicated = self
            .adapters
            .read()
            .ok()
            .and_then(|adapters| adapters.get(partner_id).cloned());
        dedicated.or_else(|| self.fallback.read().ok().and_then(|f| f.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct PartnerDispatchConfig {
    pub queue_capacity: usize,
    pub max_in_flight: usize,
    pub max_attempts: u32,
    pub call_timeout_ms: u64,
    pub base_backoff_ms: u64,
}

impl Default for PartnerDispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_in_flight: 16,
            max_attempts: 3,
            call_timeout_ms: 5_000,
            base_backoff_ms: 200,
        }
    }
}

/// What happened to one dispatched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Issued { partner_reference: Option<String> },
    /// The redemption already left `pending` or is past its expiry.
    AlreadySettled,
    Declined,
    Failed,
    NoAdapter,
}

/// Processes fulfilment requests against the registered partners.
#[derive(Clone)]
pub struct PartnerWorker {
    store: Arc<dyn LedgerStore>,
    registry: Arc<PartnerRegistry>,
    clock: Arc<dyn Clock>,
    config: PartnerDispatchConfig,
}

impl PartnerWorker {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        registry: Arc<PartnerRegistry>,
        clock: Arc<dyn Clock>,
        config: PartnerDispatchConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            config,
        }
    }

    pub async fn process(&self, request: &IssueRequest) -> DispatchOutcome {
        let Some(adapter) = self.registry.resolve(&request.voucher.partner_id) else {
            tracing::warn!(
                redemption_id = %request.redemption_id,
                partner_id = %request.voucher.partner_id,
                "no partner adapter registered; redemption stays pending"
            );
            return DispatchOutcome::NoAdapter;
        };

        let max_attempts = self.config.max_attempts.max(1);
        let call_timeout = Duration::from_millis(self.config.call_timeout_ms);

        for attempt in 1..=max_attempts {
            match tokio::time::timeout(call_timeout, adapter.issue(request)).await {
                Ok(Ok(issue)) if issue.success => {
                    return self.mark_issued(request, issue.partner_reference).await;
                }
                Ok(Ok(_)) => {
                    tracing::warn!(
                        redemption_id = %request.redemption_id,
                        partner_id = adapter.partner_id(),
                        "partner declined issuance; redemption stays pending"
                    );
                    return DispatchOutcome::Declined;
                }
                Ok(Err(err)) => {
                    tracing::warn!(
                        redemption_id = %request.redemption_id,
                        partner_id = adapter.partner_id(),
                        attempt,
                        error = %err,
                        "partner issuance failed"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        redemption_id = %request.redemption_id,
                        partner_id = adapter.partner_id(),
                        attempt,
                        timeout_ms = self.config.call_timeout_ms,
                        "partner issuance timed out"
                    );
                }
            }

            if attempt < max_attempts {
                let delay = self
                    .config
                    .base_backoff_ms
                    .saturating_mul(1u64 << (attempt - 1).min(16));
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        tracing::warn!(
            redemption_id = %request.redemption_id,
            max_attempts,
            "partner retries exhausted; redemption stays pending for reconciliation"
        );
        DispatchOutcome::Failed
    }

    async fn mark_issued(
        &self,
        request: &IssueRequest,
        partner_reference: Option<String>,
    ) -> DispatchOutcome {
        let now = self.clock.now();
        let key = RecordKey::redemption(&request.redemption_id);
        let reference = partner_reference.clone();

        let result = update_single(self.store.as_ref(), &key, 3, |record| match record {
            Record::Redemption(redemption)
                if redemption.status == RedemptionStatus::Pending
                    && !redemption.is_past_expiry(now) =>
            {
                let mut next = redemption.clone();
                next.status = RedemptionStatus::Issued;
                next.partner_reference = reference.clone();
                next.updated_at = now;
                Ok(SingleUpdate::Write(Record::Redemption(next), true))
            }
            Record::Redemption(_) => Ok(SingleUpdate::Skip(false)),
            _ => Err(RewardsError::Internal(format!("{key} is not a redemption"))),
        })
        .await;

        match result {
            Ok(true) => {
                tracing::info!(
                    redemption_id = %request.redemption_id,
                    partner_reference = ?partner_reference,
                    "redemption issued by partner"
                );
                DispatchOutcome::Issued { partner_reference }
            }
            Ok(false) => DispatchOutcome::AlreadySettled,
            Err(err) => {
                tracing::error!(
                    redemption_id = %request.redemption_id,
                    error = %err,
                    "failed to record partner issuance"
                );
                DispatchOutcome::Failed
            }
        }
    }
}

/// Bounded outbox in front of a [`PartnerWorker`].
#[derive(Clone)]
pub struct PartnerDispatcher {
    sender: mpsc::Sender<IssueRequest>,
}

impl PartnerDispatcher {
    /// Spawn the draining task on the current tokio runtime.
    pub fn spawn(worker: PartnerWorker) -> Self {
        let (sender, mut receiver) = mpsc::channel::<IssueRequest>(worker.config.queue_capacity.max(1));
        let permits = Arc::new(Semaphore::new(worker.config.max_in_flight.max(1)));

        tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let worker = worker.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    worker.process(&request).await;
                });
            }
        });

        Self { sender }
    }

    /// Hand a request to the worker without waiting. Returns false if the outbox is
    /// full or closed; the redemption then stays pending.
    pub fn enqueue(&self, request: IssueRequest) -> bool {
        match self.sender.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                tracing::warn!(
                    redemption_id = %request.redemption_id,
                    "partner outbox full; redemption stays pending"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                tracing::error!(
                    redemption_id = %request.redemption_id,
                    "partner outbox closed; redemption stays pending"
                );
                false
            }
        }
    }
}
