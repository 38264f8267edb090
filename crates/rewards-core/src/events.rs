//! Downstream change notifications.
//!
//! Leaderboard and badge consumers subscribe here and derive their own state. The
//! ledger publishes after commit and never observes subscriber count or health.

use crate::types::TransactionType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Immutable event published after a successful mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LedgerEvent {
    BalanceChanged {
        account_id: String,
        old_balance: u64,
        new_balance: u64,
        reason: TransactionType,
        occurred_at: DateTime<Utc>,
    },
    MissionCompleted {
        account_id: String,
        mission_id: String,
        points_awarded: u64,
        occurred_at: DateTime<Utc>,
    },
    VoucherRedeemed {
        account_id: String,
        voucher_id: String,
        redemption_id: String,
        occurred_at: DateTime<Utc>,
    },
}

impl LedgerEvent {
    pub fn account_id(&self) -> &str {
        match self {
            Self::BalanceChanged { account_id, .. }
            | Self::MissionCompleted { account_id, .. }
            | Self::VoucherRedeemed { account_id, .. } => account_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: LedgerEvent) {
        // No receivers is not an error for the ledger.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
