use crate::error::{RewardsError, RewardsResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Largest balance or single amount the ledger accepts; transaction amounts are `i64`.
pub const MAX_POINTS: u64 = i64::MAX as u64;

/// Role tag carried by every account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Participant,
    Organizer,
    Admin,
}

impl Role {
    pub fn can_organize(&self) -> bool {
        matches!(self, Self::Organizer | Self::Admin)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }
}

/// Ledger-visible participant state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub account_id: String,
    pub role: Role,
    pub point_balance: u64,
    pub total_volunteer_hours: u32,
    pub badges: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(account_id: impl Into<String>, role: Role, now: DateTime<Utc>) -> Self {
        Self {
            account_id: account_id.into(),
            role,
            point_balance: 0,
            total_volunteer_hours: 0,
            badges: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a signed delta to the balance, refusing to go below zero.
    pub fn apply_delta(&mut self, delta: i64, now: DateTime<Utc>) -> RewardsResult<()> {
        let next = if delta >= 0 {
            self.point_balance
                .checked_add(delta.unsigned_abs())
                .filter(|balance| *balance <= MAX_POINTS)
        } else {
            self.point_balance.checked_sub(delta.unsigned_abs())
        };

        match next {
            Some(balance) => {
                self.point_balance = balance;
                self.updated_at = now;
                Ok(())
            }
            None if delta < 0 => Err(RewardsError::InsufficientPoints {
                required: delta.unsigned_abs(),
                available: self.point_balance,
            }),
            None => Err(RewardsError::FailedPrecondition(format!(
                "balance of account '{}' would exceed {MAX_POINTS} points",
                self.account_id
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Draft,
    Published,
    Ongoing,
    Completed,
    Cancelled,
}

impl MissionStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Draft => 0,
            Self::Published => 1,
            Self::Ongoing => 2,
            Self::Completed => 3,
            Self::Cancelled => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Lifecycle only moves forward; any non-terminal status may be cancelled.
    pub fn can_advance_to(&self, next: MissionStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            MissionStatus::Cancelled => true,
            MissionStatus::Draft => false,
            _ => next.rank() > self.rank(),
        }
    }

    pub fn accepts_participants(&self) -> bool {
        matches!(self, Self::Published | Self::Ongoing)
    }
}

/// Time-bound activity that awards points on verified completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mission {
    pub mission_id: String,
    pub title: String,
    pub organizer_id: String,
    pub points_reward: u64,
    pub volunteer_hours: u32,
    pub status: MissionStatus,
    pub scheduled_date: DateTime<Utc>,
    pub max_participants: Option<u32>,
    /// Insertion-ordered; never shrinks.
    pub participants: Vec<String>,
    pub completed_participants: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mission {
    pub fn is_participant(&self, account_id: &str) -> bool {
        self.participants.iter().any(|id| id == account_id)
    }

    pub fn has_completed(&self, account_id: &str) -> bool {
        self.completed_participants.contains(account_id)
    }

    pub fn is_full(&self) -> bool {
        self.max_participants
            .map(|max| self.participants.len() >= max as usize)
            .unwrap_or(false)
    }
}

/// Organizer input for a new mission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionDraft {
    pub title: String,
    pub points_reward: u64,
    #[serde(default)]
    pub volunteer_hours: u32,
    pub scheduled_date: DateTime<Utc>,
    #[serde(default)]
    pub max_participants: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    MissionCompletion,
    VoucherRedemption,
    Bonus,
    Adjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissionCompletion => "mission_completion",
            Self::VoucherRedemption => "voucher_redemption",
            Self::Bonus => "bonus",
            Self::Adjustment => "adjustment",
        }
    }
}

/// Immutable, append-only balance movement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PointsTransaction {
    pub transaction_id: String,
    pub account_id: String,
    pub amount: i64,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub related_id: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PointsTransaction {
    pub fn new(
        account_id: impl Into<String>,
        amount: i64,
        transaction_type: TransactionType,
        related_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            transaction_id: Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            amount,
            transaction_type,
            related_id,
            description: None,
            created_at,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Stocked, point-priced item fulfilled by a partner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Voucher {
    pub voucher_id: String,
    pub title: String,
    pub partner_id: String,
    pub points_cost: u64,
    pub stock: u32,
    pub expiry_date: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Voucher {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_date.map(|expiry| expiry < now).unwrap_or(false)
    }
}

/// Admin input for a new voucher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoucherDraft {
    pub title: String,
    pub partner_id: String,
    pub points_cost: u64,
    pub stock: u32,
    #[serde(default)]
    pub expiry_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionStatus {
    Pending,
    Issued,
    Used,
    Expired,
}

impl RedemptionStatus {
    /// Pending and issued redemptions can still be used or swept.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Issued)
    }
}

/// One successful voucher purchase and its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Redemption {
    pub redemption_id: String,
    pub account_id: String,
    pub voucher_id: String,
    /// Cost snapshot at redemption time.
    pub points_spent: u64,
    pub redemption_code: String,
    pub status: RedemptionStatus,
    pub redeemed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub partner_reference: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Redemption {
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Authenticated caller identity; authentication itself happens upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub account_id: String,
}

impl Caller {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
        }
    }

    /// Build a caller from an optional upstream identity value.
    pub fn from_identity(identity: Option<&str>) -> RewardsResult<Self> {
        match identity.map(str::trim) {
            Some(id) if !id.is_empty() => Ok(Self::new(id)),
            _ => Err(RewardsError::Unauthenticated(
                "missing caller identity".to_string(),
            )),
        }
    }
}

/// Opaque proof submitted with a mission completion.
pub type VerificationPayload = Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissionAward {
    pub account_id: String,
    pub mission_id: String,
    pub points_awarded: u64,
    pub new_balance: u64,
    pub transaction_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedemptionReceipt {
    pub redemption_id: String,
    pub redemption_code: String,
    pub new_balance: u64,
    pub expires_at: DateTime<Utc>,
    pub voucher: Voucher,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PointsGrant {
    pub account_id: String,
    pub transaction_id: String,
    pub amount: i64,
    pub new_balance: u64,
}

/// Result of checking the balance/transaction-sum invariant for one account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BalanceAudit {
    pub account_id: String,
    pub balance: u64,
    pub transaction_sum: i64,
    pub transaction_count: usize,
    pub consistent: bool,
}
