//! Voucher catalog, the two-phase redemption workflow, mark-as-used and the
//! expiry sweep.

use crate::accounts::require_role;
use crate::codegen::RedemptionCodeGenerator;
use crate::error::{RewardsError, RewardsResult};
use crate::events::LedgerEvent;
use crate::mutator::{Mutator, Plan, Transition};
use crate::partner::{IssueRequest, PartnerDispatcher};
use crate::store::{update_single, Record, RecordKey, RecordKind, SingleUpdate, Snapshot};
use crate::types::{
    PointsTransaction, Redemption, RedemptionReceipt, RedemptionStatus, Role, TransactionType,
    Voucher, VoucherDraft,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

const SINGLE_UPDATE_ATTEMPTS: u32 = 5;

/// Longest accepted redemption window, one century.
pub const MAX_REDEMPTION_WINDOW_DAYS: i64 = 36_500;

#[derive(Debug, Clone)]
pub struct RedemptionConfig {
    /// Days between redemption and expiry of the code.
    pub window_days: i64,
    /// Fresh codes to try when the unique index rejects one.
    pub code_attempts: u32,
}

impl Default for RedemptionConfig {
    fn default() -> Self {
        Self {
            window_days: 30,
            code_attempts: 5,
        }
    }
}

impl RedemptionConfig {
    /// Validity window of a redemption code, checked to be positive and representable.
    pub fn window(&self) -> RewardsResult<Duration> {
        if self.window_days <= 0 {
            return Err(RewardsError::InvalidArgument(format!(
                "redemption window must be positive, got {} days",
                self.window_days
            )));
        }
        Some(self.window_days)
            .filter(|days| *days <= MAX_REDEMPTION_WINDOW_DAYS)
            .and_then(Duration::try_days)
            .ok_or_else(|| {
                RewardsError::InvalidArgument(format!(
                    "redemption window of {} days exceeds {MAX_REDEMPTION_WINDOW_DAYS}",
                    self.window_days
                ))
            })
    }
}

struct CreateVoucher {
    caller_id: String,
    voucher_id: String,
    draft: VoucherDraft,
}

impl Transition for CreateVoucher {
    type Output = Voucher;

    fn name(&self) -> &'static str {
        "create_voucher"
    }

    fn read_set(&self) -> Vec<RecordKey> {
        vec![RecordKey::account(&self.caller_id)]
    }

    fn apply(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> RewardsResult<Plan<Voucher>> {
        require_role(snapshot, &self.caller_id, Role::is_admin, "create vouchers")?;
        let voucher = Voucher {
            voucher_id: self.voucher_id.clone(),
            title: self.draft.title.trim().to_string(),
            partner_id: self.draft.partner_id.trim().to_string(),
            points_cost: self.draft.points_cost,
            stock: self.draft.stock,
            expiry_date: self.draft.expiry_date,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        Ok(Plan::new(voucher.clone()).insert(Record::Voucher(voucher)))
    }
}

enum CatalogChange {
    Restock(u32),
    SetActive(bool),
}

struct UpdateVoucher {
    caller_id: String,
    voucher_id: String,
    change: CatalogChange,
}

impl Transition for UpdateVoucher {
    type Output = Voucher;

    fn name(&self) -> &'static str {
        match self.change {
            CatalogChange::Restock(_) => "restock_voucher",
            CatalogChange::SetActive(_) => "set_voucher_active",
        }
    }

    fn read_set(&self) -> Vec<RecordKey> {
        vec![
            RecordKey::account(&self.caller_id),
            RecordKey::voucher(&self.voucher_id),
        ]
    }

    fn apply(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> RewardsResult<Plan<Voucher>> {
        require_role(snapshot, &self.caller_id, Role::is_admin, "manage vouchers")?;
        let mut voucher = snapshot
            .voucher(&self.voucher_id)
            .cloned()
            .ok_or_else(|| RewardsError::not_found("voucher", &self.voucher_id))?;

        match self.change {
            CatalogChange::Restock(amount) => {
                voucher.stock = voucher.stock.checked_add(amount).ok_or_else(|| {
                    RewardsError::InvalidArgument(format!(
                        "restocking voucher '{}' by {amount} overflows its stock",
                        self.voucher_id
                    ))
                })?;
            }
            CatalogChange::SetActive(active) => voucher.is_active = active,
        }
        voucher.updated_at = now;
        Ok(Plan::new(voucher.clone()).update(Record::Voucher(voucher)))
    }
}

/// Atomic phase of a redemption. The code and ids are chosen before the attempt
/// so that re-running `apply` stays deterministic.
struct RedeemVoucher {
    account_id: String,
    voucher_id: String,
    redemption_id: String,
    redemption_code: String,
    window: Duration,
}

impl Transition for RedeemVoucher {
    type Output = RedemptionReceipt;

    fn name(&self) -> &'static str {
        "redeem_voucher"
    }

    fn read_set(&self) -> Vec<RecordKey> {
        vec![
            RecordKey::voucher(&self.voucher_id),
            RecordKey::account(&self.account_id),
        ]
    }

    fn apply(
        &self,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> RewardsResult<Plan<RedemptionReceipt>> {
        let mut voucher = snapshot
            .voucher(&self.voucher_id)
            .cloned()
            .ok_or_else(|| RewardsError::not_found("voucher", &self.voucher_id))?;
        let mut account = snapshot
            .account(&self.account_id)
            .cloned()
            .ok_or_else(|| RewardsError::not_found("account", &self.account_id))?;

        if !voucher.is_active {
            return Err(RewardsError::FailedPrecondition(format!(
                "voucher '{}' is not active",
                self.voucher_id
            )));
        }
        if voucher.is_expired_at(now) {
            return Err(RewardsError::FailedPrecondition(format!(
                "voucher '{}' has expired",
                self.voucher_id
            )));
        }
        if voucher.stock == 0 {
            return Err(RewardsError::ResourceExhausted(format!(
                "voucher '{}' is out of stock",
                self.voucher_id
            )));
        }
        if account.point_balance < voucher.points_cost {
            return Err(RewardsError::InsufficientPoints {
                required: voucher.points_cost,
                available: account.point_balance,
            });
        }

        let cost = i64::try_from(voucher.points_cost).map_err(|_| {
            RewardsError::Internal(format!(
                "voucher '{}' cost does not fit a transaction amount",
                self.voucher_id
            ))
        })?;

        let expires_at = now.checked_add_signed(self.window).ok_or_else(|| {
            RewardsError::Internal(format!(
                "redemption window overflows the calendar from {now}"
            ))
        })?;

        let old_balance = account.point_balance;
        account.apply_delta(-cost, now)?;
        let new_balance = account.point_balance;

        voucher.stock -= 1;
        voucher.updated_at = now;

        let redemption = Redemption {
            redemption_id: self.redemption_id.clone(),
            account_id: self.account_id.clone(),
            voucher_id: self.voucher_id.clone(),
            points_spent: voucher.points_cost,
            redemption_code: self.redemption_code.clone(),
            status: RedemptionStatus::Pending,
            redeemed_at: now,
            expires_at,
            used_at: None,
            partner_reference: None,
            updated_at: now,
        };

        let transaction = PointsTransaction::new(
            &self.account_id,
            -cost,
            TransactionType::VoucherRedemption,
            Some(self.voucher_id.clone()),
            now,
        )
        .with_description(format!("Redeemed voucher: {}", voucher.title));

        let receipt = RedemptionReceipt {
            redemption_id: redemption.redemption_id.clone(),
            redemption_code: redemption.redemption_code.clone(),
            new_balance,
            expires_at: redemption.expires_at,
            voucher: voucher.clone(),
        };

        Ok(Plan::new(receipt)
            .update(Record::Voucher(voucher))
            .update(Record::Account(account))
            .insert(Record::Redemption(redemption))
            .insert(Record::Transaction(transaction))
            .emit(LedgerEvent::BalanceChanged {
                account_id: self.account_id.clone(),
                old_balance,
                new_balance,
                reason: TransactionType::VoucherRedemption,
                occurred_at: now,
            })
            .emit(LedgerEvent::VoucherRedeemed {
                account_id: self.account_id.clone(),
                voucher_id: self.voucher_id.clone(),
                redemption_id: self.redemption_id.clone(),
                occurred_at: now,
            }))
    }
}

/// Voucher catalog and redemption lifecycle.
#[derive(Clone)]
pub struct VoucherWorkflow {
    mutator: Mutator,
    codes: Arc<dyn RedemptionCodeGenerator>,
    dispatcher: PartnerDispatcher,
    config: RedemptionConfig,
    window: Duration,
}

impl VoucherWorkflow {
    pub fn new(
        mutator: Mutator,
        codes: Arc<dyn RedemptionCodeGenerator>,
        dispatcher: PartnerDispatcher,
        config: RedemptionConfig,
    ) -> RewardsResult<Self> {
        let window = config.window()?;
        Ok(Self {
            mutator,
            codes,
            dispatcher,
            config,
            window,
        })
    }

    pub async fn create(&self, caller_id: &str, draft: VoucherDraft) -> RewardsResult<Voucher> {
        if draft.title.trim().is_empty() || draft.partner_id.trim().is_empty() {
            return Err(RewardsError::InvalidArgument(
                "voucher title and partner id are required".to_string(),
            ));
        }
        if draft.points_cost == 0 {
            return Err(RewardsError::InvalidArgument(
                "voucher points cost must be positive".to_string(),
            ));
        }
        if draft.points_cost > crate::types::MAX_POINTS {
            return Err(RewardsError::InvalidArgument(format!(
                "voucher points cost may not exceed {}",
                crate::types::MAX_POINTS
            )));
        }

        let voucher = self
            .mutator
            .execute(&CreateVoucher {
                caller_id: caller_id.to_string(),
                voucher_id: Uuid::new_v4().to_string(),
                draft,
            })
            .await?;
        tracing::info!(
            voucher_id = %voucher.voucher_id,
            partner_id = %voucher.partner_id,
            stock = voucher.stock,
            "voucher created"
        );
        Ok(voucher)
    }

    pub async fn restock(
        &self,
        caller_id: &str,
        voucher_id: &str,
        amount: u32,
    ) -> RewardsResult<Voucher> {
        if amount == 0 {
            return Err(RewardsError::InvalidArgument(
                "restock amount must be positive".to_string(),
            ));
        }
        let voucher = self
            .mutator
            .execute(&UpdateVoucher {
                caller_id: caller_id.to_string(),
                voucher_id: voucher_id.to_string(),
                change: CatalogChange::Restock(amount),
            })
            .await?;
        tracing::info!(voucher_id, amount, stock = voucher.stock, "voucher restocked");
        Ok(voucher)
    }

    pub async fn set_active(
        &self,
        caller_id: &str,
        voucher_id: &str,
        active: bool,
    ) -> RewardsResult<Voucher> {
        let voucher = self
            .mutator
            .execute(&UpdateVoucher {
                caller_id: caller_id.to_string(),
                voucher_id: voucher_id.to_string(),
                change: CatalogChange::SetActive(active),
            })
            .await?;
        tracing::info!(voucher_id, active, "voucher availability changed");
        Ok(voucher)
    }

    pub async fn get(&self, voucher_id: &str) -> RewardsResult<Voucher> {
        match self
            .mutator
            .store()
            .get(&RecordKey::voucher(voucher_id))
            .await?
            .map(|v| v.record)
        {
            Some(Record::Voucher(voucher)) => Ok(voucher),
            _ => Err(RewardsError::not_found("voucher", voucher_id)),
        }
    }

    pub async fn list(&self) -> RewardsResult<Vec<Voucher>> {
        let mut vouchers = self
            .mutator
            .store()
            .scan(RecordKind::Voucher)
            .await?
            .into_iter()
            .filter_map(|v| match v.record {
                Record::Voucher(voucher) => Some(voucher),
                _ => None,
            })
            .collect::<Vec<_>>();
        vouchers.sort_by(|a, b| {
            a.points_cost
                .cmp(&b.points_cost)
                .then_with(|| a.voucher_id.cmp(&b.voucher_id))
        });
        Ok(vouchers)
    }

    /// Spend points on a voucher.
    ///
    /// The ledger commit is final once this returns `Ok`; partner fulfilment is then
    /// queued and its outcome only ever moves the redemption from `pending` to
    /// `issued`.
    pub async fn redeem(
        &self,
        account_id: &str,
        voucher_id: &str,
    ) -> RewardsResult<RedemptionReceipt> {
        let attempts = self.config.code_attempts.max(1);

        for attempt in 1..=attempts {
            let transition = RedeemVoucher {
                account_id: account_id.to_string(),
                voucher_id: voucher_id.to_string(),
                redemption_id: Uuid::new_v4().to_string(),
                redemption_code: self.codes.generate(),
                window: self.window,
            };

            match self.mutator.execute(&transition).await {
                Ok(receipt) => {
                    tracing::info!(
                        account_id,
                        voucher_id,
                        redemption_id = %receipt.redemption_id,
                        new_balance = receipt.new_balance,
                        "voucher redeemed"
                    );
                    self.dispatch(IssueRequest {
                        redemption_id: receipt.redemption_id.clone(),
                        account_id: account_id.to_string(),
                        redemption_code: receipt.redemption_code.clone(),
                        voucher: receipt.voucher.clone(),
                    });
                    return Ok(receipt);
                }
                Err(RewardsError::UniqueViolation { index, .. }) => {
                    tracing::warn!(
                        voucher_id,
                        attempt,
                        %index,
                        "redemption code collided, regenerating"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Err(RewardsError::Internal(format!(
            "no unique redemption code after {attempts} attempts"
        )))
    }

    fn dispatch(&self, request: IssueRequest) -> bool {
        self.dispatcher.enqueue(request)
    }

    pub async fn get_redemption(&self, redemption_id: &str) -> RewardsResult<Redemption> {
        match self
            .mutator
            .store()
            .get(&RecordKey::redemption(redemption_id))
            .await?
            .map(|v| v.record)
        {
            Some(Record::Redemption(redemption)) => Ok(redemption),
            _ => Err(RewardsError::not_found("redemption", redemption_id)),
        }
    }

    async fn redemptions(&self) -> RewardsResult<Vec<Redemption>> {
        let mut items = self
            .mutator
            .store()
            .scan(RecordKind::Redemption)
            .await?
            .into_iter()
            .filter_map(|v| match v.record {
                Record::Redemption(redemption) => Some(redemption),
                _ => None,
            })
            .collect::<Vec<_>>();
        items.sort_by(|a, b| {
            a.redeemed_at
                .cmp(&b.redeemed_at)
                .then_with(|| a.redemption_id.cmp(&b.redemption_id))
        });
        Ok(items)
    }

    pub async fn redemptions_for(&self, account_id: &str) -> RewardsResult<Vec<Redemption>> {
        Ok(self
            .redemptions()
            .await?
            .into_iter()
            .filter(|r| r.account_id == account_id)
            .collect())
    }

    /// Single-record conditional transition to `used`.
    pub async fn mark_used(&self, caller_id: &str, redemption_id: &str) -> RewardsResult<Redemption> {
        let now = self.mutator.now();
        let key = RecordKey::redemption(redemption_id);

        let redemption = update_single(
            self.mutator.store().as_ref(),
            &key,
            SINGLE_UPDATE_ATTEMPTS,
            |record| {
                let Record::Redemption(current) = record else {
                    return Err(RewardsError::Internal(format!("{key} is not a redemption")));
                };
                if current.account_id != caller_id {
                    return Err(RewardsError::PermissionDenied(format!(
                        "redemption '{redemption_id}' belongs to another account"
                    )));
                }
                match current.status {
                    RedemptionStatus::Used => {
                        return Err(RewardsError::AlreadyExists(format!(
                            "redemption '{redemption_id}' was already used"
                        )))
                    }
                    RedemptionStatus::Expired => {
                        return Err(RewardsError::FailedPrecondition(format!(
                            "redemption '{redemption_id}' has expired"
                        )))
                    }
                    RedemptionStatus::Pending | RedemptionStatus::Issued => {}
                }
                if current.is_past_expiry(now) {
                    return Err(RewardsError::FailedPrecondition(format!(
                        "redemption '{redemption_id}' expired at {}",
                        current.expires_at
                    )));
                }

                let mut next = current.clone();
                next.status = RedemptionStatus::Used;
                next.used_at = Some(now);
                next.updated_at = now;
                Ok(SingleUpdate::Write(Record::Redemption(next.clone()), next))
            },
        )
        .await?;

        tracing::info!(caller_id, redemption_id, "redemption marked used");
        Ok(redemption)
    }

    /// Move every open redemption past its expiry to `expired`. Returns how many
    /// records this sweep transitioned.
    pub async fn sweep_expired(&self) -> RewardsResult<usize> {
        let now = self.mutator.now();
        let candidates = self
            .redemptions()
            .await?
            .into_iter()
            .filter(|r| r.status.is_open() && r.is_past_expiry(now));

        let mut expired = 0;
        for candidate in candidates {
            let key = RecordKey::redemption(&candidate.redemption_id);
            let result = update_single(
                self.mutator.store().as_ref(),
                &key,
                SINGLE_UPDATE_ATTEMPTS,
                |record| match record {
                    Record::Redemption(current)
                        if current.status.is_open() && current.is_past_expiry(now) =>
                    {
                        let mut next = current.clone();
                        next.status = RedemptionStatus::Expired;
                        next.updated_at = now;
                        Ok(SingleUpdate::Write(Record::Redemption(next), true))
                    }
                    _ => Ok(SingleUpdate::Skip(false)),
                },
            )
            .await;

            match result {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(err) => tracing::error!(
                    redemption_id = %candidate.redemption_id,
                    error = %err,
                    "failed to expire redemption"
                ),
            }
        }

        if expired > 0 {
            tracing::info!(expired, "expired stale redemptions");
        }
        Ok(expired)
    }

    /// Re-enqueue unexpired `pending` redemptions for partner fulfilment.
    pub async fn requeue_pending(&self) -> RewardsResult<usize> {
        let now = self.mutator.now();
        let mut queued = 0;

        for redemption in self.redemptions().await? {
            if redemption.status != RedemptionStatus::Pending || redemption.is_past_expiry(now) {
                continue;
            }
            let voucher = match self.get(&redemption.voucher_id).await {
                Ok(voucher) => voucher,
                Err(err) => {
                    tracing::warn!(
                        redemption_id = %redemption.redemption_id,
                        error = %err,
                        "cannot requeue redemption without its voucher"
                    );
                    continue;
                }
            };
            let request = IssueRequest {
                redemption_id: redemption.redemption_id,
                account_id: redemption.account_id,
                redemption_code: redemption.redemption_code,
                voucher,
            };
            if self.dispatch(request) {
                queued += 1;
            }
        }

        tracing::info!(queued, "requeued pending redemptions");
        Ok(queued)
    }
}
