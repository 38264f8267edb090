use crate::error::{RewardsError, RewardsResult};
use crate::events::LedgerEvent;
use crate::mutator::{Mutator, Plan, Transition};
use crate::store::{Record, RecordKey, RecordKind, Snapshot};
use crate::types::{
    Account, BalanceAudit, PointsGrant, PointsTransaction, Role, TransactionType,
};
use chrono::{DateTime, Utc};

/// Load the caller's account from a snapshot and check its role.
pub(crate) fn require_role<'a>(
    snapshot: &'a Snapshot,
    caller_id: &str,
    allowed: impl Fn(&Role) -> bool,
    action: &str,
) -> RewardsResult<&'a Account> {
    let account = snapshot.account(caller_id).ok_or_else(|| {
        RewardsError::PermissionDenied(format!(
            "caller '{caller_id}' has no account and may not {action}"
        ))
    })?;
    if !allowed(&account.role) {
        return Err(RewardsError::PermissionDenied(format!(
            "caller '{caller_id}' may not {action}"
        )));
    }
    Ok(account)
}

struct RegisterAccount {
    account_id: String,
    role: Role,
}

impl Transition for RegisterAccount {
    type Output = Account;

    fn name(&self) -> &'static str {
        "register_account"
    }

    fn read_set(&self) -> Vec<RecordKey> {
        vec![RecordKey::account(&self.account_id)]
    }

    fn apply(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> RewardsResult<Plan<Account>> {
        if snapshot.account(&self.account_id).is_some() {
            return Err(RewardsError::AlreadyExists(format!(
                "account '{}' already exists",
                self.account_id
            )));
        }
        let account = Account::new(&self.account_id, self.role, now);
        Ok(Plan::new(account.clone()).insert(Record::Account(account)))
    }
}

/// Privileged balance movement (bonus or adjustment).
struct GrantPoints {
    caller_id: String,
    account_id: String,
    amount: i64,
    transaction_type: TransactionType,
    description: String,
}

impl Transition for GrantPoints {
    type Output = PointsGrant;

    fn name(&self) -> &'static str {
        "grant_points"
    }

    fn read_set(&self) -> Vec<RecordKey> {
        vec![
            RecordKey::account(&self.caller_id),
            RecordKey::account(&self.account_id),
        ]
    }

    fn apply(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> RewardsResult<Plan<PointsGrant>> {
        require_role(snapshot, &self.caller_id, Role::is_admin, "grant points")?;

        let mut account = snapshot
            .account(&self.account_id)
            .cloned()
            .ok_or_else(|| RewardsError::not_found("account", &self.account_id))?;
        let old_balance = account.point_balance;
        account.apply_delta(self.amount, now)?;
        let new_balance = account.point_balance;

        let transaction = PointsTransaction::new(
            &self.account_id,
            self.amount,
            self.transaction_type,
            None,
            now,
        )
        .with_description(&self.description);

        let grant = PointsGrant {
            account_id: self.account_id.clone(),
            transaction_id: transaction.transaction_id.clone(),
            amount: self.amount,
            new_balance,
        };

        Ok(Plan::new(grant)
            .update(Record::Account(account))
            .insert(Record::Transaction(transaction))
            .emit(LedgerEvent::BalanceChanged {
                account_id: self.account_id.clone(),
                old_balance,
                new_balance,
                reason: self.transaction_type,
                occurred_at: now,
            }))
    }
}

/// Account lifecycle and privileged point grants.
#[derive(Clone)]
pub struct AccountLedger {
    mutator: Mutator,
}

impl AccountLedger {
    pub fn new(mutator: Mutator) -> Self {
        Self { mutator }
    }

    pub async fn register(&self, account_id: &str, role: Role) -> RewardsResult<Account> {
        if account_id.trim().is_empty() {
            return Err(RewardsError::InvalidArgument(
                "account id must not be empty".to_string(),
            ));
        }
        let account = self
            .mutator
            .execute(&RegisterAccount {
                account_id: account_id.to_string(),
                role,
            })
            .await?;
        tracing::info!(account_id = %account.account_id, role = ?account.role, "account registered");
        Ok(account)
    }

    pub async fn get(&self, account_id: &str) -> RewardsResult<Account> {
        match self
            .mutator
            .store()
            .get(&RecordKey::account(account_id))
            .await?
            .map(|v| v.record)
        {
            Some(Record::Account(account)) => Ok(account),
            _ => Err(RewardsError::not_found("account", account_id)),
        }
    }

    /// Credit a positive bonus with a description.
    pub async fn award_manually(
        &self,
        caller_id: &str,
        account_id: &str,
        amount: i64,
        description: &str,
    ) -> RewardsResult<PointsGrant> {
        if amount <= 0 {
            return Err(RewardsError::InvalidArgument(format!(
                "award amount must be positive, got {amount}"
            )));
        }
        if description.trim().is_empty() {
            return Err(RewardsError::InvalidArgument(
                "award description is required".to_string(),
            ));
        }
        self.grant(caller_id, account_id, amount, TransactionType::Bonus, description)
            .await
    }

    /// Signed correction; never takes a balance below zero.
    pub async fn adjust(
        &self,
        caller_id: &str,
        account_id: &str,
        delta: i64,
        reason: &str,
    ) -> RewardsResult<PointsGrant> {
        if delta == 0 {
            return Err(RewardsError::InvalidArgument(
                "adjustment delta must be non-zero".to_string(),
            ));
        }
        if reason.trim().is_empty() {
            return Err(RewardsError::InvalidArgument(
                "adjustment reason is required".to_string(),
            ));
        }
        self.grant(
            caller_id,
            account_id,
            delta,
            TransactionType::Adjustment,
            reason,
        )
        .await
    }

    async fn grant(
        &self,
        caller_id: &str,
        account_id: &str,
        amount: i64,
        transaction_type: TransactionType,
        description: &str,
    ) -> RewardsResult<PointsGrant> {
        let grant = self
            .mutator
            .execute(&GrantPoints {
                caller_id: caller_id.to_string(),
                account_id: account_id.to_string(),
                amount,
                transaction_type,
                description: description.to_string(),
            })
            .await?;
        tracing::info!(
            caller_id,
            account_id,
            amount,
            kind = transaction_type.as_str(),
            new_balance = grant.new_balance,
            "points granted"
        );
        Ok(grant)
    }

    /// Transactions for one account, oldest first.
    pub async fn transactions(&self, account_id: &str) -> RewardsResult<Vec<PointsTransaction>> {
        let mut items = self
            .mutator
            .store()
            .scan(RecordKind::Transaction)
            .await?
            .into_iter()
            .filter_map(|v| match v.record {
                Record::Transaction(tx) if tx.account_id == account_id => Some(tx),
                _ => None,
            })
            .collect::<Vec<_>>();
        items.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.transaction_id.cmp(&b.transaction_id))
        });
        Ok(items)
    }

    /// Check that the transaction history sums to the current balance.
    pub async fn audit(&self, account_id: &str) -> RewardsResult<BalanceAudit> {
        let account = self.get(account_id).await?;
        let transactions = self.transactions(account_id).await?;
        let transaction_sum = transactions
            .iter()
            .try_fold(0i64, |sum, tx| sum.checked_add(tx.amount))
            .ok_or_else(|| {
                tracing::error!(account_id, "transaction history overflows the points range");
                RewardsError::Internal(format!(
                    "transaction history of account '{account_id}' overflows the points range"
                ))
            })?;
        let consistent = i64::try_from(account.point_balance)
            .map(|balance| balance == transaction_sum)
            .unwrap_or(false);

        if !consistent {
            tracing::error!(
                account_id,
                balance = account.point_balance,
                transaction_sum,
                "balance does not match transaction history"
            );
        }

        Ok(BalanceAudit {
            account_id: account_id.to_string(),
            balance: account.point_balance,
            transaction_sum,
            transaction_count: transactions.len(),
            consistent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::ErrorKind;
    use crate::events::EventBus;
    use crate::mutator::MutatorConfig;
    use crate::store::InMemoryLedgerStore;
    use std::sync::Arc;

    async fn ledger_with_admin() -> (AccountLedger, EventBus) {
        let events = EventBus::new(16);
        let mutator = Mutator::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(SystemClock),
            events.clone(),
            MutatorConfig::default(),
        );
        let ledger = AccountLedger::new(mutator);
        ledger.register("admin", Role::Admin).await.unwrap();
        ledger.register("u1", Role::Participant).await.unwrap();
        (ledger, events)
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (ledger, _) = ledger_with_admin().await;
        let err = ledger.register("u1", Role::Participant).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn manual_award_records_bonus_and_publishes_event() {
        let (ledger, events) = ledger_with_admin().await;
        let mut rx = events.subscribe();

        let grant = ledger
            .award_manually("admin", "u1", 120, "welcome bonus")
            .await
            .unwrap();
        assert_eq!(grant.new_balance, 120);

        let txs = ledger.transactions("u1").await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].transaction_type, TransactionType::Bonus);
        assert_eq!(txs[0].description.as_deref(), Some("welcome bonus"));

        match rx.recv().await.unwrap() {
            LedgerEvent::BalanceChanged {
                old_balance,
                new_balance,
                ..
            } => assert_eq!((old_balance, new_balance), (0, 120)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_admin_cannot_award() {
        let (ledger, _) = ledger_with_admin().await;
        let err = ledger
            .award_manually("u1", "u1", 10, "self award")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(ledger.get("u1").await.unwrap().point_balance, 0);
    }

    #[tokio::test]
    async fn award_validates_amount() {
        let (ledger, _) = ledger_with_admin().await;
        for amount in [0, -5] {
            let err = ledger
                .award_manually("admin", "u1", amount, "nope")
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
    }

    #[tokio::test]
    async fn adjustment_cannot_overdraw() {
        let (ledger, _) = ledger_with_admin().await;
        ledger
            .award_manually("admin", "u1", 30, "seed")
            .await
            .unwrap();

        let err = ledger.adjust("admin", "u1", -31, "fix").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

        let grant = ledger.adjust("admin", "u1", -30, "fix").await.unwrap();
        assert_eq!(grant.new_balance, 0);

        let audit = ledger.audit("u1").await.unwrap();
        assert!(audit.consistent);
        assert_eq!(audit.transaction_count, 2);
    }

    #[tokio::test]
    async fn award_past_the_points_range_is_rejected_and_audit_holds() {
        let (ledger, _) = ledger_with_admin().await;
        ledger
            .award_manually("admin", "u1", i64::MAX, "jackpot")
            .await
            .unwrap();

        let err = ledger
            .award_manually("admin", "u1", 1, "one more")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

        let audit = ledger.audit("u1").await.unwrap();
        assert!(audit.consistent);
        assert_eq!(audit.balance, crate::types::MAX_POINTS);
        assert_eq!(audit.transaction_count, 1);
    }
}
