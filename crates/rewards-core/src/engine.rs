use crate::accounts::AccountLedger;
use crate::clock::{Clock, SystemClock};
use crate::codegen::{RandomCodeGenerator, RedemptionCodeGenerator};
use crate::error::{RewardsError, RewardsResult};
use crate::events::{EventBus, LedgerEvent};
use crate::missions::MissionWorkflow;
use crate::mutator::{Mutator, MutatorConfig};
use crate::partner::{
    PartnerAdapter, PartnerDispatchConfig, PartnerDispatcher, PartnerRegistry, PartnerWorker,
};
use crate::store::{open_store, LedgerStorageConfig, LedgerStore};
use crate::types::{
    Account, BalanceAudit, Caller, Mission, MissionAward, MissionDraft, MissionStatus,
    PointsGrant, PointsTransaction, Redemption, RedemptionReceipt, Role, VerificationPayload,
    Voucher, VoucherDraft,
};
use crate::verification::{ScheduledDatePolicy, VerificationPolicy};
use crate::vouchers::{RedemptionConfig, VoucherWorkflow};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Rewards engine configuration.
#[derive(Debug, Clone)]
pub struct RewardsEngineConfig {
    pub ledger_storage: LedgerStorageConfig,
    pub mutator: MutatorConfig,
    pub redemption_window_days: i64,
    pub code_attempts: u32,
    pub partner: PartnerDispatchConfig,
    pub event_capacity: usize,
}

impl Default for RewardsEngineConfig {
    fn default() -> Self {
        Self {
            ledger_storage: LedgerStorageConfig::Memory,
            mutator: MutatorConfig::default(),
            redemption_window_days: 30,
            code_attempts: 5,
            partner: PartnerDispatchConfig::default(),
            event_capacity: 1024,
        }
    }
}

/// Entry point for every caller-facing ledger operation.
///
/// Callers are authenticated upstream; the engine only authorizes, reading roles
/// from the stored account of the caller.
#[derive(Clone)]
pub struct RewardsEngine {
    store: Arc<dyn LedgerStore>,
    events: EventBus,
    partners: Arc<PartnerRegistry>,
    accounts: AccountLedger,
    missions: MissionWorkflow,
    vouchers: VoucherWorkflow,
}

impl RewardsEngine {
    /// Open the configured store and start the partner dispatcher.
    pub async fn bootstrap(config: RewardsEngineConfig) -> RewardsResult<Self> {
        let store = open_store(&config.ledger_storage).await?;
        Self::with_store(store, Arc::new(SystemClock), config)
    }

    /// Build on an already opened store. Must be called inside a tokio runtime.
    pub fn with_store(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        config: RewardsEngineConfig,
    ) -> RewardsResult<Self> {
        Self::with_components(
            store,
            clock,
            Arc::new(ScheduledDatePolicy),
            Arc::new(RandomCodeGenerator),
            config,
        )
    }

    pub fn with_components(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        policy: Arc<dyn VerificationPolicy>,
        codes: Arc<dyn RedemptionCodeGenerator>,
        config: RewardsEngineConfig,
    ) -> RewardsResult<Self> {
        let redemption = RedemptionConfig {
            window_days: config.redemption_window_days,
            code_attempts: config.code_attempts,
        };
        redemption.window()?;

        let events = EventBus::new(config.event_capacity);
        let partners = Arc::new(PartnerRegistry::new());
        let mutator = Mutator::new(
            store.clone(),
            clock.clone(),
            events.clone(),
            config.mutator.clone(),
        );
        let dispatcher = PartnerDispatcher::spawn(PartnerWorker::new(
            store.clone(),
            partners.clone(),
            clock,
            config.partner.clone(),
        ));

        Ok(Self {
            accounts: AccountLedger::new(mutator.clone()),
            missions: MissionWorkflow::new(mutator.clone(), policy),
            vouchers: VoucherWorkflow::new(mutator, codes, dispatcher, redemption)?,
            store,
            events,
            partners,
        })
    }

    pub fn register_partner(&self, adapter: Arc<dyn PartnerAdapter>) -> RewardsResult<()> {
        tracing::info!(partner_id = adapter.partner_id(), "partner adapter registered");
        self.partners.register(adapter)
    }

    pub fn set_fallback_partner(&self, adapter: Arc<dyn PartnerAdapter>) -> RewardsResult<()> {
        tracing::info!(partner_id = adapter.partner_id(), "fallback partner adapter set");
        self.partners.set_fallback(adapter)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    pub fn backend_label(&self) -> &'static str {
        self.store.backend_label()
    }

    // Accounts

    /// Self-registration as a participant.
    pub async fn register_account(&self, caller: &Caller) -> RewardsResult<Account> {
        self.accounts
            .register(&caller.account_id, Role::Participant)
            .await
    }

    /// Operator provisioning of an account with an explicit role. Returns the
    /// existing account unchanged if one is already stored under `account_id`.
    pub async fn bootstrap_account(&self, account_id: &str, role: Role) -> RewardsResult<Account> {
        match self.accounts.register(account_id, role).await {
            Err(RewardsError::AlreadyExists(_)) => self.accounts.get(account_id).await,
            other => other,
        }
    }

    pub async fn get_account(&self, caller: &Caller, account_id: &str) -> RewardsResult<Account> {
        self.authorize_owner(caller, account_id).await?;
        self.accounts.get(account_id).await
    }

    pub async fn list_transactions(
        &self,
        caller: &Caller,
        account_id: &str,
    ) -> RewardsResult<Vec<PointsTransaction>> {
        self.authorize_owner(caller, account_id).await?;
        self.accounts.transactions(account_id).await
    }

    pub async fn list_redemptions(
        &self,
        caller: &Caller,
        account_id: &str,
    ) -> RewardsResult<Vec<Redemption>> {
        self.authorize_owner(caller, account_id).await?;
        self.vouchers.redemptions_for(account_id).await
    }

    pub async fn audit_balance(
        &self,
        caller: &Caller,
        account_id: &str,
    ) -> RewardsResult<BalanceAudit> {
        self.authorize_owner(caller, account_id).await?;
        self.accounts.audit(account_id).await
    }

    pub async fn award_points_manually(
        &self,
        caller: &Caller,
        account_id: &str,
        amount: i64,
        description: &str,
    ) -> RewardsResult<PointsGrant> {
        self.accounts
            .award_manually(&caller.account_id, account_id, amount, description)
            .await
    }

    pub async fn adjust_points(
        &self,
        caller: &Caller,
        account_id: &str,
        delta: i64,
        reason: &str,
    ) -> RewardsResult<PointsGrant> {
        self.accounts
            .adjust(&caller.account_id, account_id, delta, reason)
            .await
    }

    // Missions

    pub async fn create_mission(
        &self,
        caller: &Caller,
        draft: MissionDraft,
    ) -> RewardsResult<Mission> {
        self.missions.create(&caller.account_id, draft).await
    }

    pub async fn get_mission(&self, mission_id: &str) -> RewardsResult<Mission> {
        self.missions.get(mission_id).await
    }

    pub async fn transition_mission(
        &self,
        caller: &Caller,
        mission_id: &str,
        status: MissionStatus,
    ) -> RewardsResult<Mission> {
        self.missions
            .transition(&caller.account_id, mission_id, status)
            .await
    }

    pub async fn join_mission(&self, caller: &Caller, mission_id: &str) -> RewardsResult<Mission> {
        self.missions.join(&caller.account_id, mission_id).await
    }

    pub async fn complete_mission(
        &self,
        caller: &Caller,
        mission_id: &str,
        payload: Option<VerificationPayload>,
    ) -> RewardsResult<MissionAward> {
        self.missions
            .complete(&caller.account_id, mission_id, payload)
            .await
    }

    // Vouchers and redemptions

    pub async fn create_voucher(
        &self,
        caller: &Caller,
        draft: VoucherDraft,
    ) -> RewardsResult<Voucher> {
        self.vouchers.create(&caller.account_id, draft).await
    }

    pub async fn list_vouchers(&self) -> RewardsResult<Vec<Voucher>> {
        self.vouchers.list().await
    }

    pub async fn restock_voucher(
        &self,
        caller: &Caller,
        voucher_id: &str,
        amount: u32,
    ) -> RewardsResult<Voucher> {
        self.vouchers
            .restock(&caller.account_id, voucher_id, amount)
            .await
    }

    pub async fn set_voucher_active(
        &self,
        caller: &Caller,
        voucher_id: &str,
        active: bool,
    ) -> RewardsResult<Voucher> {
        self.vouchers
            .set_active(&caller.account_id, voucher_id, active)
            .await
    }

    pub async fn redeem_voucher(
        &self,
        caller: &Caller,
        voucher_id: &str,
    ) -> RewardsResult<RedemptionReceipt> {
        self.vouchers.redeem(&caller.account_id, voucher_id).await
    }

    pub async fn get_redemption(
        &self,
        caller: &Caller,
        redemption_id: &str,
    ) -> RewardsResult<Redemption> {
        let redemption = self.vouchers.get_redemption(redemption_id).await?;
        self.authorize_owner(caller, &redemption.account_id).await?;
        Ok(redemption)
    }

    pub async fn mark_voucher_used(
        &self,
        caller: &Caller,
        redemption_id: &str,
    ) -> RewardsResult<Redemption> {
        self.vouchers
            .mark_used(&caller.account_id, redemption_id)
            .await
    }

    pub async fn sweep_expired_redemptions(&self) -> RewardsResult<usize> {
        self.vouchers.sweep_expired().await
    }

    pub async fn requeue_pending_redemptions(&self) -> RewardsResult<usize> {
        self.vouchers.requeue_pending().await
    }

    /// Fail with `PermissionDenied` unless the caller is a stored admin.
    pub async fn require_admin(&self, caller: &Caller) -> RewardsResult<Account> {
        let account = self.caller_account(caller).await?;
        if !account.role.is_admin() {
            return Err(RewardsError::PermissionDenied(format!(
                "caller '{}' is not an admin",
                caller.account_id
            )));
        }
        Ok(account)
    }

    /// Run the expiry sweep on a fixed interval until the task is aborted.
    pub fn spawn_expiry_sweep(&self, every: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = engine.sweep_expired_redemptions().await {
                    tracing::error!(error = %e, "redemption expiry sweep failed");
                }
            }
        })
    }

    async fn caller_account(&self, caller: &Caller) -> RewardsResult<Account> {
        match self.accounts.get(&caller.account_id).await {
            Err(RewardsError::NotFound(_)) => Err(RewardsError::PermissionDenied(format!(
                "caller '{}' has no account",
                caller.account_id
            ))),
            other => other,
        }
    }

    async fn authorize_owner(&self, caller: &Caller, account_id: &str) -> RewardsResult<()> {
        if caller.account_id == account_id {
            return Ok(());
        }
        let account = self.caller_account(caller).await?;
        if account.role.is_admin() {
            Ok(())
        } else {
            Err(RewardsError::PermissionDenied(format!(
                "caller '{}' may not view account '{account_id}'",
                caller.account_id
            )))
        }
    }
}
