//! Rewards ledger core.
//!
//! Point balances, mission completions and voucher redemptions are mutated only
//! through the optimistic-concurrency [`Mutator`]: every multi-record change is a
//! pure transition over a versioned snapshot, committed atomically or retried.
//! Partner fulfilment happens after commit and can only move a redemption from
//! `pending` to `issued`.

#![deny(unsafe_code)]

pub mod accounts;
pub mod clock;
pub mod codegen;
pub mod engine;
pub mod error;
pub mod events;
pub mod missions;
pub mod mutator;
pub mod partner;
pub mod store;
pub mod types;
pub mod verification;
pub mod vouchers;

pub use accounts::AccountLedger;
pub use clock::{Clock, ManualClock, SystemClock};
pub use codegen::{is_well_formed, RandomCodeGenerator, RedemptionCodeGenerator};
pub use engine::{RewardsEngine, RewardsEngineConfig};
pub use error::{ErrorKind, RewardsError, RewardsResult};
pub use events::{EventBus, LedgerEvent};
pub use missions::MissionWorkflow;
pub use mutator::{Mutator, MutatorConfig, Plan, Transition};
pub use partner::{
    DispatchOutcome, IssueRequest, PartnerAdapter, PartnerDispatchConfig, PartnerDispatcher,
    PartnerIssue, PartnerRegistry, PartnerWorker,
};
pub use store::{
    open_store, InMemoryLedgerStore, LedgerStorageConfig, LedgerStore, PostgresLedgerStore,
    Record, RecordKey, RecordKind, StoreError,
};
pub use types::{
    Account, BalanceAudit, Caller, Mission, MissionAward, MissionDraft, MissionStatus,
    PointsGrant, PointsTransaction, Redemption, RedemptionReceipt, RedemptionStatus, Role,
    TransactionType, VerificationPayload, Voucher, VoucherDraft, MAX_POINTS,
};
pub use verification::{ScheduledDatePolicy, VerificationPolicy};
pub use vouchers::{RedemptionConfig, VoucherWorkflow, MAX_REDEMPTION_WINDOW_DAYS};
