use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use rewards_core::{
    Caller, Clock, ErrorKind, InMemoryLedgerStore, LedgerEvent, ManualClock, MissionDraft,
    MissionStatus, MutatorConfig, RedemptionStatus, RewardsEngine, RewardsEngineConfig,
    RewardsError, Role, TransactionType, VoucherDraft,
};
use std::collections::HashSet;
use std::sync::Arc;

struct Harness {
    engine: RewardsEngine,
    clock: Arc<ManualClock>,
    admin: Caller,
    organizer: Caller,
}

async fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap(),
    ));
    let config = RewardsEngineConfig {
        mutator: MutatorConfig {
            max_attempts: 64,
            ..MutatorConfig::default()
        },
        ..RewardsEngineConfig::default()
    };
    let engine =
        RewardsEngine::with_store(Arc::new(InMemoryLedgerStore::new()), clock.clone(), config)
            .unwrap();
    engine.bootstrap_account("admin", Role::Admin).await.unwrap();
    engine
        .bootstrap_account("organizer", Role::Organizer)
        .await
        .unwrap();
    Harness {
        engine,
        clock,
        admin: Caller::new("admin"),
        organizer: Caller::new("organizer"),
    }
}

impl Harness {
    async fn participant(&self, id: &str, balance: i64) -> Caller {
        let caller = Caller::new(id);
        self.engine.register_account(&caller).await.unwrap();
        if balance > 0 {
            self.engine
                .award_points_manually(&self.admin, id, balance, "opening balance")
                .await
                .unwrap();
        }
        caller
    }

    async fn voucher(&self, cost: u64, stock: u32) -> String {
        self.engine
            .create_voucher(
                &self.admin,
                VoucherDraft {
                    title: "Bike repair".to_string(),
                    partner_id: "bikeshop".to_string(),
                    points_cost: cost,
                    stock,
                    expiry_date: None,
                },
            )
            .await
            .unwrap()
            .voucher_id
    }

    async fn open_mission(&self, reward: u64) -> String {
        let mission = self
            .engine
            .create_mission(
                &self.organizer,
                MissionDraft {
                    title: "Food bank shift".to_string(),
                    points_reward: reward,
                    volunteer_hours: 4,
                    scheduled_date: self.clock.now() - Duration::hours(1),
                    max_participants: None,
                },
            )
            .await
            .unwrap();
        self.engine
            .transition_mission(&self.organizer, &mission.mission_id, MissionStatus::Ongoing)
            .await
            .unwrap();
        mission.mission_id
    }

    async fn assert_balanced(&self, account_id: &str) {
        let audit = self
            .engine
            .audit_balance(&self.admin, account_id)
            .await
            .unwrap();
        assert!(
            audit.consistent,
            "balance {} != transaction sum {} for {account_id}",
            audit.balance, audit.transaction_sum
        );
    }
}

fn proof() -> Option<serde_json::Value> {
    Some(serde_json::json!({"signed_off_by": "organizer"}))
}

#[tokio::test]
async fn redeeming_last_unit_then_sold_out() {
    let h = harness().await;
    let alice = h.participant("alice", 500).await;
    let bob = h.participant("bob", 500).await;
    let voucher_id = h.voucher(300, 1).await;

    let receipt = h.engine.redeem_voucher(&alice, &voucher_id).await.unwrap();
    assert_eq!(receipt.new_balance, 200);
    assert_eq!(receipt.voucher.stock, 0);

    let redemption = h
        .engine
        .get_redemption(&alice, &receipt.redemption_id)
        .await
        .unwrap();
    assert_eq!(redemption.status, RedemptionStatus::Pending);

    for caller in [&alice, &bob] {
        let err = h
            .engine
            .redeem_voucher(caller, &voucher_id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    h.assert_balanced("alice").await;
    h.assert_balanced("bob").await;
}

#[tokio::test]
async fn completing_without_joining_changes_nothing() {
    let h = harness().await;
    let carol = h.participant("carol", 0).await;
    let mission_id = h.open_mission(50).await;

    let err = h
        .engine
        .complete_mission(&carol, &mission_id, proof())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

    let account = h.engine.get_account(&carol, "carol").await.unwrap();
    assert_eq!(account.point_balance, 0);
    assert!(h
        .engine
        .list_transactions(&carol, "carol")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn completion_credits_once_and_publishes_events() {
    let h = harness().await;
    let dave = h.participant("dave", 0).await;
    let mission_id = h.open_mission(50).await;
    h.engine.join_mission(&dave, &mission_id).await.unwrap();
    let mut events = h.engine.subscribe();

    let award = h
        .engine
        .complete_mission(&dave, &mission_id, proof())
        .await
        .unwrap();
    assert_eq!(award.points_awarded, 50);
    assert_eq!(award.new_balance, 50);

    let txs = h.engine.list_transactions(&dave, "dave").await.unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].amount, 50);
    assert_eq!(txs[0].transaction_type, TransactionType::MissionCompletion);
    assert_eq!(txs[0].related_id.as_deref(), Some(mission_id.as_str()));

    let second = h
        .engine
        .complete_mission(&dave, &mission_id, proof())
        .await
        .unwrap_err();
    assert_eq!(second.kind(), ErrorKind::AlreadyExists);
    assert_eq!(
        h.engine.list_transactions(&dave, "dave").await.unwrap().len(),
        1
    );

    assert!(matches!(
        events.recv().await.unwrap(),
        LedgerEvent::BalanceChanged {
            old_balance: 0,
            new_balance: 50,
            ..
        }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        LedgerEvent::MissionCompleted {
            points_awarded: 50,
            ..
        }
    ));
}

#[tokio::test]
async fn expired_redemption_is_swept_and_unusable() {
    let h = harness().await;
    let erin = h.participant("erin", 200).await;
    let voucher_id = h.voucher(100, 5).await;
    let receipt = h.engine.redeem_voucher(&erin, &voucher_id).await.unwrap();

    h.clock.advance(Duration::days(30) + Duration::seconds(1));
    assert_eq!(h.engine.sweep_expired_redemptions().await.unwrap(), 1);

    let redemption = h
        .engine
        .get_redemption(&erin, &receipt.redemption_id)
        .await
        .unwrap();
    assert_eq!(redemption.status, RedemptionStatus::Expired);

    let err = h
        .engine
        .mark_voucher_used(&erin, &receipt.redemption_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

    // Expiry never refunds.
    let account = h.engine.get_account(&erin, "erin").await.unwrap();
    assert_eq!(account.point_balance, 100);
    h.assert_balanced("erin").await;
}

#[tokio::test]
async fn failed_redemption_leaves_no_trace() {
    let h = harness().await;
    let frank = h.participant("frank", 100).await;
    let voucher_id = h.voucher(300, 2).await;

    let err = h
        .engine
        .redeem_voucher(&frank, &voucher_id)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RewardsError::InsufficientPoints {
            required: 300,
            available: 100
        }
    );

    assert!(h
        .engine
        .list_redemptions(&frank, "frank")
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        h.engine.list_transactions(&frank, "frank").await.unwrap().len(),
        1
    );
    let vouchers = h.engine.list_vouchers().await.unwrap();
    assert_eq!(vouchers[0].stock, 2);
}

#[tokio::test]
async fn other_participants_cannot_read_or_use_foreign_state() {
    let h = harness().await;
    let gina = h.participant("gina", 200).await;
    let hank = h.participant("hank", 0).await;
    let voucher_id = h.voucher(100, 5).await;
    let receipt = h.engine.redeem_voucher(&gina, &voucher_id).await.unwrap();

    let err = h.engine.get_account(&hank, "gina").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let err = h
        .engine
        .get_redemption(&hank, &receipt.redemption_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let err = h
        .engine
        .mark_voucher_used(&hank, &receipt.redemption_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    h.engine.get_account(&h.admin, "gina").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redemptions_never_oversell() {
    const BUYERS: usize = 12;
    const STOCK: u32 = 3;

    let h = harness().await;
    let mut buyers = Vec::new();
    for i in 0..BUYERS {
        buyers.push(h.participant(&format!("buyer-{i}"), 1_000).await);
    }
    let voucher_id = h.voucher(100, STOCK).await;

    let mut handles = Vec::new();
    for buyer in buyers {
        let engine = h.engine.clone();
        let voucher_id = voucher_id.clone();
        handles.push(tokio::spawn(async move {
            engine.redeem_voucher(&buyer, &voucher_id).await
        }));
    }

    let mut codes = HashSet::new();
    let mut failures = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(receipt) => {
                assert!(codes.insert(receipt.redemption_code));
            }
            Err(err) => {
                assert!(
                    matches!(err.kind(), ErrorKind::ResourceExhausted | ErrorKind::Conflict),
                    "unexpected failure {err}"
                );
                failures += 1;
            }
        }
    }

    assert_eq!(codes.len(), STOCK as usize);
    assert_eq!(failures, BUYERS - STOCK as usize);
    let vouchers = h.engine.list_vouchers().await.unwrap();
    assert_eq!(vouchers[0].stock, 0);

    for i in 0..BUYERS {
        h.assert_balanced(&format!("buyer-{i}")).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completions_by_one_account_credit_once() {
    let h = harness().await;
    let ivy = h.participant("ivy", 0).await;
    let mission_id = h.open_mission(75).await;
    h.engine.join_mission(&ivy, &mission_id).await.unwrap();

    let attempts = (0..8).map(|_| {
        let engine = h.engine.clone();
        let ivy = ivy.clone();
        let mission_id = mission_id.clone();
        tokio::spawn(async move { engine.complete_mission(&ivy, &mission_id, proof()).await })
    });
    let results = futures::future::join_all(attempts).await;

    let successes = results
        .into_iter()
        .map(|joined| joined.unwrap())
        .filter(Result::is_ok)
        .count();
    assert_eq!(successes, 1);

    let account = h.engine.get_account(&ivy, "ivy").await.unwrap();
    assert_eq!(account.point_balance, 75);
    h.assert_balanced("ivy").await;
}

#[tokio::test]
async fn balance_stays_within_transaction_range() {
    let h = harness().await;
    let whale = h.participant("whale", i64::MAX).await;

    let err = h
        .engine
        .award_points_manually(&h.admin, "whale", 1, "overflow")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

    let audit = h.engine.audit_balance(&whale, "whale").await.unwrap();
    assert!(audit.consistent);
    assert_eq!(audit.balance, i64::MAX as u64);
    assert_eq!(audit.transaction_sum, i64::MAX);
}

#[tokio::test]
async fn engine_refuses_unrepresentable_redemption_window() {
    for redemption_window_days in [0, -1, 200_000_000] {
        let config = RewardsEngineConfig {
            redemption_window_days,
            ..RewardsEngineConfig::default()
        };
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let err = RewardsEngine::with_store(Arc::new(InMemoryLedgerStore::new()), clock, config)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}

#[tokio::test]
async fn redemption_codes_are_pairwise_distinct() {
    let h = harness().await;
    let jo = h.participant("jo", 10_000).await;
    let voucher_id = h.voucher(10, 500).await;

    let mut codes = HashSet::new();
    for _ in 0..200 {
        let receipt = h.engine.redeem_voucher(&jo, &voucher_id).await.unwrap();
        assert!(rewards_core::is_well_formed(&receipt.redemption_code));
        assert!(codes.insert(receipt.redemption_code));
    }
}

#[derive(Debug, Clone)]
enum Op {
    Award(i64),
    Adjust(i64),
    Redeem(usize),
    Complete(usize),
    Sweep(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1i64..400).prop_map(Op::Award),
        (-200i64..200).prop_map(Op::Adjust),
        (0usize..2).prop_map(Op::Redeem),
        (0usize..3).prop_map(Op::Complete),
        (0i64..40).prop_map(Op::Sweep),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn balance_always_equals_transaction_sum(ops in prop::collection::vec(op(), 1..30)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let h = harness().await;
            let kim = h.participant("kim", 0).await;
            let vouchers = [h.voucher(120, 3).await, h.voucher(45, 10).await];
            let mut missions = Vec::new();
            for reward in [30, 60, 90] {
                let mission_id = h.open_mission(reward).await;
                h.engine.join_mission(&kim, &mission_id).await.unwrap();
                missions.push(mission_id);
            }

            for op in ops {
                let outcome = match op {
                    Op::Award(amount) => h
                        .engine
                        .award_points_manually(&h.admin, "kim", amount, "bonus")
                        .await
                        .map(|_| ()),
                    Op::Adjust(delta) => h
                        .engine
                        .adjust_points(&h.admin, "kim", delta, "correction")
                        .await
                        .map(|_| ()),
                    Op::Redeem(i) => h
                        .engine
                        .redeem_voucher(&kim, &vouchers[i])
                        .await
                        .map(|_| ()),
                    Op::Complete(i) => h
                        .engine
                        .complete_mission(&kim, &missions[i], proof())
                        .await
                        .map(|_| ()),
                    Op::Sweep(days) => {
                        h.clock.advance(Duration::days(days));
                        h.engine.sweep_expired_redemptions().await.map(|_| ())
                    }
                };
                if let Err(err) = outcome {
                    assert_ne!(err.kind(), ErrorKind::Internal, "{err}");
                }
                h.assert_balanced("kim").await;
            }
        });
    }
}
