//! Mission lifecycle and the completion workflow.
//!
//! Completion runs as one Mutator transition over the mission and the account: the
//! completion marker, the balance credit and the `mission_completion` transaction
//! commit together or not at all.

use crate::accounts::require_role;
use crate::error::{RewardsError, RewardsResult};
use crate::events::LedgerEvent;
use crate::mutator::{Mutator, Plan, Transition};
use crate::store::{Record, RecordKey, Snapshot};
use crate::types::{
    Mission, MissionAward, MissionDraft, MissionStatus, PointsTransaction, Role,
    TransactionType, VerificationPayload,
};
use crate::verification::VerificationPolicy;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

struct CreateMission {
    caller_id: String,
    mission_id: String,
    draft: MissionDraft,
}

impl Transition for CreateMission {
    type Output = Mission;

    fn name(&self) -> &'static str {
        "create_mission"
    }

    fn read_set(&self) -> Vec<RecordKey> {
        vec![RecordKey::account(&self.caller_id)]
    }

    fn apply(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> RewardsResult<Plan<Mission>> {
        require_role(snapshot, &self.caller_id, Role::can_organize, "create missions")?;

        let mission = Mission {
            mission_id: self.mission_id.clone(),
            title: self.draft.title.trim().to_string(),
            organizer_id: self.caller_id.clone(),
            points_reward: self.draft.points_reward,
            volunteer_hours: self.draft.volunteer_hours,
            status: MissionStatus::Draft,
            scheduled_date: self.draft.scheduled_date,
            max_participants: self.draft.max_participants,
            participants: Vec::new(),
            completed_participants: Default::default(),
            created_at: now,
            updated_at: now,
        };
        Ok(Plan::new(mission.clone()).insert(Record::Mission(mission)))
    }
}

struct TransitionMission {
    caller_id: String,
    mission_id: String,
    next: MissionStatus,
}

impl Transition for TransitionMission {
    type Output = Mission;

    fn name(&self) -> &'static str {
        "transition_mission"
    }

    fn read_set(&self) -> Vec<RecordKey> {
        vec![
            RecordKey::account(&self.caller_id),
            RecordKey::mission(&self.mission_id),
        ]
    }

    fn apply(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> RewardsResult<Plan<Mission>> {
        let mut mission = snapshot
            .mission(&self.mission_id)
            .cloned()
            .ok_or_else(|| RewardsError::not_found("mission", &self.mission_id))?;

        let caller = require_role(snapshot, &self.caller_id, Role::can_organize, "manage missions")?;
        if mission.organizer_id != caller.account_id && !caller.role.is_admin() {
            return Err(RewardsError::PermissionDenied(format!(
                "caller '{}' does not organize mission '{}'",
                self.caller_id, self.mission_id
            )));
        }

        if !mission.status.can_advance_to(self.next) {
            return Err(RewardsError::FailedPrecondition(format!(
                "mission '{}' cannot move from {:?} to {:?}",
                self.mission_id, mission.status, self.next
            )));
        }

        mission.status = self.next;
        mission.updated_at = now;
        Ok(Plan::new(mission.clone()).update(Record::Mission(mission)))
    }
}

struct JoinMission {
    account_id: String,
    mission_id: String,
}

impl Transition for JoinMission {
    type Output = Mission;

    fn name(&self) -> &'static str {
        "join_mission"
    }

    fn read_set(&self) -> Vec<RecordKey> {
        vec![
            RecordKey::account(&self.account_id),
            RecordKey::mission(&self.mission_id),
        ]
    }

    fn apply(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> RewardsResult<Plan<Mission>> {
        let mut mission = snapshot
            .mission(&self.mission_id)
            .cloned()
            .ok_or_else(|| RewardsError::not_found("mission", &self.mission_id))?;
        if snapshot.account(&self.account_id).is_none() {
            return Err(RewardsError::not_found("account", &self.account_id));
        }

        if !mission.status.accepts_participants() {
            return Err(RewardsError::FailedPrecondition(format!(
                "mission '{}' is {:?} and not open for joining",
                self.mission_id, mission.status
            )));
        }
        if mission.is_participant(&self.account_id) {
            return Err(RewardsError::AlreadyExists(format!(
                "account '{}' already joined mission '{}'",
                self.account_id, self.mission_id
            )));
        }
        if mission.is_full() {
            return Err(RewardsError::ResourceExhausted(format!(
                "mission '{}' is full",
                self.mission_id
            )));
        }

        mission.participants.push(self.account_id.clone());
        mission.updated_at = now;
        Ok(Plan::new(mission.clone()).update(Record::Mission(mission)))
    }
}

struct CompleteMission {
    account_id: String,
    mission_id: String,
    payload: Option<VerificationPayload>,
    policy: Arc<dyn VerificationPolicy>,
}

impl Transition for CompleteMission {
    type Output = MissionAward;

    fn name(&self) -> &'static str {
        "complete_mission"
    }

    fn read_set(&self) -> Vec<RecordKey> {
        vec![
            RecordKey::mission(&self.mission_id),
            RecordKey::account(&self.account_id),
        ]
    }

    fn apply(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> RewardsResult<Plan<MissionAward>> {
        let mut mission = snapshot
            .mission(&self.mission_id)
            .cloned()
            .ok_or_else(|| RewardsError::not_found("mission", &self.mission_id))?;
        let mut account = snapshot
            .account(&self.account_id)
            .cloned()
            .ok_or_else(|| RewardsError::not_found("account", &self.account_id))?;

        if !mission.is_participant(&self.account_id) {
            return Err(RewardsError::FailedPrecondition(format!(
                "account '{}' is not a participant of mission '{}'",
                self.account_id, self.mission_id
            )));
        }
        if mission.has_completed(&self.account_id) {
            return Err(RewardsError::AlreadyExists(format!(
                "account '{}' already completed mission '{}'",
                self.account_id, self.mission_id
            )));
        }
        if mission.status == MissionStatus::Cancelled {
            return Err(RewardsError::FailedPrecondition(format!(
                "mission '{}' was cancelled",
                self.mission_id
            )));
        }
        self.policy
            .verify(&mission, &self.account_id, self.payload.as_ref(), now)
            .map_err(RewardsError::FailedPrecondition)?;

        let reward = i64::try_from(mission.points_reward).map_err(|_| {
            RewardsError::Internal(format!(
                "mission '{}' reward does not fit a transaction amount",
                self.mission_id
            ))
        })?;

        let old_balance = account.point_balance;
        account.apply_delta(reward, now)?;
        account.total_volunteer_hours = account
            .total_volunteer_hours
            .saturating_add(mission.volunteer_hours);
        let new_balance = account.point_balance;

        mission.completed_participants.insert(self.account_id.clone());
        mission.updated_at = now;

        let transaction = PointsTransaction::new(
            &self.account_id,
            reward,
            TransactionType::MissionCompletion,
            Some(self.mission_id.clone()),
            now,
        )
        .with_description(format!("Completed mission: {}", mission.title));

        let points_awarded = mission.points_reward;
        let award = MissionAward {
            account_id: self.account_id.clone(),
            mission_id: self.mission_id.clone(),
            points_awarded,
            new_balance,
            transaction_id: transaction.transaction_id.clone(),
        };

        Ok(Plan::new(award)
            .update(Record::Mission(mission))
            .update(Record::Account(account))
            .insert(Record::Transaction(transaction))
            .emit(LedgerEvent::BalanceChanged {
                account_id: self.account_id.clone(),
                old_balance,
                new_balance,
                reason: TransactionType::MissionCompletion,
                occurred_at: now,
            })
            .emit(LedgerEvent::MissionCompleted {
                account_id: self.account_id.clone(),
                mission_id: self.mission_id.clone(),
                points_awarded,
                occurred_at: now,
            }))
    }
}

/// Mission lifecycle plus the atomic completion award.
#[derive(Clone)]
pub struct MissionWorkflow {
    mutator: Mutator,
    policy: Arc<dyn VerificationPolicy>,
}

impl MissionWorkflow {
    pub fn new(mutator: Mutator, policy: Arc<dyn VerificationPolicy>) -> Self {
        Self { mutator, policy }
    }

    pub async fn create(&self, caller_id: &str, draft: MissionDraft) -> RewardsResult<Mission> {
        if draft.title.trim().is_empty() {
            return Err(RewardsError::InvalidArgument(
                "mission title is required".to_string(),
            ));
        }
        if draft.points_reward == 0 {
            return Err(RewardsError::InvalidArgument(
                "mission points reward must be positive".to_string(),
            ));
        }
        if draft.points_reward > crate::types::MAX_POINTS {
            return Err(RewardsError::InvalidArgument(format!(
                "mission points reward may not exceed {}",
                crate::types::MAX_POINTS
            )));
        }
        if draft.max_participants == Some(0) {
            return Err(RewardsError::InvalidArgument(
                "max participants must be positive when set".to_string(),
            ));
        }

        let mission = self
            .mutator
            .execute(&CreateMission {
                caller_id: caller_id.to_string(),
                mission_id: Uuid::new_v4().to_string(),
                draft,
            })
            .await?;
        tracing::info!(
            mission_id = %mission.mission_id,
            organizer_id = %mission.organizer_id,
            points_reward = mission.points_reward,
            "mission created"
        );
        Ok(mission)
    }

    pub async fn get(&self, mission_id: &str) -> RewardsResult<Mission> {
        match self
            .mutator
            .store()
            .get(&RecordKey::mission(mission_id))
            .await?
            .map(|v| v.record)
        {
            Some(Record::Mission(mission)) => Ok(mission),
            _ => Err(RewardsError::not_found("mission", mission_id)),
        }
    }

    pub async fn transition(
        &self,
        caller_id: &str,
        mission_id: &str,
        next: MissionStatus,
    ) -> RewardsResult<Mission> {
        let mission = self
            .mutator
            .execute(&TransitionMission {
                caller_id: caller_id.to_string(),
                mission_id: mission_id.to_string(),
                next,
            })
            .await?;
        tracing::info!(mission_id, status = ?mission.status, "mission status changed");
        Ok(mission)
    }

    pub async fn join(&self, account_id: &str, mission_id: &str) -> RewardsResult<Mission> {
        let mission = self
            .mutator
            .execute(&JoinMission {
                account_id: account_id.to_string(),
                mission_id: mission_id.to_string(),
            })
            .await?;
        tracing::info!(
            account_id,
            mission_id,
            participants = mission.participants.len(),
            "mission joined"
        );
        Ok(mission)
    }

    pub async fn complete(
        &self,
        account_id: &str,
        mission_id: &str,
        payload: Option<VerificationPayload>,
    ) -> RewardsResult<MissionAward> {
        let award = self
            .mutator
            .execute(&CompleteMission {
                account_id: account_id.to_string(),
                mission_id: mission_id.to_string(),
                payload,
                policy: self.policy.clone(),
            })
            .await?;
        tracing::info!(
            account_id,
            mission_id,
            points_awarded = award.points_awarded,
            new_balance = award.new_balance,
            "mission completion awarded"
        );
        Ok(award)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountLedger;
    use crate::clock::{Clock, ManualClock};
    use crate::error::ErrorKind;
    use crate::events::EventBus;
    use crate::mutator::MutatorConfig;
    use crate::store::InMemoryLedgerStore;
    use crate::verification::ScheduledDatePolicy;
    use chrono::{Duration, TimeZone};

    struct Fixture {
        accounts: AccountLedger,
        missions: MissionWorkflow,
        clock: Arc<ManualClock>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        ));
        let mutator = Mutator::new(
            Arc::new(InMemoryLedgerStore::new()),
            clock.clone(),
            EventBus::new(16),
            MutatorConfig::default(),
        );
        let accounts = AccountLedger::new(mutator.clone());
        accounts.register("org", Role::Organizer).await.unwrap();
        accounts.register("u1", Role::Participant).await.unwrap();
        Fixture {
            accounts,
            missions: MissionWorkflow::new(mutator, Arc::new(ScheduledDatePolicy)),
            clock,
        }
    }

    fn draft(scheduled_date: DateTime<Utc>, max_participants: Option<u32>) -> MissionDraft {
        MissionDraft {
            title: "Park cleanup".to_string(),
            points_reward: 50,
            volunteer_hours: 2,
            scheduled_date,
            max_participants,
        }
    }

    async fn published(f: &Fixture, max_participants: Option<u32>) -> Mission {
        let scheduled = f.clock.now() - Duration::hours(2);
        let mission = f
            .missions
            .create("org", draft(scheduled, max_participants))
            .await
            .unwrap();
        f.missions
            .transition("org", &mission.mission_id, MissionStatus::Published)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn participants_cannot_create_missions() {
        let f = fixture().await;
        let err = f
            .missions
            .create("u1", draft(f.clock.now(), None))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn reward_beyond_the_points_range_is_rejected() {
        let f = fixture().await;
        let mut oversized = draft(f.clock.now(), None);
        oversized.points_reward = crate::types::MAX_POINTS + 1;
        let err = f.missions.create("org", oversized).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn lifecycle_only_moves_forward() {
        let f = fixture().await;
        let mission = published(&f, None).await;
        let err = f
            .missions
            .transition("org", &mission.mission_id, MissionStatus::Draft)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

        let err = f
            .missions
            .transition("u1", &mission.mission_id, MissionStatus::Ongoing)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn join_rules() {
        let f = fixture().await;
        f.accounts.register("u2", Role::Participant).await.unwrap();
        let mission = published(&f, Some(1)).await;

        f.missions.join("u1", &mission.mission_id).await.unwrap();
        let dup = f.missions.join("u1", &mission.mission_id).await.unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::AlreadyExists);
        let full = f.missions.join("u2", &mission.mission_id).await.unwrap_err();
        assert_eq!(full.kind(), ErrorKind::ResourceExhausted);
        let ghost = f.missions.join("ghost", &mission.mission_id).await.unwrap_err();
        assert_eq!(ghost.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn completion_awards_once() {
        let f = fixture().await;
        let mission = published(&f, None).await;
        f.missions.join("u1", &mission.mission_id).await.unwrap();

        let proof = Some(serde_json::json!({"checked_in": true}));
        let award = f
            .missions
            .complete("u1", &mission.mission_id, proof.clone())
            .await
            .unwrap();
        assert_eq!(award.points_awarded, 50);
        assert_eq!(award.new_balance, 50);

        let err = f
            .missions
            .complete("u1", &mission.mission_id, proof)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let account = f.accounts.get("u1").await.unwrap();
        assert_eq!(account.point_balance, 50);
        assert_eq!(account.total_volunteer_hours, 2);
        assert_eq!(f.accounts.transactions("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completion_requires_participation_and_proof() {
        let f = fixture().await;
        let mission = published(&f, None).await;

        let err = f
            .missions
            .complete("u1", &mission.mission_id, Some(serde_json::json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

        f.missions.join("u1", &mission.mission_id).await.unwrap();
        let err = f
            .missions
            .complete("u1", &mission.mission_id, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
        assert_eq!(f.accounts.get("u1").await.unwrap().point_balance, 0);
    }

    #[tokio::test]
    async fn future_missions_cannot_be_completed_yet() {
        let f = fixture().await;
        let mission = f
            .missions
            .create("org", draft(f.clock.now() + Duration::days(1), None))
            .await
            .unwrap();
        f.missions
            .transition("org", &mission.mission_id, MissionStatus::Published)
            .await
            .unwrap();
        f.missions.join("u1", &mission.mission_id).await.unwrap();

        let proof = Some(serde_json::json!({"checked_in": true}));
        let err = f
            .missions
            .complete("u1", &mission.mission_id, proof.clone())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

        f.clock.advance(Duration::days(2));
        f.missions
            .complete("u1", &mission.mission_id, proof)
            .await
            .unwrap();
    }
}
