use crate::types::{Mission, VerificationPayload};
use chrono::{DateTime, Utc};

/// Pluggable completion verification.
///
/// Runs inside the mission-completion transition, so implementations must be pure
/// functions of their inputs.
pub trait VerificationPolicy: Send + Sync {
    fn verify(
        &self,
        mission: &Mission,
        account_id: &str,
        payload: Option<&VerificationPayload>,
        now: DateTime<Utc>,
    ) -> Result<(), String>;
}

/// Minimum rule: proof must be present and the mission must already have started.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScheduledDatePolicy;

impl VerificationPolicy for ScheduledDatePolicy {
    fn verify(
        &self,
        mission: &Mission,
        _account_id: &str,
        payload: Option<&VerificationPayload>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        match payload {
            None | Some(serde_json::Value::Null) => {
                return Err("verification payload is required".to_string())
            }
            _ => {}
        }

        if mission.scheduled_date > now {
            return Err(format!(
                "mission '{}' is scheduled for {} and cannot be completed yet",
                mission.mission_id, mission.scheduled_date
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MissionStatus;
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn mission(scheduled_date: DateTime<Utc>) -> Mission {
        Mission {
            mission_id: "m1".to_string(),
            title: "Beach cleanup".to_string(),
            organizer_id: "org".to_string(),
            points_reward: 50,
            volunteer_hours: 3,
            status: MissionStatus::Ongoing,
            scheduled_date,
            max_participants: None,
            participants: vec!["u1".to_string()],
            completed_participants: BTreeSet::new(),
            created_at: scheduled_date,
            updated_at: scheduled_date,
        }
    }

    #[test]
    fn requires_payload_and_past_schedule() {
        let now = Utc::now();
        let policy = ScheduledDatePolicy;
        let proof = serde_json::json!({"photo": "ipfs://x"});

        assert!(policy
            .verify(&mission(now - Duration::hours(1)), "u1", Some(&proof), now)
            .is_ok());
        assert!(policy
            .verify(&mission(now - Duration::hours(1)), "u1", None, now)
            .is_err());
        assert!(policy
            .verify(
                &mission(now - Duration::hours(1)),
                "u1",
                Some(&serde_json::Value::Null),
                now
            )
            .is_err());
        assert!(policy
            .verify(&mission(now + Duration::days(1)), "u1", Some(&proof), now)
            .is_err());
    }
}
