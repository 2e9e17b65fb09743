use chrono::{DateTime, Utc};
use serde::Serialize;

use super::domain::{ApprovalState, Guardian, GuardianId, ResubmissionPolicy};
use super::error::EnrollmentError;
use super::store::{StoreError, StoreTransaction};

/// Recorded change of a guardian's review state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApprovalTransition {
    pub from: ApprovalState,
    pub to: ApprovalState,
}

impl ApprovalTransition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// `pending -> approved | rejected`; a decided guardian may be re-decided.
pub struct ApprovalStateMachine;

impl ApprovalStateMachine {
    pub fn target(approved: bool) -> ApprovalState {
        if approved {
            ApprovalState::Approved
        } else {
            ApprovalState::Rejected
        }
    }

    pub fn transition(current: ApprovalState, approved: bool) -> ApprovalTransition {
        ApprovalTransition {
            from: current,
            to: Self::target(approved),
        }
    }

    /// Only pending forms are eligible for expiry.
    pub fn is_reapable(state: ApprovalState) -> bool {
        state == ApprovalState::Pending
    }

    /// Whether a new submission resets the guardian to pending.
    pub fn on_resubmission(
        policy: ResubmissionPolicy,
        current: ApprovalState,
    ) -> Result<bool, EnrollmentError> {
        match (policy, current) {
            (ResubmissionPolicy::RejectApproved, ApprovalState::Approved) => {
                Err(EnrollmentError::Conflict(
                    "approved enrollment forms cannot be modified".to_string(),
                ))
            }
            (ResubmissionPolicy::RejectApproved, _) => Ok(false),
            (ResubmissionPolicy::ResetToPending, state) => Ok(state.is_decided()),
        }
    }

    pub fn decide<T: StoreTransaction>(
        tx: &mut T,
        guardian_id: GuardianId,
        approved: bool,
        at: DateTime<Utc>,
    ) -> Result<(Guardian, ApprovalTransition), EnrollmentError> {
        let current = tx
            .get_aggregate(guardian_id)
            .ok_or_else(|| EnrollmentError::NotFound(format!("guardian {guardian_id}")))?
            .guardian
            .approval;
        let transition = Self::transition(current, approved);
        let guardian = tx
            .set_approval(guardian_id, transition.to, at)
            .map_err(|err| match err {
                StoreError::NotFound => EnrollmentError::NotFound(format!("guardian {guardian_id}")),
                other => other.into(),
            })?;
        Ok((guardian, transition))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_toggle_between_states() {
        let first = ApprovalStateMachine::transition(ApprovalState::Pending, true);
        assert_eq!(first.to, ApprovalState::Approved);
        assert!(first.changed());

        let toggled = ApprovalStateMachine::transition(first.to, false);
        assert_eq!(toggled.from, ApprovalState::Approved);
        assert_eq!(toggled.to, ApprovalState::Rejected);

        let repeated = ApprovalStateMachine::transition(ApprovalState::Rejected, false);
        assert!(!repeated.changed());
    }

    #[test]
    fn only_pending_is_reapable() {
        assert!(ApprovalStateMachine::is_reapable(ApprovalState::Pending));
        assert!(!ApprovalStateMachine::is_reapable(ApprovalState::Approved));
        assert!(!ApprovalStateMachine::is_reapable(ApprovalState::Rejected));
    }

    #[test]
    fn expiry_follows_reapable_states() {
        use chrono::{Duration, TimeZone};

        use crate::enrollment::domain::GuardianIdentity;

        let now = Utc
            .with_ymd_and_hms(2025, 6, 1, 8, 0, 0)
            .single()
            .expect("valid timestamp");
        let mut guardian = Guardian {
            id: GuardianId(1),
            identity: GuardianIdentity("ana".to_string()),
            national_id: "0912345678".to_string(),
            phone: None,
            email: None,
            approval: ApprovalState::Pending,
            submitted_at: now - Duration::days(60),
            expires_at: None,
            decided_at: None,
        };
        let cutoff = now - Duration::days(30);

        for state in [ApprovalState::Pending, ApprovalState::Approved, ApprovalState::Rejected] {
            guardian.approval = state;
            assert_eq!(
                guardian.is_expired(cutoff, now),
                ApprovalStateMachine::is_reapable(state),
                "{state:?}"
            );
        }
    }

    #[test]
    fn resubmission_policy_table() {
        use ApprovalState::*;
        use ResubmissionPolicy::*;

        assert!(matches!(
            ApprovalStateMachine::on_resubmission(RejectApproved, Approved),
            Err(EnrollmentError::Conflict(_))
        ));
        assert!(!ApprovalStateMachine::on_resubmission(RejectApproved, Rejected).expect("allowed"));
        assert!(!ApprovalStateMachine::on_resubmission(RejectApproved, Pending).expect("allowed"));
        assert!(ApprovalStateMachine::on_resubmission(ResetToPending, Approved).expect("allowed"));
        assert!(ApprovalStateMachine::on_resubmission(ResetToPending, Rejected).expect("allowed"));
        assert!(!ApprovalStateMachine::on_resubmission(ResetToPending, Pending).expect("allowed"));
    }
}
