use super::common::*;
use crate::config::EnrollmentConfig;
use crate::enrollment::domain::{ApprovalState, GuardianId};
use crate::enrollment::{EnrollmentError, InMemoryEntityStore, ResubmissionPolicy, TemplateKey};

#[tokio::test]
async fn admin_can_approve_then_reject() {
    let harness = harness();
    let submitted = harness
        .service
        .submit_form(&ana(), ana_form())
        .await
        .expect("submission succeeds");
    let guardian_id = submitted.aggregate.guardian.id;

    let approved = harness
        .service
        .decide_approval(&admin(), guardian_id, true)
        .await
        .expect("approval succeeds");
    assert_eq!(approved.transition.from, ApprovalState::Pending);
    assert_eq!(approved.aggregate.guardian.approval, ApprovalState::Approved);
    assert_eq!(approved.aggregate.guardian.decided_at, Some(start()));

    let rejected = harness
        .service
        .decide_approval(&admin(), guardian_id, false)
        .await
        .expect("toggle succeeds");
    assert_eq!(rejected.transition.from, ApprovalState::Approved);
    assert_eq!(rejected.aggregate.guardian.approval, ApprovalState::Rejected);

    assert_eq!(
        harness.notifier.templates(),
        vec![
            TemplateKey::FormReceived,
            TemplateKey::FormApproved,
            TemplateKey::FormRejected,
        ]
    );
}

#[tokio::test]
async fn guardians_cannot_decide() {
    let harness = harness();
    let submitted = harness
        .service
        .submit_form(&ana(), ana_form())
        .await
        .expect("submission succeeds");

    let err = harness
        .service
        .decide_approval(&ana(), submitted.aggregate.guardian.id, true)
        .await
        .expect_err("guardian is not an admin");
    assert!(matches!(err, EnrollmentError::Forbidden(_)));

    let stored = harness
        .service
        .get_my_submission(&ana())
        .await
        .expect("still stored");
    assert_eq!(stored.guardian.approval, ApprovalState::Pending);
}

#[tokio::test]
async fn deciding_unknown_guardian_is_not_found() {
    let harness = harness();
    let err = harness
        .service
        .decide_approval(&admin(), GuardianId(404), true)
        .await
        .expect_err("no such guardian");
    assert!(matches!(err, EnrollmentError::NotFound(_)));
}

#[tokio::test]
async fn approved_forms_are_frozen_by_default() {
    let harness = harness();
    let submitted = harness
        .service
        .submit_form(&ana(), ana_form())
        .await
        .expect("submission succeeds");
    harness
        .service
        .decide_approval(&admin(), submitted.aggregate.guardian.id, true)
        .await
        .expect("approval succeeds");

    let mut edited = ana_form();
    edited.phone = Some("0990000000".to_string());
    let err = harness
        .service
        .submit_form(&ana(), edited)
        .await
        .expect_err("approved form is frozen");
    assert!(matches!(err, EnrollmentError::Conflict(_)));

    let stored = harness
        .service
        .get_my_submission(&ana())
        .await
        .expect("stored");
    assert_eq!(stored.guardian.phone.as_deref(), Some("0991234567"));
}

#[tokio::test]
async fn rejected_guardian_may_edit_and_stays_rejected() {
    let harness = harness();
    let submitted = harness
        .service
        .submit_form(&ana(), ana_form())
        .await
        .expect("submission succeeds");
    harness
        .service
        .decide_approval(&admin(), submitted.aggregate.guardian.id, false)
        .await
        .expect("rejection succeeds");

    let mut edited = ana_form();
    edited.phone = Some("0990000000".to_string());
    let outcome = harness
        .service
        .submit_form(&ana(), edited)
        .await
        .expect("rejected form can be edited");
    assert!(!outcome.reset_to_pending);
    assert_eq!(outcome.aggregate.guardian.approval, ApprovalState::Rejected);
    assert_eq!(outcome.aggregate.guardian.phone.as_deref(), Some("0990000000"));
}

#[tokio::test]
async fn reset_policy_returns_decided_forms_to_pending() {
    let harness = harness_with(
        InMemoryEntityStore::default(),
        RecordingNotifier::default(),
        EnrollmentConfig {
            resubmission: ResubmissionPolicy::ResetToPending,
            ..config()
        },
    );
    let submitted = harness
        .service
        .submit_form(&ana(), ana_form())
        .await
        .expect("submission succeeds");
    harness
        .service
        .decide_approval(&admin(), submitted.aggregate.guardian.id, true)
        .await
        .expect("approval succeeds");

    harness.clock.advance(chrono::Duration::days(3));
    let outcome = harness
        .service
        .submit_form(&ana(), ana_form())
        .await
        .expect("resubmission allowed");
    assert!(outcome.reset_to_pending);
    assert_eq!(outcome.aggregate.guardian.approval, ApprovalState::Pending);
    assert_eq!(
        outcome.aggregate.guardian.submitted_at,
        start() + chrono::Duration::days(3)
    );
    assert!(outcome.aggregate.guardian.decided_at.is_none());
}
