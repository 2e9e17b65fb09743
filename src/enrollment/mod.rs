//! Guardian transport enrollment: form reconciliation, approval and expiry.
//!
//! A guardian submits one form describing their students and the tutors allowed
//! to pick each student up. The form is stored as a single aggregate that an
//! administrator approves or rejects; pending forms past their retention window
//! are purged by the [`ExpiryReaper`].

pub mod approval;
pub mod clock;
pub mod domain;
pub mod error;
pub mod identity;
pub mod notify;
pub mod payload;
pub mod reaper;
pub mod reconcile;
pub mod router;
pub mod service;
pub mod store;

#[cfg(test)]
mod tests;

pub use approval::{ApprovalStateMachine, ApprovalTransition};
pub use clock::{Clock, FixedClock, SystemClock};
pub use domain::{
    Aggregate, ApprovalState, Guardian, GuardianId, GuardianIdentity, ResubmissionPolicy, Student,
    StudentEntry, StudentFields, StudentId, StudentRef, SubmissionFilter, SubmissionForm, Tutor,
    TutorEntry, TutorFields, TutorId,
};
pub use error::EnrollmentError;
pub use identity::{IdentityError, IdentityProvider, Principal, Role, StaticIdentityProvider};
pub use notify::{Notification, NotificationDispatcher, NotificationError, Notifier, TemplateKey};
pub use payload::{StudentPayload, SubmissionPayload, TutorPayload};
pub use reaper::{ExpiryReaper, ReapedSubmission, SweepReport};
pub use reconcile::{ChangeSummary, Reconciliation, ReconciliationEngine};
pub use router::{enrollment_router, EnrollmentState};
pub use service::{DashboardView, Decision, EnrollmentService};
pub use store::{EntityStore, InMemoryEntityStore, StoreError, StoreTotals, StoreTransaction};
