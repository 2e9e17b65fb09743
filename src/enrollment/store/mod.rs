//! Transactional persistence for guardian aggregates.
//!
//! Writes go through a [`StoreTransaction`] obtained from [`EntityStore::begin`]
//! and become visible only when [`EntityStore::commit`] succeeds. A backend that
//! detects a conflicting writer fails the commit with [`StoreError::Serialization`]
//! and leaves the committed state untouched, so callers re-run the whole unit of
//! work after [`retry_backoff`].

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use super::domain::{
    Aggregate, ApprovalState, Guardian, GuardianId, GuardianIdentity, StudentFields, StudentId,
    SubmissionFilter, TutorFields, TutorId,
};

pub use memory::InMemoryEntityStore;

/// Error enumeration for store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("national id {national_id} already belongs to another guardian")]
    DuplicateNationalId { national_id: String },
    #[error("record not found")]
    NotFound,
    #[error("integrity violation: {0}")]
    Integrity(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("transaction conflicted with a concurrent commit")]
    Serialization,
    #[error("snapshot {path} is locked by {holder}")]
    Locked { path: String, holder: String },
}

/// Randomized pause before re-running a transaction that lost a race.
/// Grows with `attempt` so contending writers spread out.
pub fn retry_backoff(attempt: u32) -> Duration {
    let ceiling = 5 * u64::from(attempt.clamp(1, 8));
    Duration::from_millis(rand::thread_rng().gen_range(1..=ceiling))
}

/// Guardian fields written on every submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianUpsert {
    pub identity: GuardianIdentity,
    pub national_id: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub now: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Put an existing guardian back to pending and restart its retention window.
    pub reset_to_pending: bool,
}

/// Where a planned tutor row points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedStudentRef {
    Stored(StudentId),
    /// Index into [`NestedPlan::student_creates`].
    Created(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TutorUpdate {
    pub id: TutorId,
    pub student: PlannedStudentRef,
    pub fields: TutorFields,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TutorCreate {
    pub student: PlannedStudentRef,
    pub fields: TutorFields,
}

/// Minimal set of row changes that turns the stored nested lists into the desired ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NestedPlan {
    pub student_updates: Vec<(StudentId, StudentFields)>,
    pub student_creates: Vec<StudentFields>,
    pub student_deletes: Vec<StudentId>,
    pub tutor_updates: Vec<TutorUpdate>,
    pub tutor_creates: Vec<TutorCreate>,
    pub tutor_deletes: Vec<TutorId>,
}

impl NestedPlan {
    pub fn is_noop(&self) -> bool {
        self.student_updates.is_empty()
            && self.student_creates.is_empty()
            && self.student_deletes.is_empty()
            && self.tutor_updates.is_empty()
            && self.tutor_creates.is_empty()
            && self.tutor_deletes.is_empty()
    }
}

/// Row counts across the whole store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreTotals {
    pub guardians: usize,
    pub students: usize,
    pub tutors: usize,
    pub approved: usize,
    pub pending: usize,
    pub rejected: usize,
}

/// Staged view of the store. Reads observe the snapshot plus this transaction's own writes.
pub trait StoreTransaction {
    fn get_submission(&self, identity: &GuardianIdentity) -> Option<Aggregate>;

    fn get_aggregate(&self, guardian_id: GuardianId) -> Option<Aggregate>;

    /// Creates the guardian when absent, otherwise updates national id, phone and email.
    fn upsert_guardian(&mut self, upsert: GuardianUpsert) -> Result<Guardian, StoreError>;

    /// Applies `plan` to the guardian's students and tutors; all-or-nothing within the transaction.
    fn replace_students_and_tutors(
        &mut self,
        guardian_id: GuardianId,
        plan: &NestedPlan,
    ) -> Result<(), StoreError>;

    fn set_approval(
        &mut self,
        guardian_id: GuardianId,
        state: ApprovalState,
        at: DateTime<Utc>,
    ) -> Result<Guardian, StoreError>;

    /// Removes the guardian, its students and their tutors.
    fn delete_aggregate(&mut self, guardian_id: GuardianId) -> Result<Aggregate, StoreError>;

    fn find_expired_pending(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Vec<Guardian>;

    fn list_aggregates(&self, filter: SubmissionFilter) -> Vec<Aggregate>;

    fn totals(&self) -> StoreTotals;
}

/// Storage abstraction so the enrollment services can be exercised in isolation.
///
/// Every call is bounded by the implementation's timeout and reports
/// [`StoreError::Timeout`] instead of blocking indefinitely.
#[async_trait]
pub trait EntityStore: Send + Sync {
    type Transaction: StoreTransaction + Send;

    async fn begin(&self) -> Result<Self::Transaction, StoreError>;

    /// Publishes the transaction's writes atomically.
    async fn commit(&self, transaction: Self::Transaction) -> Result<(), StoreError>;

    async fn get_submission(
        &self,
        identity: &GuardianIdentity,
    ) -> Result<Option<Aggregate>, StoreError> {
        let transaction = self.begin().await?;
        Ok(transaction.get_submission(identity))
    }

    async fn get_aggregate(&self, guardian_id: GuardianId) -> Result<Option<Aggregate>, StoreError> {
        let transaction = self.begin().await?;
        Ok(transaction.get_aggregate(guardian_id))
    }

    async fn find_expired_pending(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Guardian>, StoreError> {
        let transaction = self.begin().await?;
        Ok(transaction.find_expired_pending(cutoff, now))
    }

    async fn list_aggregates(&self, filter: SubmissionFilter) -> Result<Vec<Aggregate>, StoreError> {
        let transaction = self.begin().await?;
        Ok(transaction.list_aggregates(filter))
    }

    async fn totals(&self) -> Result<StoreTotals, StoreError> {
        let transaction = self.begin().await?;
        Ok(transaction.totals())
    }
}
