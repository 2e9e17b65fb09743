//! Diffs a guardian's desired form against the stored aggregate.
//!
//! Entries carrying an id update that row; entries without one are matched to an
//! unclaimed stored row with the same natural key (students: name, surname and
//! birth date; tutors: name and surname under the same student) or created.
//! Stored rows nobody claimed are deleted, so the latest submission fully
//! replaces the previous one. Tutor references that cannot be resolved inside
//! the submission are rejected.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::approval::ApprovalStateMachine;
use super::domain::{
    Aggregate, ResubmissionPolicy, StudentEntry, StudentId, StudentRef, SubmissionForm,
    TutorEntry, TutorId,
};
use super::error::EnrollmentError;
use super::identity::Principal;
use super::store::{
    GuardianUpsert, NestedPlan, PlannedStudentRef, StoreTransaction, TutorCreate, TutorUpdate,
};

pub const NATIONAL_ID_MAX_LEN: usize = 13;
pub const PHONE_MAX_LEN: usize = 13;

/// Row counts touched by one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub students_created: usize,
    pub students_updated: usize,
    pub students_deleted: usize,
    pub tutors_created: usize,
    pub tutors_updated: usize,
    pub tutors_deleted: usize,
}

impl From<&NestedPlan> for ChangeSummary {
    fn from(plan: &NestedPlan) -> Self {
        Self {
            students_created: plan.student_creates.len(),
            students_updated: plan.student_updates.len(),
            students_deleted: plan.student_deletes.len(),
            tutors_created: plan.tutor_creates.len(),
            tutors_updated: plan.tutor_updates.len(),
            tutors_deleted: plan.tutor_deletes.len(),
        }
    }
}

/// Result of applying a submission inside a transaction.
#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    pub aggregate: Aggregate,
    pub created: bool,
    pub reset_to_pending: bool,
    pub summary: ChangeSummary,
}

pub struct ReconciliationEngine {
    policy: ResubmissionPolicy,
    form_ttl: Option<Duration>,
}

impl ReconciliationEngine {
    pub fn new(policy: ResubmissionPolicy, form_ttl: Option<Duration>) -> Self {
        Self { policy, form_ttl }
    }

    pub fn policy(&self) -> ResubmissionPolicy {
        self.policy
    }

    /// Upserts the guardian and replaces its nested lists within `tx`.
    pub fn apply<T: StoreTransaction>(
        &self,
        tx: &mut T,
        principal: &Principal,
        form: &SubmissionForm,
        now: DateTime<Utc>,
    ) -> Result<Reconciliation, EnrollmentError> {
        validate(form)?;

        let existing = tx.get_submission(&principal.identity);
        let reset_to_pending = match &existing {
            Some(aggregate) => {
                ApprovalStateMachine::on_resubmission(self.policy, aggregate.guardian.approval)?
            }
            None => false,
        };
        let plan = plan(existing.as_ref(), form)?;
        let expires_at = match self.form_ttl {
            Some(ttl) => Some(now.checked_add_signed(ttl).ok_or_else(|| {
                EnrollmentError::validation(format!(
                    "form lifetime of {} days is out of range",
                    ttl.num_days()
                ))
            })?),
            None => None,
        };

        let guardian = tx.upsert_guardian(GuardianUpsert {
            identity: principal.identity.clone(),
            national_id: form.national_id.trim().to_string(),
            phone: normalized_phone(form.phone.as_deref()),
            email: principal.email.clone(),
            now,
            expires_at,
            reset_to_pending,
        })?;

        if !plan.is_noop() {
            tx.replace_students_and_tutors(guardian.id, &plan)?;
        }

        let aggregate = tx
            .get_aggregate(guardian.id)
            .ok_or_else(|| EnrollmentError::NotFound(format!("guardian {}", guardian.id)))?;

        Ok(Reconciliation {
            aggregate,
            created: existing.is_none(),
            reset_to_pending,
            summary: ChangeSummary::from(&plan),
        })
    }
}

fn normalized_phone(phone: Option<&str>) -> Option<String> {
    phone
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Field-level checks that do not need stored state.
pub fn validate(form: &SubmissionForm) -> Result<(), EnrollmentError> {
    let national_id = form.national_id.trim();
    if national_id.is_empty() {
        return Err(EnrollmentError::validation("national id is required"));
    }
    if national_id.chars().count() > NATIONAL_ID_MAX_LEN {
        return Err(EnrollmentError::validation(format!(
            "national id must be at most {NATIONAL_ID_MAX_LEN} characters"
        )));
    }
    if let Some(phone) = normalized_phone(form.phone.as_deref()) {
        if phone.chars().count() > PHONE_MAX_LEN {
            return Err(EnrollmentError::validation(format!(
                "phone must be at most {PHONE_MAX_LEN} characters"
            )));
        }
    }

    for (position, entry) in form.students.iter().enumerate() {
        let fields = entry.fields();
        for (label, value) in [
            ("name", &fields.name),
            ("surname", &fields.surname),
            ("grade", &fields.grade),
        ] {
            if value.trim().is_empty() {
                return Err(EnrollmentError::validation(format!(
                    "student #{} is missing its {label}",
                    position + 1
                )));
            }
        }
    }

    for (position, entry) in form.tutors.iter().enumerate() {
        let fields = entry.fields();
        if fields.name.trim().is_empty() || fields.surname.trim().is_empty() {
            return Err(EnrollmentError::validation(format!(
                "tutor #{} needs a name and surname",
                position + 1
            )));
        }
    }

    Ok(())
}

/// Computes the row changes that turn `existing` into `form`.
pub fn plan(existing: Option<&Aggregate>, form: &SubmissionForm) -> Result<NestedPlan, EnrollmentError> {
    let (stored_students, stored_tutors) = match existing {
        Some(aggregate) => (aggregate.students.as_slice(), aggregate.tutors.as_slice()),
        None => (&[][..], &[][..]),
    };
    let mut plan = NestedPlan::default();

    // Entries with ids claim their rows first so natural-key matching cannot steal them.
    let mut resolved: Vec<Option<PlannedStudentRef>> = vec![None; form.students.len()];
    let mut claimed: HashSet<StudentId> = HashSet::new();
    for (position, entry) in form.students.iter().enumerate() {
        let StudentEntry::Existing { id, fields } = entry else {
            continue;
        };
        let stored = stored_students
            .iter()
            .find(|student| student.id == *id)
            .ok_or_else(|| {
                EnrollmentError::validation(format!(
                    "student {id} does not belong to this guardian"
                ))
            })?;
        if !claimed.insert(*id) {
            return Err(EnrollmentError::validation(format!(
                "student {id} is listed more than once"
            )));
        }
        if stored.fields != *fields {
            plan.student_updates.push((*id, fields.clone()));
        }
        resolved[position] = Some(PlannedStudentRef::Stored(*id));
    }

    for (position, entry) in form.students.iter().enumerate() {
        let StudentEntry::New(fields) = entry else {
            continue;
        };
        let matched = stored_students.iter().find(|student| {
            !claimed.contains(&student.id) && student.fields.natural_key() == fields.natural_key()
        });
        let reference = match matched {
            Some(stored) => {
                claimed.insert(stored.id);
                if stored.fields != *fields {
                    plan.student_updates.push((stored.id, fields.clone()));
                }
                PlannedStudentRef::Stored(stored.id)
            }
            None => {
                plan.student_creates.push(fields.clone());
                PlannedStudentRef::Created(plan.student_creates.len() - 1)
            }
        };
        resolved[position] = Some(reference);
    }

    plan.student_deletes = stored_students
        .iter()
        .map(|student| student.id)
        .filter(|id| !claimed.contains(id))
        .collect();

    let resolve = |position: usize, reference: StudentRef| match reference {
        StudentRef::Position(index) => resolved.get(index).copied().flatten().ok_or_else(|| {
            EnrollmentError::validation(format!(
                "tutor #{} references student position {index}, but the form lists {} students",
                position + 1,
                form.students.len()
            ))
        }),
        StudentRef::Stored(id) if claimed.contains(&id) => Ok(PlannedStudentRef::Stored(id)),
        StudentRef::Stored(id) => Err(EnrollmentError::validation(format!(
            "tutor #{} references student {id}, which is not part of this submission",
            position + 1
        ))),
    };

    let mut claimed_tutors: HashSet<TutorId> = HashSet::new();
    for (position, entry) in form.tutors.iter().enumerate() {
        let TutorEntry::Existing {
            id,
            student,
            fields,
        } = entry
        else {
            continue;
        };
        let stored = stored_tutors
            .iter()
            .find(|tutor| tutor.id == *id)
            .ok_or_else(|| {
                EnrollmentError::validation(format!("tutor {id} does not belong to this guardian"))
            })?;
        if !claimed_tutors.insert(*id) {
            return Err(EnrollmentError::validation(format!(
                "tutor {id} is listed more than once"
            )));
        }
        let target = resolve(position, *student)?;
        if stored.fields != *fields || target != PlannedStudentRef::Stored(stored.student_id) {
            plan.tutor_updates.push(TutorUpdate {
                id: *id,
                student: target,
                fields: fields.clone(),
            });
        }
    }

    for (position, entry) in form.tutors.iter().enumerate() {
        let TutorEntry::New { student, fields } = entry else {
            continue;
        };
        let target = resolve(position, *student)?;
        let matched = match target {
            PlannedStudentRef::Stored(student_id) => stored_tutors.iter().find(|tutor| {
                tutor.student_id == student_id
                    && !claimed_tutors.contains(&tutor.id)
                    && tutor.fields.natural_key() == fields.natural_key()
            }),
            PlannedStudentRef::Created(_) => None,
        };
        match matched {
            Some(stored) => {
                claimed_tutors.insert(stored.id);
                if stored.fields != *fields {
                    plan.tutor_updates.push(TutorUpdate {
                        id: stored.id,
                        student: target,
                        fields: fields.clone(),
                    });
                }
            }
            None => plan.tutor_creates.push(TutorCreate {
                student: target,
                fields: fields.clone(),
            }),
        }
    }

    plan.tutor_deletes = stored_tutors
        .iter()
        .map(|tutor| tutor.id)
        .filter(|id| !claimed_tutors.contains(id))
        .collect();

    Ok(plan)
}
