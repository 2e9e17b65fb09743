use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::approval::ApprovalStateMachine;

/// Opaque guardian reference issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GuardianIdentity(pub String);

impl fmt::Display for GuardianIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned guardian key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuardianId(pub u64);

/// Store-assigned student key, stable across updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudentId(pub u64);

/// Store-assigned tutor key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TutorId(pub u64);

macro_rules! display_id {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_id!(GuardianId, StudentId, TutorId);

/// Review state of a guardian's submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl ApprovalState {
    pub const fn label(self) -> &'static str {
        match self {
            ApprovalState::Pending => "pending",
            ApprovalState::Approved => "approved",
            ApprovalState::Rejected => "rejected",
        }
    }

    pub const fn is_decided(self) -> bool {
        !matches!(self, ApprovalState::Pending)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Guardian row; one per identity, national id unique store-wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guardian {
    pub id: GuardianId,
    pub identity: GuardianIdentity,
    pub national_id: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub approval: ApprovalState,
    pub submitted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl Guardian {
    /// Pending and past its explicit deadline, or submitted strictly before `cutoff`.
    pub fn is_expired(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if !ApprovalStateMachine::is_reapable(self.approval) {
            return false;
        }
        match self.expires_at {
            Some(deadline) => deadline < now,
            None => self.submitted_at < cutoff,
        }
    }
}

/// Student attributes as supplied by the guardian.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentFields {
    pub name: String,
    pub surname: String,
    pub birth_date: NaiveDate,
    pub grade: String,
    #[serde(default)]
    pub age: Option<u8>,
    #[serde(default)]
    pub school: Option<String>,
    #[serde(default)]
    pub entry_time: Option<NaiveTime>,
    #[serde(default)]
    pub exit_time: Option<NaiveTime>,
}

impl StudentFields {
    pub(crate) fn natural_key(&self) -> (&str, &str, NaiveDate) {
        (self.name.as_str(), self.surname.as_str(), self.birth_date)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub guardian_id: GuardianId,
    #[serde(flatten)]
    pub fields: StudentFields,
}

/// Person authorized to receive a student.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TutorFields {
    pub name: String,
    pub surname: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub relationship: Option<String>,
}

impl TutorFields {
    pub(crate) fn natural_key(&self) -> (&str, &str) {
        (self.name.as_str(), self.surname.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tutor {
    pub id: TutorId,
    pub student_id: StudentId,
    #[serde(flatten)]
    pub fields: TutorFields,
}

/// Guardian plus its students and their tutors, read and written as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub guardian: Guardian,
    pub students: Vec<Student>,
    pub tutors: Vec<Tutor>,
}

impl Aggregate {
    pub fn student(&self, id: StudentId) -> Option<&Student> {
        self.students.iter().find(|student| student.id == id)
    }

    pub fn tutor(&self, id: TutorId) -> Option<&Tutor> {
        self.tutors.iter().find(|tutor| tutor.id == id)
    }

    pub fn tutors_of(&self, student: StudentId) -> impl Iterator<Item = &Tutor> {
        self.tutors
            .iter()
            .filter(move |tutor| tutor.student_id == student)
    }
}

/// Desired student entry: update an existing row or create a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StudentEntry {
    Existing { id: StudentId, fields: StudentFields },
    New(StudentFields),
}

impl StudentEntry {
    pub fn fields(&self) -> &StudentFields {
        match self {
            StudentEntry::Existing { fields, .. } | StudentEntry::New(fields) => fields,
        }
    }
}

/// Which student a tutor entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudentRef {
    /// Position in the submission's student list.
    Position(usize),
    /// Id of a student already stored for this guardian.
    Stored(StudentId),
}

/// Desired tutor entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TutorEntry {
    Existing {
        id: TutorId,
        student: StudentRef,
        fields: TutorFields,
    },
    New {
        student: StudentRef,
        fields: TutorFields,
    },
}

impl TutorEntry {
    pub fn student(&self) -> StudentRef {
        match self {
            TutorEntry::Existing { student, .. } | TutorEntry::New { student, .. } => *student,
        }
    }

    pub fn fields(&self) -> &TutorFields {
        match self {
            TutorEntry::Existing { fields, .. } | TutorEntry::New { fields, .. } => fields,
        }
    }
}

/// Full desired state of a guardian's enrollment form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionForm {
    pub national_id: String,
    pub phone: Option<String>,
    pub students: Vec<StudentEntry>,
    pub tutors: Vec<TutorEntry>,
}

/// What to do when a guardian whose form was already decided submits again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResubmissionPolicy {
    /// Approved forms are frozen; rejected forms may be edited and stay rejected.
    #[default]
    RejectApproved,
    /// Any decided form returns to pending and its retention window restarts.
    ResetToPending,
}

/// Admin-side listing filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmissionFilter {
    pub state: Option<ApprovalState>,
}

impl SubmissionFilter {
    pub fn matches(&self, guardian: &Guardian) -> bool {
        self.state.map_or(true, |state| guardian.approval == state)
    }
}
