//! Wire representation of a submission.
//!
//! Clients send flat JSON objects where an optional `id` marks an update. Tutors
//! point at their student either by position in `students` (`student_ref`) or by
//! a stored student id (`student_id`); exactly one of the two must be present.

use serde::{Deserialize, Serialize};

use super::domain::{
    StudentEntry, StudentFields, StudentId, StudentRef, SubmissionForm, TutorEntry, TutorFields,
    TutorId,
};
use super::error::EnrollmentError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionPayload {
    pub national_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default)]
    pub students: Vec<StudentPayload>,
    #[serde(default)]
    pub tutors: Vec<TutorPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<StudentId>,
    #[serde(flatten)]
    pub fields: StudentFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TutorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TutorId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_ref: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub student_id: Option<StudentId>,
    #[serde(flatten)]
    pub fields: TutorFields,
}

impl From<StudentPayload> for StudentEntry {
    fn from(payload: StudentPayload) -> Self {
        match payload.id {
            Some(id) => StudentEntry::Existing {
                id,
                fields: payload.fields,
            },
            None => StudentEntry::New(payload.fields),
        }
    }
}

impl TutorPayload {
    fn into_entry(self, position: usize) -> Result<TutorEntry, EnrollmentError> {
        let student = match (self.student_ref, self.student_id) {
            (Some(index), None) => StudentRef::Position(index),
            (None, Some(id)) => StudentRef::Stored(id),
            (Some(_), Some(_)) => {
                return Err(EnrollmentError::validation(format!(
                    "tutor #{} sets both student_ref and student_id",
                    position + 1
                )))
            }
            (None, None) => {
                return Err(EnrollmentError::validation(format!(
                    "tutor #{} must set student_ref or student_id",
                    position + 1
                )))
            }
        };
        Ok(match self.id {
            Some(id) => TutorEntry::Existing {
                id,
                student,
                fields: self.fields,
            },
            None => TutorEntry::New {
                student,
                fields: self.fields,
            },
        })
    }
}

impl TryFrom<SubmissionPayload> for SubmissionForm {
    type Error = EnrollmentError;

    fn try_from(payload: SubmissionPayload) -> Result<Self, Self::Error> {
        let tutors = payload
            .tutors
            .into_iter()
            .enumerate()
            .map(|(position, tutor)| tutor.into_entry(position))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SubmissionForm {
            national_id: payload.national_id,
            phone: payload.phone,
            students: payload.students.into_iter().map(StudentEntry::from).collect(),
            tutors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_positional_and_stored_references() {
        let payload: SubmissionPayload = serde_json::from_value(json!({
            "national_id": "0912345678",
            "students": [
                { "name": "Ana", "surname": "Paz", "birth_date": "2015-04-02", "grade": "4" },
                { "id": 7, "name": "Leo", "surname": "Paz", "birth_date": "2017-09-10", "grade": "2",
                  "entry_time": "07:30:00" }
            ],
            "tutors": [
                { "name": "Luis", "surname": "Paz", "student_ref": 0 },
                { "id": 3, "name": "Rosa", "surname": "Vera", "student_id": 7, "relationship": "aunt" }
            ]
        }))
        .expect("payload decodes");

        let form = SubmissionForm::try_from(payload).expect("form converts");
        assert!(matches!(form.students[0], StudentEntry::New(_)));
        assert!(matches!(
            form.students[1],
            StudentEntry::Existing { id: StudentId(7), .. }
        ));
        assert_eq!(form.tutors[0].student(), StudentRef::Position(0));
        assert_eq!(form.tutors[1].student(), StudentRef::Stored(StudentId(7)));
        assert_eq!(form.tutors[1].fields().relationship.as_deref(), Some("aunt"));
    }

    #[test]
    fn tutor_needs_exactly_one_reference() {
        let both: SubmissionPayload = serde_json::from_value(json!({
            "national_id": "1",
            "tutors": [{ "name": "A", "surname": "B", "student_ref": 0, "student_id": 1 }]
        }))
        .expect("payload decodes");
        assert!(matches!(
            SubmissionForm::try_from(both),
            Err(EnrollmentError::Validation(_))
        ));

        let neither: SubmissionPayload = serde_json::from_value(json!({
            "national_id": "1",
            "tutors": [{ "name": "A", "surname": "B" }]
        }))
        .expect("payload decodes");
        assert!(matches!(
            SubmissionForm::try_from(neither),
            Err(EnrollmentError::Validation(_))
        ));
    }
}
