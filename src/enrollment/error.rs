use std::time::Duration;

use super::store::StoreError;

/// Error raised by the enrollment core operations.
#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error("invalid submission: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl EnrollmentError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Infrastructure failures the caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::StoreUnavailable(_))
    }
}

impl From<StoreError> for EnrollmentError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::DuplicateNationalId { national_id } => Self::Conflict(format!(
                "national id {national_id} already belongs to another guardian"
            )),
            StoreError::NotFound => Self::NotFound("record not found".to_string()),
            StoreError::Integrity(detail) => Self::Validation(detail),
            StoreError::Timeout(after) => Self::Timeout(after),
            StoreError::Unavailable(detail) => Self::StoreUnavailable(detail),
            locked @ StoreError::Locked { .. } => Self::StoreUnavailable(locked.to_string()),
            StoreError::Serialization => Self::StoreUnavailable(
                "too many concurrent updates; retry the request".to_string(),
            ),
        }
    }
}
