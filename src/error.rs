use crate::config::ConfigError;
use crate::enrollment::{EnrollmentError, IdentityError};
use crate::telemetry::TelemetryError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Io(std::io::Error),
    Server(axum::Error),
    Enrollment(EnrollmentError),
    Identity(IdentityError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Enrollment(err) => match err {
                EnrollmentError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                EnrollmentError::Conflict(_) => StatusCode::CONFLICT,
                EnrollmentError::NotFound(_) => StatusCode::NOT_FOUND,
                EnrollmentError::Forbidden(_) => StatusCode::FORBIDDEN,
                EnrollmentError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                EnrollmentError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            AppError::Identity(_) => StatusCode::UNAUTHORIZED,
            AppError::Config(_)
            | AppError::Telemetry(_)
            | AppError::Io(_)
            | AppError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {}", err),
            AppError::Telemetry(err) => write!(f, "telemetry error: {}", err),
            AppError::Io(err) => write!(f, "io error: {}", err),
            AppError::Server(err) => write!(f, "server error: {}", err),
            AppError::Enrollment(err) => write!(f, "{}", err),
            AppError::Identity(err) => write!(f, "authentication failed: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::Server(err) => Some(err),
            AppError::Enrollment(err) => Some(err),
            AppError::Identity(err) => Some(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({ "error": self.to_string() });
        if let AppError::Enrollment(err) = &self {
            body["retryable"] = json!(err.is_retryable());
        }
        (status, Json(body)).into_response()
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<axum::Error> for AppError {
    fn from(value: axum::Error) -> Self {
        Self::Server(value)
    }
}

impl From<EnrollmentError> for AppError {
    fn from(value: EnrollmentError) -> Self {
        Self::Enrollment(value)
    }
}

impl From<IdentityError> for AppError {
    fn from(value: IdentityError) -> Self {
        Self::Identity(value)
    }
}

impl From<crate::enrollment::StoreError> for AppError {
    fn from(value: crate::enrollment::StoreError) -> Self {
        Self::Enrollment(value.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn enrollment_errors_map_to_http_statuses() {
        let cases = [
            (EnrollmentError::Validation("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (EnrollmentError::Conflict("x".into()), StatusCode::CONFLICT),
            (EnrollmentError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (EnrollmentError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (
                EnrollmentError::Timeout(Duration::from_millis(5)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                EnrollmentError::StoreUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (error, expected) in cases {
            assert_eq!(AppError::from(error).status(), expected);
        }
        assert_eq!(
            AppError::from(IdentityError::InvalidToken).status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
