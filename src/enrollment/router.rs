use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post},
    Json, Router,
};
use chrono::Duration;
use serde::Deserialize;
use serde_json::json;

use super::domain::{ApprovalState, GuardianId, SubmissionFilter};
use super::error::EnrollmentError;
use super::identity::{IdentityError, IdentityProvider, Principal};
use super::notify::Notifier;
use super::payload::SubmissionPayload;
use super::service::EnrollmentService;
use super::store::EntityStore;
use crate::error::AppError;

/// Shared handler state: the service plus the token resolver.
pub struct EnrollmentState<S, N> {
    pub service: Arc<EnrollmentService<S, N>>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl<S, N> Clone for EnrollmentState<S, N> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            identity: self.identity.clone(),
        }
    }
}

/// Router builder exposing the guardian and admin endpoints.
pub fn enrollment_router<S, N>(
    service: Arc<EnrollmentService<S, N>>,
    identity: Arc<dyn IdentityProvider>,
) -> Router
where
    S: EntityStore + 'static,
    N: Notifier + 'static,
{
    Router::new()
        .route("/api/v1/forms", post(submit_handler::<S, N>))
        .route("/api/v1/forms/me", get(my_submission_handler::<S, N>))
        .route("/api/v1/dashboard", get(dashboard_handler::<S, N>))
        .route("/api/v1/admin/forms", get(list_handler::<S, N>))
        .route(
            "/api/v1/admin/forms/:guardian_id",
            delete(delete_handler::<S, N>),
        )
        .route(
            "/api/v1/admin/guardians/:guardian_id/approval",
            patch(decide_handler::<S, N>),
        )
        .route("/api/v1/admin/sweep", post(sweep_handler::<S, N>))
        .with_state(EnrollmentState { service, identity })
}

pub(crate) async fn authenticate(
    identity: &dyn IdentityProvider,
    headers: &HeaderMap,
) -> Result<Principal, AppError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(IdentityError::MissingCredentials)?;
    Ok(identity.authenticate(token).await?)
}

pub(crate) async fn submit_handler<S, N>(
    State(state): State<EnrollmentState<S, N>>,
    headers: HeaderMap,
    Json(payload): Json<SubmissionPayload>,
) -> Result<Response, AppError>
where
    S: EntityStore + 'static,
    N: Notifier + 'static,
{
    let principal = authenticate(state.identity.as_ref(), &headers).await?;
    let outcome = state.service.submit_payload(&principal, payload).await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)).into_response())
}

pub(crate) async fn my_submission_handler<S, N>(
    State(state): State<EnrollmentState<S, N>>,
    headers: HeaderMap,
) -> Result<Response, AppError>
where
    S: EntityStore + 'static,
    N: Notifier + 'static,
{
    let principal = authenticate(state.identity.as_ref(), &headers).await?;
    let aggregate = state.service.get_my_submission(&principal).await?;
    Ok((StatusCode::OK, Json(aggregate)).into_response())
}

pub(crate) async fn dashboard_handler<S, N>(
    State(state): State<EnrollmentState<S, N>>,
    headers: HeaderMap,
) -> Result<Response, AppError>
where
    S: EntityStore + 'static,
    N: Notifier + 'static,
{
    let principal = authenticate(state.identity.as_ref(), &headers).await?;
    let view = state.service.dashboard(&principal).await?;
    Ok((StatusCode::OK, Json(view)).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ListQuery {
    #[serde(default)]
    state: Option<String>,
}

pub(crate) async fn list_handler<S, N>(
    State(state): State<EnrollmentState<S, N>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Response, AppError>
where
    S: EntityStore + 'static,
    N: Notifier + 'static,
{
    let principal = authenticate(state.identity.as_ref(), &headers).await?;
    let filter = match query.state.as_deref() {
        None | Some("") => SubmissionFilter::default(),
        Some(raw) => SubmissionFilter {
            state: Some(ApprovalState::parse(raw).ok_or_else(|| {
                EnrollmentError::Validation(format!("unknown approval state '{raw}'"))
            })?),
        },
    };
    let forms = state.service.list_submissions(&principal, filter).await?;
    let payload = json!({
        "count": forms.len(),
        "forms": forms,
    });
    Ok((StatusCode::OK, Json(payload)).into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct DecisionRequest {
    approved: bool,
}

pub(crate) async fn decide_handler<S, N>(
    State(state): State<EnrollmentState<S, N>>,
    headers: HeaderMap,
    Path(guardian_id): Path<u64>,
    Json(request): Json<DecisionRequest>,
) -> Result<Response, AppError>
where
    S: EntityStore + 'static,
    N: Notifier + 'static,
{
    let principal = authenticate(state.identity.as_ref(), &headers).await?;
    let decision = state
        .service
        .decide_approval(&principal, GuardianId(guardian_id), request.approved)
        .await?;
    let payload = json!({
        "previous": decision.transition.from,
        "approval": decision.transition.to,
        "form": decision.aggregate,
    });
    Ok((StatusCode::OK, Json(payload)).into_response())
}

pub(crate) async fn delete_handler<S, N>(
    State(state): State<EnrollmentState<S, N>>,
    headers: HeaderMap,
    Path(guardian_id): Path<u64>,
) -> Result<Response, AppError>
where
    S: EntityStore + 'static,
    N: Notifier + 'static,
{
    let principal = authenticate(state.identity.as_ref(), &headers).await?;
    let removed = state
        .service
        .delete_submission(&principal, GuardianId(guardian_id))
        .await?;
    let payload = json!({
        "deleted": removed.guardian.id,
        "students": removed.students.len(),
        "tutors": removed.tutors.len(),
    });
    Ok((StatusCode::OK, Json(payload)).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct SweepRequest {
    #[serde(default)]
    retention_days: Option<u32>,
    #[serde(default)]
    dry_run: bool,
}

pub(crate) async fn sweep_handler<S, N>(
    State(state): State<EnrollmentState<S, N>>,
    headers: HeaderMap,
    Json(request): Json<SweepRequest>,
) -> Result<Response, AppError>
where
    S: EntityStore + 'static,
    N: Notifier + 'static,
{
    let principal = authenticate(state.identity.as_ref(), &headers).await?;
    principal.require_admin()?;
    let retention = request
        .retention_days
        .map(|days| Duration::days(i64::from(days)))
        .unwrap_or_else(|| state.service.retention());
    let report = state
        .service
        .sweep_expired(retention, request.dry_run)
        .await?;
    Ok((StatusCode::OK, Json(report)).into_response())
}
