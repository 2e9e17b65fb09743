use crate::infra::AppState;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Extension;
use axum::Json;
use serde_json::json;
use std::sync::Arc;
use transport_enrollment::enrollment::{
    enrollment_router, EnrollmentService, EntityStore, IdentityProvider, Notifier,
};

pub(crate) fn with_enrollment_routes<S, N>(
    service: Arc<EnrollmentService<S, N>>,
    identity: Arc<dyn IdentityProvider>,
) -> axum::Router
where
    S: EntityStore + 'static,
    N: Notifier + 'static,
{
    enrollment_router(service, identity)
        .route("/health", axum::routing::get(healthcheck))
        .route("/ready", axum::routing::get(readiness_endpoint))
        .route("/metrics", axum::routing::get(metrics_endpoint))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::LogNotifier;
    use axum::body::Body;
    use axum::http::Request;
    use transport_enrollment::config::EnrollmentConfig;
    use transport_enrollment::enrollment::{
        InMemoryEntityStore, Principal, StaticIdentityProvider,
    };
    use tower::ServiceExt;

    fn router() -> axum::Router {
        let service = Arc::new(EnrollmentService::new(
            Arc::new(InMemoryEntityStore::default()),
            Arc::new(LogNotifier),
            &EnrollmentConfig::default(),
        ));
        let identity = Arc::new(StaticIdentityProvider::new([(
            "ana".to_string(),
            Principal::guardian("ana-identity", Some("ana@example.com")),
        )]));
        with_enrollment_routes(service, identity)
    }

    #[tokio::test]
    async fn healthcheck_reports_ok() {
        let Json(body) = healthcheck().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn enrollment_routes_are_mounted() {
        let response = router()
            .oneshot(
                Request::get("/api/v1/dashboard")
                    .header(header::AUTHORIZATION, "Bearer ana")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("route executes");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_route_needs_no_token() {
        let response = router()
            .oneshot(Request::get("/health").body(Body::empty()).expect("request builds"))
            .await
            .expect("route executes");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
