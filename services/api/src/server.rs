use crate::cli::ServeArgs;
use crate::infra::{identity_provider, open_store, AppState, LogNotifier};
use crate::routes::with_enrollment_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;
use transport_enrollment::config::AppConfig;
use transport_enrollment::enrollment::EnrollmentService;
use transport_enrollment::error::AppError;
use transport_enrollment::telemetry;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let store = Arc::new(open_store(&config.store).await?);
    let identity = Arc::new(identity_provider(&config));
    let service = Arc::new(EnrollmentService::new(
        store,
        Arc::new(LogNotifier),
        &config.enrollment,
    ));

    let reaper_task = if config.enrollment.sweep_interval.is_zero() {
        info!("periodic enrollment sweep disabled");
        None
    } else {
        Some(service.reaper().spawn_periodic(
            service.clock(),
            config.enrollment.sweep_interval,
            config.enrollment.retention,
        ))
    };

    let app = with_enrollment_routes(service, identity)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        retention_days = config.enrollment.retention.num_days(),
        "transport enrollment service ready"
    );

    let served = axum::serve(listener, app).await;
    if let Some(task) = reaper_task {
        task.abort();
    }
    served?;
    Ok(())
}
