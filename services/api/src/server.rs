use crate::cli::ServeArgs;
use crate::infra::{AppState, LoggingEventPublisher, LoggingPaymentRail};
use crate::routes::with_booking_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use booking_escrow::config::AppConfig;
use booking_escrow::error::AppError;
use booking_escrow::telemetry;
use booking_escrow::workflows::booking::{
    BookingEngine, MemoryAuditLog, MemoryBookingRepository, MemoryDeadlineStore, Outbound,
    SchedulerService,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }
    if let Some(poll_seconds) = args.poll_seconds.take().filter(|seconds| *seconds > 0) {
        config.scheduler.poll_seconds = poll_seconds;
    }

    telemetry::init(&config.telemetry, config.environment)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let outbound = Outbound::new(
        Arc::new(LoggingEventPublisher::default()),
        Arc::new(LoggingPaymentRail::default()),
        Arc::new(MemoryAuditLog::default()),
    );
    let engine = Arc::new(
        BookingEngine::new(
            Arc::new(MemoryBookingRepository::default()),
            Arc::new(MemoryDeadlineStore::default()),
            outbound,
            config.engine.clone(),
        )?,
    );

    let scheduler = Arc::new(SchedulerService::new(engine.clone()));
    let scheduler_task = scheduler.spawn(config.scheduler.poll_interval());

    let app = with_booking_routes(engine)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        policy_version = config.engine.version,
        poll_seconds = config.scheduler.poll_seconds,
        "booking escrow service ready"
    );

    let served = axum::serve(listener, app).await;
    scheduler_task.abort();
    served?;
    Ok(())
}
