//! fedq API Gateway
//!
//! HTTP entry point for federated query plans.
//! Handles:
//! - Plan validation and execution
//! - Rate limiting
//! - Readiness of the data source adapters
//! - Observability (logging, metrics)

mod handlers;
mod middleware;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use fedq_common::{
    config::{AppConfig, ObservabilityConfig},
    metrics,
};
use fedq_engine::{
    adapter::{AnalyticalStoreAdapter, DocumentStoreAdapter},
    telemetry::{FanoutSink, MetricsSink, TracingSink},
    AdapterRegistry, Executor,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use middleware::rate_limit::{rate_limit_middleware, RateLimit};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub executor: Arc<Executor>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Arc::new(AppConfig::load()?);
    init_tracing(&config.observability);

    info!("Starting fedq API Gateway v{}", fedq_common::VERSION);

    // Initialize metrics
    metrics::register_metrics();
    if config.observability.metrics_port != 0 {
        PrometheusBuilder::new()
            .with_http_listener(SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port)))
            .set_buckets_for_metric(
                Matcher::Suffix("step_duration_seconds".to_string()),
                metrics::STEP_BUCKETS,
            )?
            .install()?;
        info!(port = config.observability.metrics_port, "Prometheus exporter listening");
    }

    // Connection pools live for the whole process
    info!("Connecting data source adapters...");
    let registry = AdapterRegistry::new()
        .with(Arc::new(DocumentStoreAdapter::connect(&config.mongodb).await?))
        .with(Arc::new(AnalyticalStoreAdapter::connect(&config.clickhouse)?));

    let sink = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(Arc::new(MetricsSink));
    let executor = Executor::from_config(&config.executor, &config.guard, registry).with_sink(Arc::new(sink));

    let state = AppState {
        config: config.clone(),
        executor: Arc::new(executor),
    };

    // Build the router
    let app = create_router(state.clone());

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if tokio::time::timeout(config.shutdown_timeout(), state.executor.registry().shutdown_all())
        .await
        .is_err()
    {
        tracing::warn!("Adapter drain did not finish before the shutdown timeout");
    }

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if config.json_logging {
        subscriber.json().init();
    } else {
        subscriber.pretty().init();
    }
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // API routes
    let mut api_routes = Router::new()
        .route("/plans/execute", post(handlers::plans::execute_plan))
        .route("/plans/validate", post(handlers::plans::validate_plan));

    if state.config.rate_limit.enabled {
        let rate_limit = RateLimit::from_config(&state.config.rate_limit);
        api_routes = api_routes.route_layer(axum::middleware::from_fn_with_state(
            rate_limit,
            rate_limit_middleware,
        ));
    }

    // Compose the app
    Router::new()
        // Health endpoints (never rate limited)
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .nest("/v1", api_routes)
        .layer(DefaultBodyLimit::max(state.config.server.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
