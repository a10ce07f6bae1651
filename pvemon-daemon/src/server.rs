//! Scrape-triggered HTTP server.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use pvemon_core::observability::metrics::record_pass;
use pvemon_core::{render_families, HealthChecker, PveCollector};
use std::sync::Arc;
use tracing::{debug, info};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

pub struct AppState {
    pub collector: Arc<PveCollector>,
    pub health: HealthChecker,
    /// Renders the exporter's own metrics from the global recorder.
    pub self_metrics: PrometheusHandle,
    pub prefix: String,
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.collector.collect().await;
    record_pass(&state.prefix, &report.stats);
    state.health.record_pass(&report).await;

    let mut body = render_families(&report.families);
    body.push_str(&state.self_metrics.render());
    debug!(bytes = body.len(), families = report.families.len(), "scrape served");

    (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_FORMAT)], body)
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health.get_health().await;
    let status = if state.health.is_ready().await { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(health))
}

async fn handle_index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "pvemon",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "/metrics": "Run a collection pass and return Prometheus text",
            "/health": "Subsystem health",
        },
    }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route("/metrics", get(handle_metrics))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Serve until ctrl-c.
pub async fn run_server(state: Arc<AppState>, address: &str, port: u16) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", address, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening for scrapes");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("received shutdown signal");
}
