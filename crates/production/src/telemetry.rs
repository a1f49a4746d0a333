//! Logging initialization and the metrics endpoint.
//!
//! Logging goes through `tracing-subscriber` with an `EnvFilter`; `RUST_LOG`
//! wins over the configured filter. Prometheus metrics, liveness and
//! readiness are served over HTTP when enabled.

use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

/// Filter used when neither `RUST_LOG` nor the configuration sets one.
pub const DEFAULT_LOG_FILTER: &str = "info,cpos=debug";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Configuration for telemetry.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name reported in the startup log.
    pub service_name: String,
    /// Log filter directives. `RUST_LOG` takes precedence.
    pub log_filter: Option<String>,
    /// Serve Prometheus metrics over HTTP.
    pub prometheus_enabled: bool,
    pub prometheus_addr: SocketAddr,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "cpos-node".to_string(),
            log_filter: None,
            prometheus_enabled: false,
            prometheus_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

/// Build the filter: `RUST_LOG`, then the configured directives, then
/// [`DEFAULT_LOG_FILTER`].
pub fn env_filter(config: &TelemetryConfig) -> Result<EnvFilter, TelemetryError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = config.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER);
    Ok(EnvFilter::try_new(directives)?)
}

/// Initialize logging and, if enabled, the metrics server.
///
/// Must be called from within a tokio runtime when the metrics server is
/// enabled.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    let subscriber = Registry::default().with(env_filter(config)?).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    tracing::info!(
        service = %config.service_name,
        version = env!("CARGO_PKG_VERSION"),
        "Telemetry initialized"
    );

    let (prometheus_handle, ready_flag) = if config.prometheus_enabled {
        let ready_flag = Arc::new(AtomicBool::new(false));
        let handle = start_metrics_server(config.prometheus_addr, ready_flag.clone());
        (Some(handle), Some(ready_flag))
    } else {
        (None, None)
    };

    Ok(TelemetryGuard {
        prometheus_handle,
        ready_flag,
    })
}

/// Keeps the metrics server alive; stops it on drop.
pub struct TelemetryGuard {
    prometheus_handle: Option<tokio::task::JoinHandle<()>>,
    ready_flag: Option<Arc<AtomicBool>>,
}

impl TelemetryGuard {
    /// Mark the node as ready (for the readiness probe).
    pub fn set_ready(&self, ready: bool) {
        if let Some(flag) = &self.ready_flag {
            flag.store(ready, Ordering::SeqCst);
        }
    }

    pub fn shutdown(mut self) {
        if let Some(handle) = self.prometheus_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.prometheus_handle.take() {
            handle.abort();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Prometheus HTTP Server
// ═══════════════════════════════════════════════════════════════════════════

fn metrics_router(ready_flag: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(ready_flag.clone())))
}

/// Start the metrics HTTP server.
///
/// Exposes:
/// - `GET /metrics` - Prometheus metrics in text format
/// - `GET /health` - Liveness probe
/// - `GET /ready` - Readiness probe (503 until the node is ready)
fn start_metrics_server(addr: SocketAddr, ready_flag: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = metrics_router(ready_flag);
        tracing::info!(%addr, "Starting metrics server");

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = ?e, %addr, "Failed to bind metrics server");
                return;
            }
        };

        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "Metrics server error");
        }
    })
}

async fn metrics_handler() -> impl IntoResponse {
    // Touch the registry so metrics exist before the first event.
    let _ = crate::metrics::metrics();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = ?e, "Failed to encode metrics");
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    (
        [(
            axum::http::header::CONTENT_TYPE,
            encoder.format_type().to_string(),
        )],
        buffer,
    )
        .into_response()
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(HealthResponse { status: "ok" })
}

async fn ready_handler(ready_flag: Arc<AtomicBool>) -> impl IntoResponse {
    if ready_flag.load(Ordering::SeqCst) {
        (
            axum::http::StatusCode::OK,
            axum::Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(ReadyResponse {
                status: "not_ready",
                ready: false,
            }),
        )
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}
