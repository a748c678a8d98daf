use crate::error::{LagError, Result};
use crate::export::prometheus::PrometheusExporter;
use crate::metrics::registry::MetricsRegistry;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Clone)]
struct AppState {
    prometheus: PrometheusExporter,
    registry: Arc<MetricsRegistry>,
}

pub struct HttpServer {
    addr: SocketAddr,
    state: AppState,
}

impl HttpServer {
    pub fn new(host: &str, port: u16, registry: Arc<MetricsRegistry>) -> Result<Self> {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| {
                LagError::Config(format!("invalid HTTP listen address {host}:{port}: {e}"))
            })?;

        Ok(Self {
            addr,
            state: AppState {
                prometheus: PrometheusExporter::new(Arc::clone(&registry)),
                registry,
            },
        })
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let app = router(self.state);

        info!(addr = %self.addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| LagError::Http(e.to_string()))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| LagError::Http(e.to_string()))?;

        Ok(())
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/", get(root_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render_metrics(),
    )
        .into_response()
}

async fn health_handler(State(state): State<AppState>) -> Response {
    if state.registry.is_healthy() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Unhealthy").into_response()
    }
}

async fn ready_handler(State(state): State<AppState>) -> Response {
    if state.registry.is_ready() {
        (StatusCode::OK, "Ready").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "Not ready - first cycle has not finished",
        )
            .into_response()
    }
}

async fn root_handler() -> Response {
    let html = r#"<!DOCTYPE html>
<html>
<head><title>Kafka Lag Monitor</title></head>
<body>
<h1>Kafka Lag Monitor</h1>
<p><a href="/metrics">Metrics</a></p>
<p><a href="/health">Health</a></p>
<p><a href="/ready">Ready</a></p>
</body>
</html>"#;

    (
        StatusCode::OK,
        [("content-type", "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}
