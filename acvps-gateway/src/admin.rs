//! Admin server for health checks and metrics.
//!
//! `/health` reports healthy only while the cache backing store answers a
//! ping. `/metrics` serves the Prometheus registry in OpenMetrics text
//! format. The same routes are mounted on the proxy listener.

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use prometheus_client::registry::Registry;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use acvps_core::cache::CacheLayer;

#[derive(Debug, Clone)]
pub struct AdminServerConfig {
    pub port: u16,
    pub bind_addr: String,
}

impl Default for AdminServerConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            bind_addr: "127.0.0.1".to_string(),
        }
    }
}

impl AdminServerConfig {
    pub fn bind_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

#[derive(Clone)]
pub struct AdminState {
    pub cache: Arc<CacheLayer>,
    pub prom_registry: Arc<Registry>,
}

pub struct AdminServer {
    config: AdminServerConfig,
    state: AdminState,
}

impl AdminServer {
    pub fn new(cache: Arc<CacheLayer>, prom_registry: Arc<Registry>, config: AdminServerConfig) -> Self {
        Self {
            config,
            state: AdminState {
                cache,
                prom_registry,
            },
        }
    }

    /// `GET /health` and `GET /metrics`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let bind_addr = self.config.bind_string();
        let listener = TcpListener::bind(&bind_addr).await?;

        info!(addr = %bind_addr, "Admin server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Admin server shutting down");
            })
            .await?;

        Ok(())
    }
}

async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let backend = state.cache.backend_name();
    match state.cache.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"status": "healthy", "cache": backend})),
        ),
        Err(e) => {
            warn!(error = %e, cache = backend, "Health check failed: cache unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "unhealthy", "cache": backend, "error": e.to_string()})),
            )
        }
    }
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let mut buffer = String::new();

    if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, &state.prom_registry) {
        error!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {e}"),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}
