//! API server: REST routes over the experiment pipeline plus the Prometheus
//! exporter.

use crate::rest::{self, AppState};
use axum::routing::{get, post};
use axum::Router;
use inbox_core::config::AppConfig;
use inbox_engine::ExperimentPipeline;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiServer {
    config: AppConfig,
    pipeline: Arc<ExperimentPipeline>,
}

impl ApiServer {
    pub fn new(config: AppConfig, pipeline: Arc<ExperimentPipeline>) -> Self {
        Self { config, pipeline }
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        router(AppState {
            pipeline: self.pipeline.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
        })
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = self.router();
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the metrics exporter on a separate port.
    pub async fn start_metrics(&self) -> anyhow::Result<()> {
        if !self.config.metrics.enabled {
            info!("Metrics exporter disabled");
            return Ok(());
        }

        let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
        let handle = builder
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install_recorder()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");

        // Keep the handle alive
        std::mem::forget(handle);
        Ok(())
    }
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        // Generation and experiments
        .route("/api/generate", post(rest::generate))
        .route("/api/experiments/:id/select", post(rest::select_variant))
        .route("/api/experiments/:id/stats", get(rest::experiment_stats))
        .route("/api/experiments/:id/close", post(rest::close_experiment))
        .route("/api/experiments/:id/reset", post(rest::reset_experiment))
        .route("/api/experiments/:id/comparison", get(rest::experiment_comparison))
        .route("/api/variants/:variant_id/performance", get(rest::variant_performance))
        .route("/api/track", post(rest::track_event))
        // Reporting
        .route("/api/dashboard", get(rest::dashboard))
        .route("/api/top-performers", get(rest::top_performers))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
