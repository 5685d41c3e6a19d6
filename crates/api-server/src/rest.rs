//! REST handlers for generation, selection, tracking and reporting.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use inbox_core::types::{
    Ack, DashboardMetrics, EventType, ExperimentComparison, ExperimentId, ExperimentStats,
    SelectedVariant, TopPerformer, VariantId, VariantPerformance,
};
use inbox_core::{GenerationRequest, InboxError, InboxResult};
use inbox_engine::{ExperimentPipeline, GenerateOutcome};
use inbox_gateway::CallContext;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};
use uuid::Uuid;

/// Upper bound on a caller-supplied generation deadline.
const MAX_GENERATION_TIMEOUT_MS: u64 = 600_000;

const MAX_TOP_PERFORMERS: usize = 100;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ExperimentPipeline>,
    pub node_id: String,
    pub start_time: Instant,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Pipeline error rendered as a JSON response.
pub struct ApiError(InboxError);

impl From<InboxError> for ApiError {
    fn from(err: InboxError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            InboxError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            InboxError::ExperimentNotFound(_) => (StatusCode::NOT_FOUND, "experiment_not_found"),
            InboxError::VariantNotFound(_) => (StatusCode::NOT_FOUND, "variant_not_found"),
            InboxError::ExperimentInactive(_) => (StatusCode::CONFLICT, "experiment_inactive"),
            InboxError::GatewayRateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            InboxError::GatewayTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "generation_timeout"),
            InboxError::GatewayUpstream(_) => (StatusCode::BAD_GATEWAY, "generation_failed"),
            InboxError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "generation_cancelled"),
            InboxError::Config(_)
            | InboxError::Store(_)
            | InboxError::Serialization(_)
            | InboxError::Io(_)
            | InboxError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(error = %self.0, "Request failed");
            metrics::counter!("api.errors").increment(1);
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                "Internal processing error".to_string()
            } else {
                self.0.to_string()
            }
        } else {
            warn!(error = %self.0, "Request rejected");
            metrics::counter!("api.client_errors").increment(1);
            self.0.to_string()
        };
        (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

fn experiment_id(raw: &str) -> Result<ExperimentId, ApiError> {
    Ok(ExperimentId::parse(raw)?)
}

/// Run a pipeline call that appends to the journal on the blocking pool, so
/// file I/O never stalls a runtime worker.
async fn run_blocking<T, F>(state: &AppState, call: F) -> Result<T, ApiError>
where
    F: FnOnce(&ExperimentPipeline) -> InboxResult<T> + Send + 'static,
    T: Send + 'static,
{
    let pipeline = state.pipeline.clone();
    let result = tokio::task::spawn_blocking(move || call(&pipeline))
        .await
        .map_err(|e| InboxError::Internal(anyhow::anyhow!("pipeline task failed: {e}")))?;
    Ok(result?)
}

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub email_content: String,
    #[serde(default)]
    pub original_subject: Option<String>,
    #[serde(default)]
    pub max_variants: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    /// Overall deadline for generation, retries included.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// POST /api/generate
pub async fn generate(
    State(state): State<AppState>,
    Json(body): Json<GenerateBody>,
) -> Result<Json<GenerateOutcome>, ApiError> {
    let ctx = match body.timeout_ms {
        Some(0) => {
            return Err(InboxError::Validation("timeout_ms must be positive".to_string()).into())
        }
        Some(ms) => CallContext::with_timeout(Duration::from_millis(ms.min(MAX_GENERATION_TIMEOUT_MS))),
        None => CallContext::new(),
    };
    let request = GenerationRequest {
        email_content: body.email_content,
        original_subject: body.original_subject,
        max_variants: body.max_variants,
        max_length: body.max_length,
    };
    let outcome = state.pipeline.generate_or_fetch(&request, &ctx).await?;
    Ok(Json(outcome))
}

/// POST /api/experiments/:id/select
pub async fn select_variant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SelectedVariant>, ApiError> {
    let id = experiment_id(&id)?;
    let selected = run_blocking(&state, move |pipeline| pipeline.select_variant(&id)).await?;
    Ok(Json(selected))
}

#[derive(Debug, Deserialize)]
pub struct TrackBody {
    pub variant_id: String,
    pub event_type: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Idempotency key; retries with the same id are applied once.
    #[serde(default)]
    pub event_id: Option<Uuid>,
}

/// POST /api/track
pub async fn track_event(
    State(state): State<AppState>,
    Json(body): Json<TrackBody>,
) -> Result<Json<Ack>, ApiError> {
    let variant_id: VariantId = body.variant_id.parse()?;
    let event_type: EventType = body.event_type.to_ascii_lowercase().parse()?;
    let ack = run_blocking(&state, move |pipeline| {
        pipeline.record_event(variant_id, event_type, body.timestamp, body.event_id)
    })
    .await?;
    Ok(Json(ack))
}

/// GET /api/experiments/:id/stats
pub async fn experiment_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExperimentStats>, ApiError> {
    let id = experiment_id(&id)?;
    Ok(Json(state.pipeline.get_stats(&id)?))
}

/// POST /api/experiments/:id/close
pub async fn close_experiment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExperimentStats>, ApiError> {
    let id = experiment_id(&id)?;
    let stats = run_blocking(&state, move |pipeline| pipeline.close_experiment(&id)).await?;
    Ok(Json(stats))
}

/// POST /api/experiments/:id/reset
pub async fn reset_experiment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExperimentStats>, ApiError> {
    let id = experiment_id(&id)?;
    let stats = run_blocking(&state, move |pipeline| pipeline.reset_experiment(&id)).await?;
    Ok(Json(stats))
}

/// GET /api/experiments/:id/comparison
pub async fn experiment_comparison(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExperimentComparison>, ApiError> {
    let id = experiment_id(&id)?;
    Ok(Json(state.pipeline.experiment_comparison(&id)?))
}

/// GET /api/variants/:variant_id/performance
pub async fn variant_performance(
    State(state): State<AppState>,
    Path(variant_id): Path<String>,
) -> Result<Json<VariantPerformance>, ApiError> {
    let variant_id: VariantId = variant_id.parse()?;
    Ok(Json(state.pipeline.variant_performance(&variant_id)?))
}

/// GET /api/dashboard
pub async fn dashboard(State(state): State<AppState>) -> Json<DashboardMetrics> {
    Json(state.pipeline.dashboard())
}

#[derive(Debug, Deserialize)]
pub struct TopPerformersQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_days")]
    pub days: u32,
    #[serde(default = "default_min_served")]
    pub min_served: u64,
}

fn default_limit() -> usize {
    10
}
fn default_days() -> u32 {
    30
}
fn default_min_served() -> u64 {
    10
}

/// GET /api/top-performers
pub async fn top_performers(
    State(state): State<AppState>,
    Query(query): Query<TopPerformersQuery>,
) -> Json<Vec<TopPerformer>> {
    Json(state.pipeline.top_performers(
        query.limit.min(MAX_TOP_PERFORMERS),
        query.days,
        query.min_served,
    ))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub store: String,
    pub cache_tiers: Vec<String>,
    pub experiments: usize,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let report = state.pipeline.health();
    Json(HealthResponse {
        status: report.status,
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        store: report.store,
        cache_tiers: report.cache_tiers,
        experiments: report.experiments,
    })
}

/// GET /ready
pub async fn readiness() -> StatusCode {
    StatusCode::OK
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
