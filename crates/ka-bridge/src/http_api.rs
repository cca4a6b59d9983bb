use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{header, Uri},
    middleware as axum_middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use ka_core::types::{CycleReport, CyclePhase, NextAction, StatsReader, TickOutcome};
use ka_telemetry::metrics::global_metrics;
use ka_telemetry::middleware::{metrics_middleware, request_id_middleware};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api_error::ApiError;

// ---------------------------------------------------------------------------
// Engine seam
// ---------------------------------------------------------------------------

/// Point-in-time view of the cycle engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub next_action: NextAction,
    pub phase: CyclePhase,
    pub authenticated: bool,
}

/// What the status API needs from the cycle engine.
#[async_trait]
pub trait CycleControl: Send + Sync {
    /// Run one cycle now, sharing the engine's re-entrancy guard.
    async fn trigger(&self) -> TickOutcome;

    async fn status(&self) -> EngineStatus;
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Shared state for all handlers.
pub struct ApiState {
    pub stats: StatsReader,
    pub start_time: Instant,
    pub control: Option<Arc<dyn CycleControl>>,
}

impl ApiState {
    pub fn new(stats: StatsReader) -> Self {
        Self {
            stats,
            start_time: Instant::now(),
            control: None,
        }
    }

    pub fn with_control(mut self, control: Arc<dyn CycleControl>) -> Self {
        self.control = Some(control);
        self
    }
}

/// Build the status router.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .route("/metrics/prometheus", get(get_metrics_prometheus))
        .route("/trigger", post(post_trigger))
        .fallback(not_found)
        .layer(axum_middleware::from_fn(metrics_middleware))
        .layer(axum_middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RootResponse {
    service: &'static str,
    version: &'static str,
    status: &'static str,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MemoryUsage {
    rss_bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunCounts {
    total_runs: u64,
    successful_runs: u64,
    failed_runs: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    uptime: u64,
    memory: Option<MemoryUsage>,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    stats: RunCounts,
    last_error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricsResponse {
    total_runs: u64,
    successful_runs: u64,
    failed_runs: u64,
    consecutive_failures: u64,
    success_rate: Option<f64>,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    next_action: Option<NextAction>,
    phase: Option<CyclePhase>,
    authenticated: Option<bool>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_root() -> Json<RootResponse> {
    Json(RootResponse {
        service: "ka-keepalive",
        version: env!("CARGO_PKG_VERSION"),
        status: "alive",
        timestamp: Utc::now(),
    })
}

async fn get_health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let stats = state.stats.snapshot().await;
    let status = if stats.last_run_failed() {
        "degraded"
    } else {
        "healthy"
    };
    Json(HealthResponse {
        status,
        uptime: state.start_time.elapsed().as_secs(),
        memory: resident_memory_bytes().map(|rss_bytes| MemoryUsage { rss_bytes }),
        last_run: stats.last_run_at,
        next_run: stats.next_run_at,
        stats: RunCounts {
            total_runs: stats.total_runs,
            successful_runs: stats.successful_runs,
            failed_runs: stats.failed_runs,
        },
        last_error: stats.last_error,
    })
}

async fn get_metrics(State(state): State<Arc<ApiState>>) -> Json<MetricsResponse> {
    let stats = state.stats.snapshot().await;
    let engine = match &state.control {
        Some(control) => Some(control.status().await),
        None => None,
    };
    Json(MetricsResponse {
        total_runs: stats.total_runs,
        successful_runs: stats.successful_runs,
        failed_runs: stats.failed_runs,
        consecutive_failures: stats.consecutive_failures,
        success_rate: stats.success_rate(),
        last_run: stats.last_run_at,
        next_run: stats.next_run_at,
        next_action: engine.map(|e| e.next_action),
        phase: engine.map(|e| e.phase),
        authenticated: engine.map(|e| e.authenticated),
    })
}

/// GET /metrics/prometheus
async fn get_metrics_prometheus() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        global_metrics().export_prometheus(),
    )
}

/// POST /trigger: run one cycle and return its report.
async fn post_trigger(State(state): State<Arc<ApiState>>) -> Result<Json<CycleReport>, ApiError> {
    let control = state
        .control
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("cycle engine not attached".into()))?;

    info!("manual cycle requested");
    match control.trigger().await {
        TickOutcome::Completed(report) => Ok(Json(report)),
        TickOutcome::Skipped => Err(ApiError::Conflict(
            "a keep-alive cycle is already running or the daemon is stopping".into(),
        )),
    }
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(format!("no route for {}", uri.path()))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resident set size from `/proc/self/status`; `None` off Linux.
fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use ka_core::types::StatsHandle;
    use tower::ServiceExt;

    #[test]
    fn parses_vm_rss_in_bytes() {
        let status = "Name:\tka-daemon\nVmPeak:\t  20000 kB\nVmRSS:\t   1234 kB\n";
        assert_eq!(parse_vm_rss(status), Some(1234 * 1024));
        assert_eq!(parse_vm_rss("Name:\tx\n"), None);
    }

    #[tokio::test]
    async fn trigger_without_engine_is_unavailable() {
        let state = Arc::new(ApiState::new(StatsHandle::new().reader()));
        let response = api_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/trigger")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unknown_path_is_json_404() {
        let state = Arc::new(ApiState::new(StatsHandle::new().reader()));
        let response = api_router(state)
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"error":"no route for /nope"}"#);
    }
}
