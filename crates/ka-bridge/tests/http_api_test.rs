use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ka_bridge::{api_router, ApiState, CycleControl, EngineStatus};
use ka_core::types::{CycleReport, CyclePhase, NextAction, StatsHandle, TickOutcome};
use serde_json::Value;

/// Stand-in engine: completes with a canned report unless told it is busy.
#[derive(Default)]
struct StubControl {
    busy: AtomicBool,
    triggered: AtomicUsize,
}

#[async_trait]
impl CycleControl for StubControl {
    async fn trigger(&self) -> TickOutcome {
        if self.busy.load(Ordering::SeqCst) {
            return TickOutcome::Skipped;
        }
        self.triggered.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        TickOutcome::Completed(CycleReport {
            action: NextAction::Login,
            success: false,
            attempts: 20,
            alert_dispatched: true,
            retry_after: Some(Duration::from_secs(60)),
            error: Some("rejected by backend (401): invalid credentials".into()),
            started_at: now,
            finished_at: now,
        })
    }

    async fn status(&self) -> EngineStatus {
        EngineStatus {
            next_action: NextAction::Logout,
            phase: CyclePhase::Idle,
            authenticated: true,
        }
    }
}

async fn start_test_server(control: Option<Arc<StubControl>>) -> (String, StatsHandle) {
    let stats = StatsHandle::new();
    let mut state = ApiState::new(stats.reader());
    if let Some(control) = control {
        state = state.with_control(control);
    }
    let router = api_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to ephemeral port");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{addr}"), stats)
}

#[tokio::test]
async fn test_root_reports_alive() {
    let (base, _stats) = start_test_server(None).await;

    let resp = reqwest::get(format!("{base}/")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("x-request-id"));

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "alive");
    assert_eq!(body["service"], "ka-keepalive");
    assert!(body["version"].is_string());
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_health_before_first_run() {
    let (base, _stats) = start_test_server(None).await;

    let body: Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["uptime"].is_number());
    assert!(body["lastRun"].is_null());
    assert_eq!(body["stats"]["totalRuns"], 0);
    assert_eq!(body["stats"]["successfulRuns"], 0);
    assert_eq!(body["stats"]["failedRuns"], 0);
    assert!(body["lastError"].is_null());
}

#[tokio::test]
async fn test_health_degraded_after_failed_run() {
    let (base, stats) = start_test_server(None).await;
    stats.record_success(Utc::now()).await;
    stats.record_failure(Utc::now(), "backend unreachable").await;

    let body: Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["stats"]["totalRuns"], 2);
    assert_eq!(body["stats"]["failedRuns"], 1);
    assert_eq!(body["lastError"], "backend unreachable");
    assert!(body["lastRun"].is_string());

    stats.record_success(Utc::now()).await;
    let body: Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_metrics_include_engine_status() {
    let (base, stats) = start_test_server(Some(Arc::new(StubControl::default()))).await;
    stats.record_success(Utc::now()).await;
    stats.record_success(Utc::now()).await;
    stats.record_failure(Utc::now(), "x").await;
    stats.set_next_run(Some(Utc::now())).await;

    let body: Value = reqwest::get(format!("{base}/metrics"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["totalRuns"], 3);
    assert_eq!(body["successfulRuns"], 2);
    assert_eq!(body["failedRuns"], 1);
    assert_eq!(body["consecutiveFailures"], 1);
    let rate = body["successRate"].as_f64().unwrap();
    assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    assert!(body["nextRun"].is_string());
    assert_eq!(body["nextAction"], "logout");
    assert_eq!(body["phase"], "idle");
    assert_eq!(body["authenticated"], true);
}

#[tokio::test]
async fn test_metrics_without_engine() {
    let (base, _stats) = start_test_server(None).await;

    let body: Value = reqwest::get(format!("{base}/metrics"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["totalRuns"], 0);
    assert!(body["successRate"].is_null());
    assert!(body["nextAction"].is_null());
}

#[tokio::test]
async fn test_trigger_returns_report() {
    let control = Arc::new(StubControl::default());
    let (base, _stats) = start_test_server(Some(control.clone())).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/trigger"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["action"], "login");
    assert_eq!(body["success"], false);
    assert_eq!(body["attempts"], 20);
    assert_eq!(body["alertDispatched"], true);
    assert_eq!(body["retryAfter"], 60_000);
    assert_eq!(control.triggered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_trigger_conflicts_while_cycle_running() {
    let control = Arc::new(StubControl::default());
    control.busy.store(true, Ordering::SeqCst);
    let (base, _stats) = start_test_server(Some(control.clone())).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/trigger"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("already running"));
    assert_eq!(control.triggered.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_prometheus_exposes_http_counters() {
    let (base, _stats) = start_test_server(None).await;
    reqwest::get(format!("{base}/health")).await.unwrap();

    let resp = reqwest::get(format!("{base}/metrics/prometheus"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));
    let text = resp.text().await.unwrap();
    assert!(text.contains("# TYPE http_requests_total counter"));
    assert!(text.contains("path=\"/health\""));
}
