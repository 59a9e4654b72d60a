//! Admin listener (§4.9, §4.10): health/metrics probes, daemon status,
//! sanitized config, and trigger endpoints for discovery/build.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::daemon_handle::DaemonHandle;
use crate::middleware::error_response;

#[derive(Clone)]
struct AdminState {
    daemon: Arc<dyn DaemonHandle>,
}

pub fn router(daemon: Arc<dyn DaemonHandle>) -> Router {
    let state = AdminState { daemon };
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/status", get(api_status))
        .route("/api/config", get(api_config))
        .route("/api/trigger/discover", post(trigger_discover))
        .route("/api/trigger/build", post(trigger_build))
        .route("/api/status/page", get(status_page))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    timestamp: chrono::DateTime<Utc>,
    version: String,
    uptime: u64,
    daemon_status: String,
    active_jobs: usize,
}

async fn health(State(state): State<AdminState>) -> Response {
    let status = state.daemon.status().await;
    let body = HealthBody {
        status: "ok",
        timestamp: Utc::now(),
        version: status.version,
        uptime: status.uptime_seconds,
        daemon_status: status.status,
        active_jobs: status.active_jobs,
    };
    axum::Json(body).into_response()
}

#[derive(Serialize)]
struct MetricsBody {
    status: &'static str,
    timestamp: chrono::DateTime<Utc>,
    http_requests_total: u64,
    active_jobs: usize,
    last_discovery_duration: Option<u64>,
    last_build_duration: Option<u64>,
    repositories_total: usize,
}

async fn metrics(State(state): State<AdminState>) -> Response {
    let m = state.daemon.metrics().await;
    let body = MetricsBody {
        status: "ok",
        timestamp: Utc::now(),
        http_requests_total: m.http_requests_total,
        active_jobs: m.active_jobs,
        last_discovery_duration: m.last_discovery_duration_ms,
        last_build_duration: m.last_build_duration_ms,
        repositories_total: m.repositories_total,
    };
    axum::Json(body).into_response()
}

#[derive(Deserialize)]
struct FormatQuery {
    format: Option<String>,
}

async fn api_status(State(state): State<AdminState>) -> Response {
    axum::Json(state.daemon.status().await).into_response()
}

async fn api_config(State(state): State<AdminState>) -> Response {
    axum::Json(state.daemon.sanitized_config()).into_response()
}

async fn trigger_discover(State(state): State<AdminState>) -> Response {
    match state.daemon.trigger_discover().await {
        Ok(()) => (StatusCode::ACCEPTED, axum::Json(serde_json::json!({"status": "discovering"}))).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn trigger_build(State(state): State<AdminState>) -> Response {
    match state.daemon.trigger_manual_build().await {
        Ok(job_id) => (StatusCode::ACCEPTED, axum::Json(serde_json::json!({"status": "building", "build_job_id": job_id}))).into_response(),
        Err(err) => error_response(&err),
    }
}

/// Renders JSON when `Accept: application/json` or `?format=json` is
/// present; otherwise a minimal HTML status page (§4.10).
async fn status_page(State(state): State<AdminState>, headers: HeaderMap, Query(query): Query<FormatQuery>) -> Response {
    let status = state.daemon.status().await;
    let wants_json = query.format.as_deref() == Some("json")
        || headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"));
    if wants_json {
        return axum::Json(status).into_response();
    }
    Html(render_status_html(&status)).into_response()
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_status_html(status: &crate::daemon_handle::DaemonStatusSnapshot) -> String {
    let repos = status
        .repositories
        .iter()
        .map(|r| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
                html_escape(&r.name),
                r.version_count,
                r.default_version.as_deref().map(html_escape).unwrap_or_else(|| "-".to_string())
            )
        })
        .collect::<String>();
    format!(
        "<!doctype html><html><head><title>docbuilder status</title></head><body>\
         <h1>docbuilder — {status} (v{version})</h1>\
         <p>uptime: {uptime}s · queue: {queue} · active jobs: {active}</p>\
         <table><thead><tr><th>repository</th><th>versions</th><th>default</th></tr></thead>\
         <tbody>{repos}</tbody></table>\
         </body></html>",
        status = status.status,
        version = status.version,
        uptime = status.uptime_seconds,
        queue = status.queue_length,
        active = status.active_jobs,
        repos = repos,
    )
}
