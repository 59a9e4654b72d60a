//! Webhook listener (§4.9, §6): one route per forge type. Each handler
//! reads the body once, validates the signature against every configured
//! forge of that type until one accepts it, asks the matching client to
//! parse the event, and — if it names a repository/branch — triggers a
//! build through the [`DaemonHandle`].

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use chrono::Utc;
use docbuilder_forge::ForgeClient;
use docbuilder_types::{Category, ClassifiedError};
use serde::Serialize;

use crate::daemon_handle::DaemonHandle;
use crate::middleware::error_response;

/// A configured forge's webhook binding: its client and the shared secret
/// (HMAC key or GitLab token) used to validate inbound deliveries.
#[derive(Clone)]
pub struct WebhookForgeHandle {
    pub client: Arc<dyn ForgeClient>,
    pub secret: String,
}

#[derive(Clone)]
struct WebhookState {
    daemon: Arc<dyn DaemonHandle>,
    handles: Arc<Vec<WebhookForgeHandle>>,
}

pub fn router(handles: Vec<WebhookForgeHandle>, daemon: Arc<dyn DaemonHandle>) -> Router {
    let state = WebhookState {
        daemon,
        handles: Arc::new(handles),
    };
    Router::new()
        .route("/webhook/github", post(handle_github))
        .route("/webhook/gitlab", post(handle_gitlab))
        .route("/webhook/forgejo", post(handle_forgejo))
        .with_state(state)
}

#[derive(Serialize)]
struct Received {
    status: &'static str,
    timestamp: chrono::DateTime<Utc>,
    event: String,
    source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    build_job_id: Option<String>,
}

async fn handle_github(State(state): State<WebhookState>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    handle(&state, "github", "X-GitHub-Event", "X-Hub-Signature-256", &headers, &body).await
}

async fn handle_gitlab(State(state): State<WebhookState>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    handle(&state, "gitlab", "X-Gitlab-Event", "X-Gitlab-Token", &headers, &body).await
}

async fn handle_forgejo(State(state): State<WebhookState>, headers: HeaderMap, body: axum::body::Bytes) -> Response {
    let event_header = if headers.contains_key("X-Forgejo-Event") {
        "X-Forgejo-Event"
    } else {
        "X-Gitea-Event"
    };
    handle(&state, "forgejo", event_header, "X-Hub-Signature-256", &headers, &body).await
}

async fn handle(
    state: &WebhookState,
    source: &'static str,
    event_header: &str,
    signature_header: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Response {
    let event_type = headers
        .get(event_header)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let signature = headers.get(signature_header).and_then(|v| v.to_str().ok()).unwrap_or("");

    let candidates: Vec<&WebhookForgeHandle> = state.handles.iter().filter(|h| h.client.name() == source).collect();
    if candidates.is_empty() {
        return error_response(&ClassifiedError::builder(Category::NotFound, format!("no {source} forge configured")).build());
    }

    let matched = candidates.iter().find(|h| h.client.validate_webhook(body, signature, &h.secret));
    let Some(handle) = matched else {
        return error_response(
            &ClassifiedError::builder(Category::Validation, "webhook signature_invalid")
                .context("forge", source)
                .build(),
        );
    };

    let parsed = match handle.client.parse_webhook_event(body, &event_type) {
        Ok(event) => event,
        Err(_) => {
            // Event types that carry no repository (ping, issue comment, …)
            // are acknowledged but never trigger a build.
            return accepted(source, &event_type, None);
        }
    };

    let build_job_id = match state.daemon.trigger_webhook_build(&parsed.repository, parsed.branch.clone()).await {
        Ok(id) => id,
        Err(err) => return error_response(&err),
    };

    accepted(source, &event_type, build_job_id)
}

fn accepted(source: &'static str, event: &str, build_job_id: Option<String>) -> Response {
    let body = Received {
        status: "received",
        timestamp: Utc::now(),
        event: event.to_string(),
        source,
        build_job_id,
    };
    (StatusCode::ACCEPTED, axum::Json(body)).into_response()
}
