//! The slice of the orchestrator (C8) that the HTTP surface (C9) is
//! allowed to see (§4.9, §4.10, §6, §9). `docbuilder-http` never depends
//! on `docbuilder-daemon` directly — the daemon implements this trait and
//! hands a `dyn DaemonHandle` to the listeners at startup, keeping the
//! dependency edge one-directional.

use chrono::{DateTime, Utc};
use docbuilder_types::ClassifiedError;
use serde::Serialize;

#[async_trait::async_trait]
pub trait DaemonHandle: Send + Sync {
    fn version(&self) -> &str;
    fn started_at(&self) -> DateTime<Utc>;
    fn config_file(&self) -> Option<String>;

    /// Sanitized configuration snapshot for `GET /api/config` — auth
    /// details (tokens, webhook secrets, SSH keys) are never included.
    fn sanitized_config(&self) -> serde_json::Value;

    async fn status(&self) -> DaemonStatusSnapshot;

    /// Called by a webhook handler once a parsed event names a
    /// repository/branch; returns the triggered build's job id, or `None`
    /// if the repository isn't one this daemon tracks.
    async fn trigger_webhook_build(&self, full_name: &str, branch: Option<String>) -> Result<Option<String>, ClassifiedError>;

    /// `POST /api/trigger/build` — always enqueues a build across every
    /// tracked repository.
    async fn trigger_manual_build(&self) -> Result<String, ClassifiedError>;

    /// `POST /api/trigger/discover` — runs discovery out of band.
    async fn trigger_discover(&self) -> Result<(), ClassifiedError>;

    async fn metrics(&self) -> MetricsSnapshot;
}

/// `GET /metrics` payload (§6).
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub http_requests_total: u64,
    pub active_jobs: usize,
    pub last_discovery_duration_ms: Option<u64>,
    pub last_build_duration_ms: Option<u64>,
    pub repositories_total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastBuildSummary {
    pub time: DateTime<Utc>,
    pub outcome: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepositoryStatus {
    pub name: String,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_build: Option<DateTime<Utc>>,
    pub version_count: usize,
    pub default_version: Option<String>,
    pub available_versions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub memory_bytes: u64,
    pub worker_count: usize,
    pub workspace_size_bytes: u64,
}

/// Aggregate daemon status (§4.10), shared by `/health`, `/api/status`,
/// and the HTML status page.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatusSnapshot {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub config_file: Option<String>,
    pub queue_length: usize,
    pub active_jobs: usize,
    pub last_build: Option<LastBuildSummary>,
    pub repositories: Vec<RepositoryStatus>,
    pub system: SystemMetrics,
}
