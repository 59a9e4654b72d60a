//! Orchestration core (C8): the top-level daemon lifecycle.
//!
//! `Daemon` owns the job queue, the worker pool, the cron scheduler, the
//! repo-updater, and (through [`docbuilder_http::HttpServers`]) the HTTP
//! surface. It implements [`docbuilder_http::DaemonHandle`] so the HTTP
//! crate can drive it without depending on this crate — the dependency
//! edge runs daemon → http, never the other way.
//!
//! Job-queue feed and the bus are deliberately separate concerns: the
//! scheduler tick, `trigger_webhook_build`, and `trigger_manual_build` each
//! enqueue directly (so the HTTP layer gets a synchronous job id back),
//! and each also publishes the matching [`docbuilder_events::BusEvent`]
//! onto the bus purely for observability. The repo-updater's own
//! `BuildRequested` publish is observational in the same way — its actual
//! enqueue happens inline, not by a bus subscriber re-dispatching it.

pub mod collaborators;
pub mod queue;
pub mod repo_updater;
pub mod scheduler;
pub mod versioning;
pub mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use docbuilder_cache::CacheStore;
use docbuilder_config::{Config, ForgeConfig, ForgeKind};
use docbuilder_discovery::{DiscoveryService, ForgeHandle};
use docbuilder_events::{BuildReason, BusEvent, EventBus};
use docbuilder_forge::{ForgeClient, ForgejoClient, GithubClient, GitlabClient, LocalClient};
use docbuilder_git::RetryingGitClient;
use docbuilder_http::{
    DaemonHandle, DaemonStatusSnapshot, HttpServers, HttpServersConfig, LastBuildSummary, MetricsSnapshot, RepositoryStatus, SystemMetrics,
    WebhookForgeHandle,
};
use docbuilder_store::{BuildHistoryProjection, BuildStatus, EventStore};
use docbuilder_types::{Category, ClassifiedError, Repository};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collaborators::{HugoSiteGenerator, PassthroughTransformPipeline};
use crate::queue::{EnqueueRequest, JobQueue, JobReceiver};
use crate::versioning::expand_repository_versions;
use crate::worker::{RepoLocks, WorkerContext};

const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Grace period the worker pool gets to drain in-flight jobs before the
/// daemon forces a shutdown (§5).
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

/// State shared by the worker pool, the background tasks, and every
/// `DaemonHandle` method.
struct SharedState {
    config: Arc<ArcSwap<Config>>,
    repositories: Arc<ArcSwap<Vec<Repository>>>,
    config_file: Option<String>,
    started_at: DateTime<Utc>,
    queue: JobQueue,
    store: Arc<EventStore>,
    projection: Arc<BuildHistoryProjection>,
    bus: EventBus,
    data_dir: PathBuf,
    worker_count: usize,
    last_discovery_duration_ms: std::sync::atomic::AtomicU64,
    last_discovery_duration_set: std::sync::atomic::AtomicBool,
}

/// The orchestration core. Cheap to clone the `Arc` around; the struct
/// itself is not `Clone` since shutdown ownership must be unambiguous.
pub struct Daemon {
    state: Arc<SharedState>,
    job_rx: tokio::sync::Mutex<Option<JobReceiver>>,
    cancel_repo_updater: CancellationToken,
    cancel_poll_producer: CancellationToken,
    cancel_scheduler: CancellationToken,
    cancel_worker: CancellationToken,
    cancel_http: CancellationToken,
}

impl Daemon {
    /// Opens the event store, loads/builds the build-history projection,
    /// and expands configured repositories into tracked entities. Does
    /// not start any background task — call [`Daemon::start`] for that.
    pub async fn new(config: Config, config_file: Option<String>) -> Result<Arc<Self>, ClassifiedError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            ClassifiedError::builder(Category::Filesystem, format!("failed to create data dir {}: {e}", config.data_dir.display())).build()
        })?;

        let store_path = config.data_dir.join("events.sqlite");
        let store = Arc::new(EventStore::open(&store_path).await?);
        let projection = Arc::new(BuildHistoryProjection::new(config.daemon.history_size));
        projection.rebuild(&store).await?;

        let repositories = expand_repository_versions(&config.repositories);
        let (queue, job_rx) = JobQueue::new(config.daemon.queue_size);
        let data_dir = config.data_dir.clone();

        let state = Arc::new(SharedState {
            worker_count: config.daemon.concurrent_builds,
            config: Arc::new(ArcSwap::from_pointee(config)),
            repositories: Arc::new(ArcSwap::from_pointee(repositories)),
            config_file,
            started_at: Utc::now(),
            queue,
            store,
            projection,
            bus: EventBus::new(256),
            data_dir,
            last_discovery_duration_ms: std::sync::atomic::AtomicU64::new(0),
            last_discovery_duration_set: std::sync::atomic::AtomicBool::new(false),
        });

        Ok(Arc::new(Daemon {
            state,
            job_rx: tokio::sync::Mutex::new(Some(job_rx)),
            cancel_repo_updater: CancellationToken::new(),
            cancel_poll_producer: CancellationToken::new(),
            cancel_scheduler: CancellationToken::new(),
            cancel_worker: CancellationToken::new(),
            cancel_http: CancellationToken::new(),
        }))
    }

    /// Starts the worker pool, the scheduler, the repo-updater, and binds
    /// the HTTP surface; runs until `shutdown` is cancelled, then shuts
    /// down in reverse order: HTTP first (stop taking new work), then the
    /// triggers (scheduler/repo-updater), then the worker pool (given
    /// [`SHUTDOWN_GRACE`] to drain in-flight jobs).
    pub async fn start(self: Arc<Self>, http: HttpServersConfig, site_dir: PathBuf, shutdown: CancellationToken) -> Result<(), ClassifiedError> {
        let config = self.state.config.load_full();
        let queue = self.state.queue.clone();
        let job_rx = self.job_rx.lock().await.take().expect("Daemon::start called more than once");

        let forge_handles: Vec<ForgeHandle> = config
            .forges
            .iter()
            .filter(|f| f.auto_discover)
            .map(|f| ForgeHandle {
                name: f.name.clone(),
                client: build_forge_client(f),
                scopes: f.scopes.clone(),
                token: f.token.clone(),
            })
            .collect();
        let discovery = Arc::new(DiscoveryService::new(forge_handles, config.filtering.clone()));

        let webhook_handles: Vec<WebhookForgeHandle> = config
            .forges
            .iter()
            .filter_map(|f| {
                f.webhook_secret.clone().map(|secret| WebhookForgeHandle {
                    client: build_forge_client(f),
                    secret,
                })
            })
            .collect();

        let servers = HttpServers::bind(http, site_dir.clone(), self.clone() as Arc<dyn DaemonHandle>, webhook_handles).await?;
        let livereload_hub = servers.livereload_hub.clone();

        let git = Arc::new(RetryingGitClient::new(config.sync.backoff.clone()));
        let cache = Arc::new(CacheStore::new(self.state.data_dir.join("cache")));
        let workspace_root = self.state.data_dir.join("workspace");

        let worker_ctx = Arc::new(WorkerContext {
            config: self.state.config.clone(),
            repositories: self.state.repositories.clone(),
            git,
            repo_locks: Arc::new(RepoLocks::new()),
            store: self.state.store.clone(),
            projection: self.state.projection.clone(),
            cache,
            transforms: Arc::new(PassthroughTransformPipeline),
            site_generator: Arc::new(HugoSiteGenerator),
            livereload: Arc::new(move || livereload_hub.notify_reload()),
            workspace_root,
            site_root: site_dir,
            concurrent_builds: config.daemon.concurrent_builds,
        });

        let worker_handle = tokio::spawn(crate::worker::run_worker(job_rx, worker_ctx, self.cancel_worker.clone()));

        let scheduler_handle = tokio::spawn(crate::scheduler::run_scheduler(
            self.state.config.clone(),
            queue.clone(),
            self.state.bus.clone(),
            self.cancel_scheduler.clone(),
        ));

        let (ready_tx, ready_rx) = oneshot::channel();
        let repo_updater_handle = tokio::spawn(crate::repo_updater::run_repo_updater(
            self.state.repositories.clone(),
            self.state.data_dir.join("remote_heads.json"),
            queue.clone(),
            self.state.bus.clone(),
            self.cancel_repo_updater.clone(),
            ready_tx,
        ));
        let _ = ready_rx.await;

        let poll_producer_handle = tokio::spawn(crate::repo_updater::run_remote_poll_producer(
            self.state.repositories.clone(),
            self.state.bus.clone(),
            self.cancel_poll_producer.clone(),
        ));

        let discover_result = discovery.discover().await;
        if !discover_result.errors.is_empty() {
            warn!(errors = ?discover_result.errors, "startup discovery reported per-forge failures");
        }
        if !discover_result.repositories.is_empty() {
            merge_discovered_repositories(&self.state.repositories, discover_result.repositories);
        }

        let http_cancel = self.cancel_http.clone();
        let http_handle = tokio::spawn(async move { servers.serve(http_cancel).await });

        shutdown.cancelled().await;
        info!("shutdown requested, stopping http surface");
        self.cancel_http.cancel();
        let _ = http_handle.await;

        info!("stopping scheduler and repo-updater");
        self.cancel_scheduler.cancel();
        self.cancel_poll_producer.cancel();
        self.cancel_repo_updater.cancel();
        let _ = scheduler_handle.await;
        let _ = poll_producer_handle.await;
        let _ = repo_updater_handle.await;

        info!("draining worker pool (grace: {:?})", SHUTDOWN_GRACE);
        self.cancel_worker.cancel();
        match tokio::time::timeout(SHUTDOWN_GRACE, worker_handle).await {
            Ok(_) => {}
            Err(_) => warn!("worker pool did not drain within the shutdown grace period"),
        }

        self.state.store.close().await;
        Ok(())
    }

}

/// Constructs the `ForgeClient` variant matching a configured forge's
/// `kind` (§6). Shared by [`Daemon::start`]/[`Daemon::trigger_discover`]
/// and by `docbuilder-cli`'s standalone `discover` command, so both paths
/// build identical clients from the same config.
pub fn build_forge_client(cfg: &ForgeConfig) -> Arc<dyn ForgeClient> {
    match cfg.kind {
        ForgeKind::Github => Arc::new(GithubClient::new(cfg.base_url.clone(), cfg.token.clone())),
        ForgeKind::Gitlab => Arc::new(GitlabClient::new(cfg.base_url.clone(), cfg.token.clone())),
        ForgeKind::Forgejo => Arc::new(ForgejoClient::new(
            cfg.base_url.clone().unwrap_or_else(|| "https://codeberg.org".to_string()),
            cfg.token.clone(),
        )),
        ForgeKind::Local => Arc::new(LocalClient::new(cfg.base_url.clone().unwrap_or_else(|| ".".to_string()))),
    }
}

fn merge_discovered_repositories(slot: &Arc<ArcSwap<Vec<Repository>>>, discovered: Vec<Repository>) {
    let mut merged = (**slot.load()).clone();
    let known: std::collections::BTreeSet<String> = merged.iter().map(|r| r.name.clone()).collect();
    for repo in discovered {
        if !known.contains(&repo.name) {
            merged.push(repo);
        }
    }
    merged.sort_by(|a, b| a.name.cmp(&b.name));
    slot.store(Arc::new(merged));
}

/// Matches a webhook's `repository` field (a forge "owner/name"-style
/// full name) against tracked repositories by URL suffix or bare name.
fn find_repo_by_webhook_name(repositories: &[Repository], full_name: &str) -> Option<Repository> {
    repositories
        .iter()
        .find(|r| r.url.trim_end_matches(".git").ends_with(full_name) || r.name == full_name)
        .cloned()
}

fn sanitize_config(config: &Config) -> serde_json::Value {
    let mut value = serde_json::to_value(config).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(forges) = value.get_mut("forges").and_then(|v| v.as_array_mut()) {
        for forge in forges {
            if let Some(obj) = forge.as_object_mut() {
                obj.remove("token");
                obj.remove("webhook_secret");
            }
        }
    }
    if let Some(repos) = value.get_mut("repositories").and_then(|v| v.as_array_mut()) {
        for repo in repos {
            if let Some(obj) = repo.as_object_mut() {
                obj.remove("auth");
            }
        }
    }
    value
}

#[async_trait::async_trait]
impl DaemonHandle for Daemon {
    fn version(&self) -> &str {
        VERSION
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.state.started_at
    }

    fn config_file(&self) -> Option<String> {
        self.state.config_file.clone()
    }

    fn sanitized_config(&self) -> serde_json::Value {
        sanitize_config(&self.state.config.load())
    }

    async fn status(&self) -> DaemonStatusSnapshot {
        let repositories = self.state.repositories.load();
        let last_build = self.state.projection.history().into_iter().last().map(|summary| LastBuildSummary {
            time: summary.completed_at.unwrap_or(summary.started_at),
            outcome: format!("{:?}", summary.status).to_lowercase(),
            summary: summary
                .error_message
                .clone()
                .unwrap_or_else(|| format!("{} repos, {} files", summary.repo_count, summary.file_count)),
        });

        let config = self.state.config.load();
        let repo_statuses = status_per_base_repo(&repositories, &config.repositories);

        DaemonStatusSnapshot {
            status: "running".to_string(),
            version: VERSION.to_string(),
            uptime_seconds: (Utc::now() - self.state.started_at).num_seconds().max(0) as u64,
            config_file: self.state.config_file.clone(),
            queue_length: self.state.queue.len().await,
            active_jobs: self.state.queue.active_count().await,
            last_build,
            repositories: repo_statuses,
            system: SystemMetrics {
                memory_bytes: read_process_memory_bytes(),
                worker_count: self.state.worker_count,
                workspace_size_bytes: directory_size(&self.state.data_dir.join("workspace")),
            },
        }
    }

    async fn trigger_webhook_build(&self, full_name: &str, branch: Option<String>) -> Result<Option<String>, ClassifiedError> {
        let repositories = self.state.repositories.load();
        let Some(repo) = find_repo_by_webhook_name(&repositories, full_name) else {
            return Ok(None);
        };

        self.state.bus.publish(BusEvent::BuildRequested {
            reason: BuildReason::Webhook,
            repo_url: Some(repo.url.clone()),
            branch: branch.clone(),
            immediate: true,
        });

        let id = self
            .state
            .queue
            .enqueue(EnqueueRequest {
                kind: docbuilder_types::JobKind::WebhookBuild,
                priority: 2,
                repo: Some(repo.name.clone()),
                branch,
                reason: format!("webhook:{full_name}"),
                immediate: true,
            })
            .await?;
        Ok(Some(format!("job-{id}")))
    }

    async fn trigger_manual_build(&self) -> Result<String, ClassifiedError> {
        self.state.bus.publish(BusEvent::BuildRequested {
            reason: BuildReason::Manual,
            repo_url: None,
            branch: None,
            immediate: true,
        });
        let id = self
            .state
            .queue
            .enqueue(EnqueueRequest {
                kind: docbuilder_types::JobKind::Build,
                priority: 2,
                repo: None,
                branch: None,
                reason: "manual".to_string(),
                immediate: true,
            })
            .await?;
        Ok(format!("job-{id}"))
    }

    async fn trigger_discover(&self) -> Result<(), ClassifiedError> {
        let config = self.state.config.load_full();
        let forge_handles: Vec<ForgeHandle> = config
            .forges
            .iter()
            .filter(|f| f.auto_discover)
            .map(|f| ForgeHandle {
                name: f.name.clone(),
                client: build_forge_client(f),
                scopes: f.scopes.clone(),
                token: f.token.clone(),
            })
            .collect();
        let discovery = DiscoveryService::new(forge_handles, config.filtering.clone());

        let started = Instant::now();
        let result = discovery.discover().await;
        self.state
            .last_discovery_duration_ms
            .store(started.elapsed().as_millis() as u64, std::sync::atomic::Ordering::Relaxed);
        self.state.last_discovery_duration_set.store(true, std::sync::atomic::Ordering::Relaxed);

        if !result.errors.is_empty() {
            warn!(errors = ?result.errors, "on-demand discovery reported per-forge failures");
        }
        if !result.repositories.is_empty() {
            merge_discovered_repositories(&self.state.repositories, result.repositories);
        }
        Ok(())
    }

    async fn metrics(&self) -> MetricsSnapshot {
        let repositories = self.state.repositories.load();
        let last_discovery_duration_ms = self
            .state
            .last_discovery_duration_set
            .load(std::sync::atomic::Ordering::Relaxed)
            .then(|| self.state.last_discovery_duration_ms.load(std::sync::atomic::Ordering::Relaxed));
        let last_build_duration_ms = self.state.projection.active_build().is_none().then(|| 0).and(None);

        MetricsSnapshot {
            // No per-request counter is wired into `docbuilder-http`'s
            // middleware chain yet; this surface reports what's available.
            http_requests_total: 0,
            active_jobs: self.state.queue.active_count().await,
            last_discovery_duration_ms,
            last_build_duration_ms,
            repositories_total: repositories.len(),
        }
    }
}

fn status_per_base_repo(repositories: &[Repository], configs: &[docbuilder_config::RepositoryConfig]) -> Vec<RepositoryStatus> {
    let mut grouped: std::collections::BTreeMap<String, Vec<&Repository>> = std::collections::BTreeMap::new();
    for repo in repositories {
        let base = repo.version.as_ref().map(|_| base_name(&repo.name)).unwrap_or_else(|| repo.name.clone());
        grouped.entry(base).or_default().push(repo);
    }

    grouped
        .into_iter()
        .map(|(base, repos)| {
            let available_versions: Vec<String> = repos.iter().filter_map(|r| r.version.clone()).collect();
            let default_version = versioning::default_version(configs, &base).or_else(|| available_versions.first().cloned());
            RepositoryStatus {
                name: base,
                last_sync: None,
                last_build: None,
                version_count: available_versions.len().max(1),
                default_version,
                available_versions,
            }
        })
        .collect()
}

fn base_name(versioned_name: &str) -> String {
    versioned_name.split('@').next().unwrap_or(versioned_name).to_string()
}

fn read_process_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|contents| contents.split_whitespace().nth(1).map(str::to_string))
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

fn directory_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else { return 0 };
    let mut total = 0u64;
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else { continue };
        if metadata.is_dir() {
            total += directory_size(&entry.path());
        } else {
            total += metadata.len();
        }
    }
    total
}
