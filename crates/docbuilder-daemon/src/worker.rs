//! Worker pool (§4.8): pulls jobs off the [`crate::queue::JobQueue`] and
//! runs the nine-step build pipeline — sync, discover, hash, cache check,
//! transform, generate, cache store, livereload notify, report — recording
//! every step as an event.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use docbuilder_cache::{CacheDecision, CacheStore};
use docbuilder_config::Config;
use docbuilder_git::{RetryingGitClient, UpdateOptions};
use docbuilder_store::{BuildHistoryProjection, EventStore};
use docbuilder_types::{
    BuildCompletedPayload, BuildFailedPayload, BuildOutcome, BuildSignature, BuildStartedPayload, Category, ClassifiedError,
    DocumentsDiscoveredPayload, EventType, Job, RepoHash, Repository, RepositoryClonedPayload, Severity,
};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collaborators::{SiteGenerator, TransformPipeline};
use crate::queue::JobReceiver;

/// Serializes git-workspace mutation per repository name while allowing
/// concurrent sync across different repositories (§5).
#[derive(Default)]
pub struct RepoLocks {
    locks: Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(name.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

/// Shared context a worker needs to process any job.
pub struct WorkerContext {
    pub config: Arc<arc_swap::ArcSwap<Config>>,
    pub repositories: Arc<arc_swap::ArcSwap<Vec<Repository>>>,
    pub git: Arc<RetryingGitClient>,
    pub repo_locks: Arc<RepoLocks>,
    pub store: Arc<EventStore>,
    pub projection: Arc<BuildHistoryProjection>,
    pub cache: Arc<CacheStore>,
    pub transforms: Arc<dyn TransformPipeline>,
    pub site_generator: Arc<dyn SiteGenerator>,
    pub livereload: Arc<dyn Fn() + Send + Sync>,
    pub workspace_root: PathBuf,
    pub site_root: PathBuf,
    pub concurrent_builds: usize,
}

/// Dispatches jobs off the queue onto a bounded pool of concurrent build
/// executions (§4.8, §5: "the queue enforces `concurrent_builds` via a
/// semaphore held by workers"). Dequeuing itself stays single-threaded —
/// a `tokio::sync::mpsc::Receiver` has exactly one consumer — but each
/// dequeued job is spawned onto its own task gated by `permits`, so up to
/// `concurrent_builds` jobs run their nine-step pipelines at once while
/// the dispatcher keeps draining the queue in FIFO order. Runs until the
/// queue is drained and closed (during shutdown) or the cancellation
/// token trips, waiting for in-flight jobs to finish either way.
pub async fn run_worker(mut jobs: JobReceiver, ctx: Arc<WorkerContext>, cancel: CancellationToken) {
    let permits = Arc::new(Semaphore::new(ctx.concurrent_builds.max(1)));
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = jobs.recv() => job,
        };
        let Some(job) = job else { break };

        let jobs_table = jobs.jobs();
        if let Some(entry) = jobs_table.lock().await.get_mut(&job.id) {
            entry.state = docbuilder_types::JobState::Running;
        }

        let permit = permits.clone().acquire_owned().await.expect("semaphore never closed");
        let ctx = ctx.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            let outcome = process_job(&job, &ctx).await;

            let final_state = match &outcome {
                Ok(()) => docbuilder_types::JobState::Succeeded,
                Err(_) => docbuilder_types::JobState::Failed,
            };
            if let Some(entry) = jobs_table.lock().await.get_mut(&job.id) {
                entry.state = final_state;
            }
            if let Err(err) = outcome {
                warn!(job_id = job.id, error = %err, "build job failed");
            }
        });
    }

    while in_flight.join_next().await.is_some() {}
}

/// The nine-step build pipeline (§4.8). A single repo failure with
/// `severity >= Error` aborts the whole build; `Warning`-severity failures
/// are recorded and the remaining repositories still proceed.
pub async fn process_job(job: &Job, ctx: &WorkerContext) -> Result<(), ClassifiedError> {
    let build_id = format!("build-{}-{}", job.id, Utc::now().timestamp_millis());
    let started = Instant::now();
    let config = ctx.config.load();

    let repositories: Vec<Repository> = ctx
        .repositories
        .load()
        .iter()
        .filter(|r| job.repo.as_deref().is_none_or(|name| r.name == name))
        .cloned()
        .collect();

    append_event(
        ctx,
        &build_id,
        EventType::BuildStarted,
        &BuildStartedPayload {
            reason: job.reason.clone(),
            repo_filter: job.repo.clone(),
        },
    )
    .await?;

    let mut repo_hashes = Vec::new();
    let mut doc_file_count: u64 = 0;

    for repo in &repositories {
        match sync_and_hash_repo(ctx, &build_id, repo, config.sync.incremental).await {
            Ok((hash, file_count)) => {
                repo_hashes.push(hash);
                doc_file_count += file_count;
            }
            Err(err) => {
                record_failure(ctx, &build_id, "sync", &err).await;
                if err.aborts_job() {
                    return Err(err);
                }
            }
        }
    }

    let signature = BuildSignature::compose(
        repo_hashes,
        &config.build.theme,
        &config.build.theme_version,
        config.build.transforms.clone(),
        &config.build.base_url,
        &config.build.title,
    );

    let decision = docbuilder_cache::evaluate(&ctx.cache, &signature, config.build.skip_if_unchanged);
    if let CacheDecision::Skip { build_hash } = decision {
        info!(build_id, build_hash, "build skipped: unchanged since last run");
        append_event(
            ctx,
            &build_id,
            EventType::BuildCompleted,
            &BuildCompletedPayload {
                outcome: BuildOutcome::Skipped,
                duration_ms: started.elapsed().as_millis() as u64,
                repo_count: repositories.len() as u64,
                file_count: doc_file_count,
            },
        )
        .await?;
        return Ok(());
    }

    let content_root = ctx.workspace_root.join("content").join(&build_id);
    for repo in &repositories {
        let repo_workdir = ctx.workspace_root.join("repos").join(&repo.name);
        if let Err(err) = ctx.transforms.apply(&repo_workdir, &config.build.transforms).await {
            record_failure(ctx, &build_id, "transform", &err).await;
            if err.aborts_job() {
                return Err(err);
            }
        }
    }
    append_event(ctx, &build_id, EventType::TransformApplied, &serde_json::json!({"repo_count": repositories.len()})).await?;

    let should_render = match config.build.render_mode {
        docbuilder_config::RenderMode::Never => false,
        docbuilder_config::RenderMode::Always => true,
        docbuilder_config::RenderMode::Auto => doc_file_count > 0,
    };

    if should_render {
        if let Err(err) = ctx.site_generator.generate(&content_root, &ctx.site_root, &config.build.theme).await {
            record_failure(ctx, &build_id, "generate", &err).await;
            return Err(err);
        }
        append_event(ctx, &build_id, EventType::SiteGenerated, &serde_json::json!({"output_dir": ctx.site_root})).await?;
        ctx.cache.store_manifest(&signature, ctx.site_root.clone())?;
    } else {
        info!(build_id, doc_file_count, render_mode = ?config.build.render_mode, "skipping site generation");
    }

    (ctx.livereload)();

    append_event(
        ctx,
        &build_id,
        EventType::BuildCompleted,
        &BuildCompletedPayload {
            outcome: BuildOutcome::Completed,
            duration_ms: started.elapsed().as_millis() as u64,
            repo_count: repositories.len() as u64,
            file_count: doc_file_count,
        },
    )
    .await?;
    append_event(ctx, &build_id, EventType::BuildReportGenerated, &serde_json::json!({"build_id": build_id})).await?;

    Ok(())
}

async fn sync_and_hash_repo(
    ctx: &WorkerContext,
    build_id: &str,
    repo: &Repository,
    incremental: bool,
) -> Result<(RepoHash, u64), ClassifiedError> {
    let lock = ctx.repo_locks.lock_for(&repo.name).await;
    let _guard = lock.lock().await;

    let dest = ctx.workspace_root.join("repos").join(&repo.name);
    let commit = if dest.join(".git").exists() {
        let opts = UpdateOptions {
            shallow_depth: if incremental { Some(1) } else { None },
            ..Default::default()
        };
        ctx.git.update_repo(repo, &dest, &opts).await?.commit
    } else {
        let opts = docbuilder_git::CloneOptions::default();
        ctx.git.clone_repo(repo, &dest, &opts).await?
    };

    append_event(
        ctx,
        build_id,
        EventType::RepositoryCloned,
        &RepositoryClonedPayload {
            name: repo.name.clone(),
            commit: commit.clone(),
            incremental,
        },
    )
    .await?;

    let doc_files = discover_doc_files(&dest, &repo.paths);
    append_event(
        ctx,
        build_id,
        EventType::DocumentsDiscovered,
        &DocumentsDiscoveredPayload {
            repo: repo.name.clone(),
            file_count: doc_files.len() as u64,
        },
    )
    .await?;

    let hash = docbuilder_git::compute_repo_hash_from_workdir(&dest, &repo.name, &commit, &repo.paths)?;
    Ok((hash, doc_files.len() as u64))
}

/// Walks the repo's configured doc paths and returns every file found
/// beneath them. Returns an empty list (not an error) for a path that
/// doesn't exist — pruning/partial checkouts are expected.
fn discover_doc_files(repo_root: &Path, paths: &[String]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let roots: Vec<PathBuf> = if paths.is_empty() {
        vec![repo_root.to_path_buf()]
    } else {
        paths.iter().map(|p| repo_root.join(docbuilder_git::normalize_doc_path(p))).collect()
    };
    for root in roots {
        walk(&root, &mut files);
    }
    files
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        if path.is_dir() {
            walk(&path, out);
        } else {
            out.push(path);
        }
    }
}

async fn append_event(ctx: &WorkerContext, build_id: &str, event_type: EventType, payload: &impl serde::Serialize) -> Result<(), ClassifiedError> {
    let bytes = serde_json::to_vec(payload).map_err(|e| {
        ClassifiedError::builder(Category::Internal, format!("failed to encode event payload: {e}"))
            .severity(Severity::Error)
            .build()
    })?;
    let event = ctx.store.append(build_id, event_type, &bytes, BTreeMap::new()).await?;
    ctx.projection.apply(&event);
    Ok(())
}

async fn record_failure(ctx: &WorkerContext, build_id: &str, stage: &str, err: &ClassifiedError) {
    let bytes = serde_json::to_vec(&BuildFailedPayload {
        stage: stage.to_string(),
        error: err.clone(),
    })
    .unwrap_or_default();
    if let Ok(event) = ctx.store.append(build_id, EventType::BuildFailed, &bytes, BTreeMap::new()).await {
        ctx.projection.apply(&event);
    }
}

#[cfg(test)]
mod tests {
    use std::process::Command;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use docbuilder_config::Config;
    use docbuilder_retry::BackoffConfig;
    use docbuilder_store::EventStore;
    use docbuilder_types::JobKind;
    use tempfile::tempdir;

    use super::*;
    use crate::collaborators::PassthroughTransformPipeline;

    struct CountingSiteGenerator {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl SiteGenerator for CountingSiteGenerator {
        async fn generate(&self, _content_root: &Path, output_dir: &Path, _theme: &str) -> Result<(), ClassifiedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::create_dir_all(output_dir).ok();
            std::fs::write(output_dir.join("index.html"), "generated").ok();
            Ok(())
        }
    }

    fn init_source_repo(dir: &Path) -> String {
        std::fs::create_dir_all(dir.join("docs")).expect("mkdir docs");
        Command::new("git").args(["init", "-q", "-b", "main"]).current_dir(dir).output().expect("init");
        Command::new("git").args(["config", "user.email", "t@example.com"]).current_dir(dir).output().expect("cfg");
        Command::new("git").args(["config", "user.name", "Test"]).current_dir(dir).output().expect("cfg");
        std::fs::write(dir.join("docs/guide.md"), "# guide").expect("write");
        Command::new("git").args(["add", "."]).current_dir(dir).output().expect("add");
        Command::new("git").args(["commit", "-q", "-m", "initial"]).current_dir(dir).output().expect("commit");
        let out = Command::new("git").args(["rev-parse", "HEAD"]).current_dir(dir).output().expect("rev-parse");
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    async fn build_ctx(root: &Path, source_url: String, calls: Arc<AtomicUsize>) -> (Arc<WorkerContext>, Arc<arc_swap::ArcSwap<Vec<Repository>>>) {
        let config = Config::default();
        let repo = Repository {
            name: "docs-repo".to_string(),
            url: source_url,
            branch: Some("main".to_string()),
            is_tag: false,
            paths: vec!["docs".to_string()],
            auth: None,
            tags: Default::default(),
            version: None,
            is_versioned: false,
        };
        let repositories = Arc::new(arc_swap::ArcSwap::from_pointee(vec![repo]));
        let store = Arc::new(EventStore::open_in_memory().await.expect("open store"));
        let ctx = Arc::new(WorkerContext {
            config: Arc::new(arc_swap::ArcSwap::from_pointee(config)),
            repositories: repositories.clone(),
            git: Arc::new(RetryingGitClient::new(BackoffConfig::default())),
            repo_locks: Arc::new(RepoLocks::new()),
            store,
            projection: Arc::new(BuildHistoryProjection::new(16)),
            cache: Arc::new(CacheStore::new(root.join("cache"))),
            transforms: Arc::new(PassthroughTransformPipeline),
            site_generator: Arc::new(CountingSiteGenerator { calls }),
            livereload: Arc::new(|| {}),
            workspace_root: root.join("workspace"),
            site_root: root.join("site"),
            concurrent_builds: 2,
        });
        (ctx, repositories)
    }

    fn sample_job(id: u64) -> Job {
        Job {
            id,
            kind: JobKind::Build,
            priority: 0,
            repo: None,
            branch: None,
            reason: "test".to_string(),
            enqueued_at: Utc::now(),
            state: docbuilder_types::JobState::Queued,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_build_clones_and_generates_the_site() {
        let td = tempdir().expect("tempdir");
        let source = td.path().join("source");
        std::fs::create_dir_all(&source).expect("mkdir");
        let commit = init_source_repo(&source);

        let calls = Arc::new(AtomicUsize::new(0));
        let (ctx, _repos) = build_ctx(td.path(), source.display().to_string(), calls.clone()).await;

        process_job(&sample_job(1), &ctx).await.expect("build succeeds");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ctx.site_root.join("index.html").exists());

        let events = ctx.store.get_range(0, i64::MAX).await.expect("events");
        assert!(events.iter().any(|e| e.event_type == EventType::BuildCompleted));
        assert!(events.iter().any(|e| e.event_type == EventType::RepositoryCloned));
        assert_ne!(commit, "");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unchanged_second_build_skips_site_generation() {
        let td = tempdir().expect("tempdir");
        let source = td.path().join("source");
        std::fs::create_dir_all(&source).expect("mkdir");
        init_source_repo(&source);

        let calls = Arc::new(AtomicUsize::new(0));
        let (ctx, _repos) = build_ctx(td.path(), source.display().to_string(), calls.clone()).await;

        process_job(&sample_job(1), &ctx).await.expect("first build succeeds");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        process_job(&sample_job(2), &ctx).await.expect("second build succeeds");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "site generator must not run again on an unchanged signature");

        let events = ctx.store.get_range(0, i64::MAX).await.expect("events");
        let skipped = events.iter().any(|e| {
            e.event_type == EventType::BuildCompleted
                && serde_json::from_slice::<BuildCompletedPayload>(&e.payload).is_ok_and(|p| p.outcome == BuildOutcome::Skipped)
        });
        assert!(skipped, "second build must record a skipped BuildCompleted event");
    }
}
