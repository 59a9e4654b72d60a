//! Repo-updater (§4.4, §4.8): reacts to `RepoUpdateRequested` events by
//! checking the remote HEAD cache and deciding whether an incremental
//! build is warranted. Webhook delivery and a periodic remote-head poll
//! both publish `RepoUpdateRequested`; this task is the single place that
//! turns "a repo might have moved" into `RepoUpdated`/`BuildRequested`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use docbuilder_events::{BuildReason, BusEvent, EventBus};
use docbuilder_git::RemoteHeadCache;
use docbuilder_types::Repository;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::queue::{EnqueueRequest, JobQueue};

const POLL_INTERVAL: Duration = Duration::from_secs(300);

/// Subscribes to `RepoUpdateRequested` and, for each request, checks the
/// remote HEAD cache and publishes `RepoUpdated` — always — followed by
/// `BuildRequested{reason: webhook}` when the remote moved (§4.8). Signals
/// `ready` once subscribed so tests can await deterministic startup
/// instead of sleeping.
pub async fn run_repo_updater(
    repositories: Arc<arc_swap::ArcSwap<Vec<Repository>>>,
    cache_path: PathBuf,
    queue: JobQueue,
    bus: EventBus,
    cancel: CancellationToken,
    ready: oneshot::Sender<()>,
) {
    let cache = match RemoteHeadCache::load(cache_path) {
        Ok(cache) => cache,
        Err(err) => {
            warn!(error = %err, "repo-updater: failed to load remote head cache, starting empty");
            return;
        }
    };

    let mut subscription = bus.subscribe();
    let _ = ready.send(());

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = subscription.recv() => event,
        };
        let Some(BusEvent::RepoUpdateRequested { repo_url, branch }) = event else {
            if event.is_none() {
                break;
            }
            continue;
        };

        let Some(repo) = repositories.load().iter().find(|r| r.url == repo_url).cloned() else {
            warn!(repo_url, "repo-updater: received RepoUpdateRequested for unknown repository");
            continue;
        };
        let branch = branch.or_else(|| repo.branch.clone()).unwrap_or_else(|| "main".to_string());

        let (changed, commit_sha) = cache.check_remote_changed(&repo_url, &branch);
        bus.publish(BusEvent::RepoUpdated {
            repo_url: repo_url.clone(),
            changed,
            commit_sha: commit_sha.clone(),
        });

        if !changed {
            continue;
        }
        if let Err(err) = cache.save() {
            warn!(error = %err, "repo-updater: failed to persist remote head cache");
        }

        bus.publish(BusEvent::BuildRequested {
            reason: BuildReason::Webhook,
            repo_url: Some(repo_url.clone()),
            branch: Some(branch.clone()),
            immediate: false,
        });
        info!(repo = repo.name, "repo-updater: remote head moved, enqueuing incremental build");
        if let Err(err) = queue
            .enqueue(EnqueueRequest {
                kind: docbuilder_types::JobKind::WebhookBuild,
                priority: 1,
                repo: Some(repo.name.clone()),
                branch: Some(branch),
                reason: "remote-poll".to_string(),
                immediate: false,
            })
            .await
        {
            warn!(error = %err, repo = repo.name, "repo-updater: failed to enqueue build");
        }
    }
}

/// Periodically publishes `RepoUpdateRequested` for every tracked
/// repository so drift is eventually caught even when a webhook delivery
/// is missed or the forge has no webhook configured at all (§4.4 remote-
/// HEAD cache: `CheckRemoteChanged` fails open, so this producer never
/// needs to reason about auth/network errors itself).
pub async fn run_remote_poll_producer(repositories: Arc<arc_swap::ArcSwap<Vec<Repository>>>, bus: EventBus, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
        for repo in repositories.load().iter() {
            bus.publish(BusEvent::RepoUpdateRequested {
                repo_url: repo.url.clone(),
                branch: repo.branch.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn repo(name: &str, url: &str) -> Repository {
        Repository {
            name: name.to_string(),
            url: url.to_string(),
            branch: Some("main".to_string()),
            is_tag: false,
            paths: Vec::new(),
            auth: None,
            tags: Default::default(),
            version: None,
            is_versioned: false,
        }
    }

    #[tokio::test]
    async fn unreachable_remote_fails_open_and_enqueues_a_build() {
        let td = tempdir().expect("tempdir");
        let repos = Arc::new(arc_swap::ArcSwap::from_pointee(vec![repo("x", "https://example.invalid/x.git")]));
        let (queue, mut job_rx) = JobQueue::new(4);
        let bus = EventBus::new(8);
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(run_repo_updater(
            repos.clone(),
            td.path().join("remote_heads.json"),
            queue,
            bus.clone(),
            cancel.clone(),
            ready_tx,
        ));
        ready_rx.await.expect("repo-updater subscribed");

        let mut observer = bus.subscribe();
        bus.publish(BusEvent::RepoUpdateRequested {
            repo_url: "https://example.invalid/x.git".to_string(),
            branch: None,
        });

        assert!(matches!(observer.recv().await, Some(BusEvent::RepoUpdated { changed: true, .. })));
        assert!(matches!(observer.recv().await, Some(BusEvent::BuildRequested { reason: BuildReason::Webhook, .. })));

        let enqueued = job_rx.recv().await.expect("job enqueued");
        assert_eq!(enqueued.repo.as_deref(), Some("x"));

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn unknown_repo_url_is_ignored_without_panicking() {
        let td = tempdir().expect("tempdir");
        let repos = Arc::new(arc_swap::ArcSwap::from_pointee(Vec::<Repository>::new()));
        let (queue, mut job_rx) = JobQueue::new(4);
        let bus = EventBus::new(8);
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(run_repo_updater(repos, td.path().join("remote_heads.json"), queue, bus.clone(), cancel.clone(), ready_tx));
        ready_rx.await.expect("repo-updater subscribed");

        bus.publish(BusEvent::RepoUpdateRequested {
            repo_url: "https://example.invalid/missing.git".to_string(),
            branch: None,
        });

        assert!(
            tokio::time::timeout(Duration::from_millis(200), job_rx.recv()).await.is_err(),
            "no job should be enqueued for an untracked repo"
        );

        cancel.cancel();
        let _ = handle.await;
    }
}
