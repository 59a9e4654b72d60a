//! Bounded job queue (§4.8, §5): a single FIFO of `Job`s shared by the
//! scheduler, the webhook trigger path, and the manual-trigger HTTP
//! endpoint. Backed by a bounded `mpsc` channel so a burst of triggers
//! applies backpressure rather than growing memory without bound.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use docbuilder_types::{Category, ClassifiedError, Job, JobKind, JobState, Severity};
use tokio::sync::{Mutex, mpsc};

/// A request to enqueue a new job; the queue assigns the id.
pub struct EnqueueRequest {
    pub kind: JobKind,
    pub priority: u8,
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub reason: String,
    /// Webhook/manual triggers set this so a caller waiting on an HTTP
    /// response never blocks on a full queue (§3 `JobQueue`): the
    /// request fails fast with `queue_full` instead. Scheduled and
    /// repo-updater-driven jobs leave this `false` and block until
    /// space frees up.
    pub immediate: bool,
}

/// Producer handle plus the bookkeeping table the HTTP status surface
/// reads from. Cheap to clone — everything behind it is shared.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<Job>,
    next_id: Arc<AtomicU64>,
    jobs: Arc<Mutex<BTreeMap<u64, Job>>>,
}

/// Consumer side, held only by the worker pool.
pub struct JobReceiver {
    receiver: mpsc::Receiver<Job>,
    jobs: Arc<Mutex<BTreeMap<u64, Job>>>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let jobs = Arc::new(Mutex::new(BTreeMap::new()));
        let queue = JobQueue {
            sender,
            next_id: Arc::new(AtomicU64::new(1)),
            jobs: jobs.clone(),
        };
        (queue, JobReceiver { receiver, jobs })
    }

    /// Enqueues a job, returning its assigned id (§3 `JobQueue`). A
    /// normal request blocks until the queue has room — backpressure,
    /// not rejection. An `immediate` request never blocks: on a full
    /// queue it returns a `Severity::Warning`/`Category::Daemon`
    /// `queue_full` error instead, since the caller is typically an HTTP
    /// handler waiting on a response. Either way, a closed queue (worker
    /// pool shut down) is always an error.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<u64, ClassifiedError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let job = Job {
            id,
            kind: request.kind,
            priority: request.priority,
            repo: request.repo,
            branch: request.branch,
            reason: request.reason,
            enqueued_at: Utc::now(),
            state: JobState::Queued,
        };

        self.jobs.lock().await.insert(id, job.clone());

        if request.immediate {
            return match self.sender.try_send(job) {
                Ok(()) => Ok(id),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.jobs.lock().await.remove(&id);
                    Err(ClassifiedError::builder(Category::Daemon, "queue_full")
                        .severity(Severity::Warning)
                        .build())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    self.jobs.lock().await.remove(&id);
                    Err(ClassifiedError::builder(Category::Daemon, "job queue has been shut down").build())
                }
            };
        }

        match self.sender.send(job).await {
            Ok(()) => Ok(id),
            Err(_closed) => {
                self.jobs.lock().await.remove(&id);
                Err(ClassifiedError::builder(Category::Daemon, "job queue has been shut down").build())
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.values().filter(|j| matches!(j.state, JobState::Queued | JobState::Running)).count()
    }

    pub async fn active_count(&self) -> usize {
        self.jobs.lock().await.values().filter(|j| matches!(j.state, JobState::Running)).count()
    }
}

impl JobReceiver {
    pub async fn recv(&mut self) -> Option<Job> {
        self.receiver.recv().await
    }

    pub(crate) fn jobs(&self) -> Arc<Mutex<BTreeMap<u64, Job>>> {
        self.jobs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_assigns_increasing_ids() {
        let (queue, _rx) = JobQueue::new(8);
        let a = queue
            .enqueue(EnqueueRequest {
                kind: JobKind::Build,
                priority: 0,
                repo: None,
                branch: None,
                reason: "test".into(),
                immediate: false,
            })
            .await
            .unwrap();
        let b = queue
            .enqueue(EnqueueRequest {
                kind: JobKind::Build,
                priority: 0,
                repo: None,
                branch: None,
                reason: "test".into(),
                immediate: false,
            })
            .await
            .unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn immediate_enqueue_fails_fast_with_queue_full_when_queue_is_full() {
        let (queue, _rx) = JobQueue::new(1);
        queue
            .enqueue(EnqueueRequest {
                kind: JobKind::Build,
                priority: 0,
                repo: None,
                branch: None,
                reason: "first".into(),
                immediate: true,
            })
            .await
            .unwrap();
        let result = queue
            .enqueue(EnqueueRequest {
                kind: JobKind::Build,
                priority: 0,
                repo: None,
                branch: None,
                reason: "second".into(),
                immediate: true,
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.category, Category::Daemon);
        assert_eq!(err.severity, Severity::Warning);
        assert_eq!(err.message, "queue_full");
    }

    #[tokio::test]
    async fn non_immediate_enqueue_blocks_until_the_queue_drains() {
        let (queue, mut rx) = JobQueue::new(1);
        queue
            .enqueue(EnqueueRequest {
                kind: JobKind::Build,
                priority: 0,
                repo: None,
                branch: None,
                reason: "first".into(),
                immediate: false,
            })
            .await
            .unwrap();

        let blocked = queue.clone();
        let handle = tokio::spawn(async move {
            blocked
                .enqueue(EnqueueRequest {
                    kind: JobKind::Build,
                    priority: 0,
                    repo: None,
                    branch: None,
                    reason: "second".into(),
                    immediate: false,
                })
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!handle.is_finished(), "non-immediate enqueue must block while the queue is full");

        rx.recv().await.expect("first job drained");
        let second = tokio::time::timeout(std::time::Duration::from_millis(200), handle)
            .await
            .expect("enqueue task completes once the queue drains")
            .expect("task did not panic")
            .expect("enqueue succeeds");
        assert!(second > 0);
    }

    #[tokio::test]
    async fn receiver_observes_enqueued_job() {
        let (queue, mut rx) = JobQueue::new(4);
        let id = queue
            .enqueue(EnqueueRequest {
                kind: JobKind::Discovery,
                priority: 1,
                repo: None,
                branch: None,
                reason: "startup".into(),
                immediate: false,
            })
            .await
            .unwrap();
        let job = rx.recv().await.unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.kind, JobKind::Discovery);
    }
}
