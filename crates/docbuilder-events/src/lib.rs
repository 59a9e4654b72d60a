//! In-process typed publish/subscribe event bus (C3).
//!
//! The bus is the glue between the scheduler, webhook router, and worker
//! pool: all three publish onto it, and the orchestrator's own
//! subscribers (repo-updater, livereload hub, metrics) drain it
//! independently. Delivery is deliberately lossy under backpressure: a
//! slow subscriber must never stall the publisher, so a full inbox drops
//! the event for that subscriber only (§4.3, §9 open question). Each
//! subscription tracks its own drop counter so operators can see when
//! this is happening.
//!
//! Ordering is FIFO per publisher handle, not across publishers: two
//! tasks publishing concurrently may interleave their events at a
//! subscriber, but neither task's own events are ever reordered.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

/// Typed event families exchanged on the bus (§4.3). Extra orchestration
/// detail lives on the `Event` / `EventType` pair in `docbuilder-types`;
/// these variants are the live, in-process signals exchanged while a
/// build is being decided and scheduled, not the durable log entries.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    RepoUpdateRequested {
        repo_url: String,
        branch: Option<String>,
    },
    RepoUpdated {
        repo_url: String,
        changed: bool,
        commit_sha: Option<String>,
    },
    BuildRequested {
        reason: BuildReason,
        repo_url: Option<String>,
        branch: Option<String>,
        immediate: bool,
    },
    BuildStarted {
        build_id: String,
    },
    BuildCompleted {
        build_id: String,
        outcome: docbuilder_types::BuildOutcome,
    },
    BuildFailed {
        build_id: String,
        stage: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildReason {
    Schedule,
    Webhook,
    Manual,
}

impl BuildReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildReason::Schedule => "schedule",
            BuildReason::Webhook => "webhook",
            BuildReason::Manual => "manual",
        }
    }
}

/// A subscriber's inbound channel plus its own drop counter (§9: bounded
/// per-subscriber retention is an acceptable alternative to unbounded
/// lossy delivery as long as the policy is documented and the counter is
/// exposed; we document "lossy, at-most-once" and expose `dropped()`).
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<BusEvent>,
    dropped: Arc<AtomicU64>,
    bus: EventBus,
}

impl Subscription {
    /// Receive the next event, or `None` once the bus has been dropped
    /// and no further events will ever arrive.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<BusEvent, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    /// Count of events dropped for this subscriber because its inbox was
    /// full at publish time.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Detach this subscription; the bus stops attempting delivery to it
    /// immediately (the sender side returns `SendError` on next publish
    /// and is lazily reaped).
    pub fn unsubscribe(self) {
        self.bus.remove(self.id);
    }
}

struct Sink {
    id: u64,
    tx: mpsc::Sender<BusEvent>,
    dropped: Arc<AtomicU64>,
}

struct Inner {
    sinks: std::sync::Mutex<Vec<Sink>>,
    next_id: AtomicU64,
}

/// The bus handle. Cheaply `Clone`-able; every publisher and the daemon
/// itself hold a clone. Dropping the last handle drops all subscriber
/// senders, which unblocks any pending `recv()` calls with `None`.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
    default_capacity: usize,
}

impl EventBus {
    /// Build a bus whose subscriber inboxes default to `capacity` slots
    /// unless a subscriber asks for a different one via
    /// [`EventBus::subscribe_with_capacity`].
    pub fn new(capacity: usize) -> Self {
        EventBus {
            inner: Arc::new(Inner {
                sinks: std::sync::Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
            default_capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(self.default_capacity)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        self.inner.sinks.lock().expect("event bus mutex poisoned").push(Sink {
            id,
            tx,
            dropped: dropped.clone(),
        });
        Subscription {
            id,
            rx,
            dropped,
            bus: self.clone(),
        }
    }

    /// Publish to every live subscriber. Non-blocking: a full inbox
    /// drops the event for that subscriber and increments its counter;
    /// a closed inbox (subscriber dropped) is reaped on the next
    /// publish. Returns the number of subscribers the event was
    /// actually delivered to.
    pub fn publish(&self, event: BusEvent) -> usize {
        let mut sinks = self.inner.sinks.lock().expect("event bus mutex poisoned");
        let mut delivered = 0usize;
        sinks.retain(|sink| match sink.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                sink.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(subscriber_id = sink.id, "event bus subscriber inbox full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sinks.lock().expect("event bus mutex poisoned").len()
    }

    fn remove(&self, id: u64) {
        self.inner
            .sinks
            .lock()
            .expect("event bus mutex poisoned")
            .retain(|sink| sink.id != id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_all_subscribers() {
        let bus = EventBus::new(4);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let delivered = bus.publish(BusEvent::BuildStarted { build_id: "b1".into() });
        assert_eq!(delivered, 2);

        assert!(matches!(a.recv().await, Some(BusEvent::BuildStarted { .. })));
        assert!(matches!(b.recv().await, Some(BusEvent::BuildStarted { .. })));
    }

    #[tokio::test]
    async fn full_inbox_drops_event_for_that_subscriber_only() {
        let bus = EventBus::new(1);
        let mut slow = bus.subscribe();
        // Fill the slow subscriber's single slot without draining it.
        bus.publish(BusEvent::BuildStarted { build_id: "b1".into() });
        bus.publish(BusEvent::BuildStarted { build_id: "b2".into() });

        assert_eq!(slow.dropped(), 1);
        // Only the first event is observable; the second was dropped.
        match slow.recv().await {
            Some(BusEvent::BuildStarted { build_id }) => assert_eq!(build_id, "b1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_is_reaped() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        sub.unsubscribe();
        // The slot is reaped lazily on next publish.
        bus.publish(BusEvent::BuildStarted { build_id: "x".into() });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropping_bus_closes_subscriptions() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();
        drop(bus);
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn build_reason_strings_match_spec() {
        assert_eq!(BuildReason::Schedule.as_str(), "schedule");
        assert_eq!(BuildReason::Webhook.as_str(), "webhook");
        assert_eq!(BuildReason::Manual.as_str(), "manual");
    }
}
