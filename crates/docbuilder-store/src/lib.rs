//! Append-only event store and build-history projections (C6).
//!
//! The store is a single SQLite table (`events`) indexed by `build_id`,
//! `timestamp`, and `event_type`. Writes are serialized by an in-process
//! lock (SQLite itself also serializes writers, but the lock keeps id
//! assignment and insertion atomic from the caller's perspective); reads
//! run concurrently against the pool (§4.6).
//!
//! [`BuildHistoryProjection`] rebuilds a materialized view by replaying
//! every event in ascending `id` order — the projection round-trip
//! invariant from §8 is that replaying the log always reproduces the
//! same summaries the live `apply` calls produced.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, TimeZone, Utc};
use docbuilder_types::{
    BuildCompletedPayload, BuildFailedPayload, BuildStartedPayload, Category, ClassifiedError,
    DocumentsDiscoveredPayload, Event, EventType, Severity,
};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;

fn store_err(message: impl Into<String>) -> ClassifiedError {
    ClassifiedError::builder(Category::Eventstore, message).severity(Severity::Error).build()
}

/// Append-only event log backed by SQLite (§4.6).
pub struct EventStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl EventStore {
    /// Open (creating if necessary) the event database at `path`, and
    /// ensure the schema and indexes exist.
    pub async fn open(path: &Path) -> Result<Self, ClassifiedError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| store_err(format!("failed to create data dir: {e}")))?;
        }
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await
            .map_err(|e| store_err(format!("append_failed: failed to open event store: {e}")))?;
        Self::from_pool(pool).await
    }

    /// In-memory store for tests that don't need a file on disk.
    pub async fn open_in_memory() -> Result<Self, ClassifiedError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| store_err(format!("append_failed: failed to open in-memory event store: {e}")))?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, ClassifiedError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                build_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                payload BLOB NOT NULL,
                metadata TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| store_err(format!("append_failed: failed to create events table: {e}")))?;

        for (name, col) in [
            ("idx_events_build_id", "build_id"),
            ("idx_events_timestamp", "timestamp"),
            ("idx_events_type", "event_type"),
        ] {
            sqlx::query(&format!("CREATE INDEX IF NOT EXISTS {name} ON events({col})"))
                .execute(&pool)
                .await
                .map_err(|e| store_err(format!("append_failed: failed to create index {name}: {e}")))?;
        }

        Ok(EventStore { pool, write_lock: Mutex::new(()) })
    }

    /// Append an event. Serialized by the store's write lock (§4.6).
    pub async fn append(
        &self,
        build_id: &str,
        event_type: EventType,
        payload: &[u8],
        metadata: BTreeMap<String, String>,
    ) -> Result<Event, ClassifiedError> {
        let _guard = self.write_lock.lock().await;
        let timestamp = Utc::now();
        let metadata_json = serde_json::to_string(&metadata).map_err(|e| store_err(format!("append_failed: {e}")))?;

        let row = sqlx::query(
            "INSERT INTO events (build_id, event_type, timestamp, payload, metadata) VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(build_id)
        .bind(event_type.as_str())
        .bind(timestamp.timestamp())
        .bind(payload)
        .bind(&metadata_json)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_err(format!("append_failed: {e}")))?;

        let id: i64 = row.try_get("id").map_err(|e| store_err(format!("append_failed: {e}")))?;

        Ok(Event {
            id,
            build_id: build_id.to_string(),
            event_type,
            timestamp,
            payload: payload.to_vec(),
            metadata,
        })
    }

    /// All events for a build, ascending by id (§4.6).
    pub async fn get_by_build_id(&self, build_id: &str) -> Result<Vec<Event>, ClassifiedError> {
        let rows = sqlx::query(
            "SELECT id, build_id, event_type, timestamp, payload, metadata FROM events WHERE build_id = ? ORDER BY id ASC",
        )
        .bind(build_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err(format!("failed to query events: {e}")))?;
        rows.into_iter().map(row_to_event).collect()
    }

    /// All events in `[start, end]` inclusive by id, ascending (§4.6).
    pub async fn get_range(&self, start: i64, end: i64) -> Result<Vec<Event>, ClassifiedError> {
        let rows = sqlx::query(
            "SELECT id, build_id, event_type, timestamp, payload, metadata FROM events WHERE id >= ? AND id <= ? ORDER BY id ASC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err(format!("failed to query event range: {e}")))?;
        rows.into_iter().map(row_to_event).collect()
    }

    /// All events ever appended, ascending by id. Used by
    /// [`BuildHistoryProjection::rebuild`].
    pub async fn get_all(&self) -> Result<Vec<Event>, ClassifiedError> {
        let rows = sqlx::query("SELECT id, build_id, event_type, timestamp, payload, metadata FROM events ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_err(format!("failed to query all events: {e}")))?;
        rows.into_iter().map(row_to_event).collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_event(row: sqlx::sqlite::SqliteRow) -> Result<Event, ClassifiedError> {
    let id: i64 = row.try_get("id").map_err(|e| store_err(format!("malformed row: {e}")))?;
    let build_id: String = row.try_get("build_id").map_err(|e| store_err(format!("malformed row: {e}")))?;
    let event_type_str: String = row.try_get("event_type").map_err(|e| store_err(format!("malformed row: {e}")))?;
    let timestamp: i64 = row.try_get("timestamp").map_err(|e| store_err(format!("malformed row: {e}")))?;
    let payload: Vec<u8> = row.try_get("payload").map_err(|e| store_err(format!("malformed row: {e}")))?;
    let metadata_json: String = row.try_get("metadata").map_err(|e| store_err(format!("malformed row: {e}")))?;

    let event_type = event_type_from_str(&event_type_str)
        .ok_or_else(|| store_err(format!("unknown event type in store: {event_type_str}")))?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json).unwrap_or_default();
    let timestamp = Utc.timestamp_opt(timestamp, 0).single().unwrap_or_else(Utc::now);

    Ok(Event { id, build_id, event_type, timestamp, payload, metadata })
}

fn event_type_from_str(s: &str) -> Option<EventType> {
    Some(match s {
        "build_started" => EventType::BuildStarted,
        "repository_cloned" => EventType::RepositoryCloned,
        "documents_discovered" => EventType::DocumentsDiscovered,
        "transform_applied" => EventType::TransformApplied,
        "hugo_config_generated" => EventType::HugoConfigGenerated,
        "site_generated" => EventType::SiteGenerated,
        "build_completed" => EventType::BuildCompleted,
        "build_failed" => EventType::BuildFailed,
        "build_report_generated" => EventType::BuildReportGenerated,
        _ => return None,
    })
}

/// Materialized view of one build's lifecycle, replayed from its events
/// (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub build_id: String,
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tenant_id: Option<String>,
    pub repo_count: u64,
    pub file_count: u64,
    pub error_stage: Option<String>,
    pub error_message: Option<String>,
    pub artifacts: Vec<String>,
    pub report_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Running,
    Completed,
    Failed,
}

/// In-memory projection over the event log: a live map plus a
/// ring-buffer of terminal builds bounded by `max_size` (§4.6).
pub struct BuildHistoryProjection {
    max_size: usize,
    state: StdMutex<ProjectionState>,
}

#[derive(Default)]
struct ProjectionState {
    active: BTreeMap<String, BuildSummary>,
    history: VecDeque<BuildSummary>,
}

impl BuildHistoryProjection {
    pub fn new(max_size: usize) -> Self {
        BuildHistoryProjection { max_size: max_size.max(1), state: StdMutex::new(ProjectionState::default()) }
    }

    /// Apply one event's effect on the projection (§4.6 apply rules).
    pub fn apply(&self, event: &Event) {
        let mut state = self.state.lock().expect("projection mutex poisoned");
        match event.event_type {
            EventType::BuildStarted => {
                state.active.insert(
                    event.build_id.clone(),
                    BuildSummary {
                        build_id: event.build_id.clone(),
                        status: BuildStatus::Running,
                        started_at: event.timestamp,
                        completed_at: None,
                        tenant_id: event.metadata.get("tenant_id").cloned(),
                        repo_count: 0,
                        file_count: 0,
                        error_stage: None,
                        error_message: None,
                        artifacts: Vec::new(),
                        report_data: None,
                    },
                );
            }
            EventType::RepositoryCloned => {
                if let Some(summary) = state.active.get_mut(&event.build_id) {
                    summary.repo_count += 1;
                }
            }
            EventType::DocumentsDiscovered => {
                if let Ok(payload) = event.decode::<DocumentsDiscoveredPayload>() {
                    if let Some(summary) = state.active.get_mut(&event.build_id) {
                        summary.file_count += payload.file_count;
                    }
                }
            }
            EventType::BuildCompleted => {
                if let Ok(payload) = event.decode::<BuildCompletedPayload>() {
                    if let Some(mut summary) = state.active.remove(&event.build_id) {
                        summary.status = BuildStatus::Completed;
                        summary.completed_at = Some(event.timestamp);
                        summary.repo_count = summary.repo_count.max(payload.repo_count);
                        summary.file_count = summary.file_count.max(payload.file_count);
                        push_history(&mut state.history, summary, self.max_size);
                    }
                }
            }
            EventType::BuildFailed => {
                if let Ok(payload) = event.decode::<BuildFailedPayload>() {
                    if let Some(mut summary) = state.active.remove(&event.build_id) {
                        summary.status = BuildStatus::Failed;
                        summary.completed_at = Some(event.timestamp);
                        summary.error_stage = Some(payload.stage);
                        summary.error_message = Some(payload.error.message);
                        push_history(&mut state.history, summary, self.max_size);
                    }
                }
            }
            EventType::BuildReportGenerated => {
                if let Ok(report) = serde_json::from_slice::<serde_json::Value>(&event.payload) {
                    if let Some(summary) = state.active.get_mut(&event.build_id) {
                        summary.report_data = Some(report);
                    } else if let Some(summary) = state.history.iter_mut().find(|s| s.build_id == event.build_id) {
                        summary.report_data = Some(report);
                    }
                }
            }
            EventType::TransformApplied | EventType::HugoConfigGenerated | EventType::SiteGenerated => {}
        }
    }

    /// Re-apply every event in the store from an empty state (§4.6,
    /// §8 projection round-trip invariant).
    pub async fn rebuild(&self, store: &EventStore) -> Result<(), ClassifiedError> {
        {
            let mut state = self.state.lock().expect("projection mutex poisoned");
            *state = ProjectionState::default();
        }
        for event in store.get_all().await? {
            self.apply(&event);
        }
        Ok(())
    }

    /// The most recently started build still running, if any.
    pub fn active_build(&self) -> Option<BuildSummary> {
        let state = self.state.lock().expect("projection mutex poisoned");
        state.active.values().max_by_key(|s| s.started_at).cloned()
    }

    pub fn summary(&self, build_id: &str) -> Option<BuildSummary> {
        let state = self.state.lock().expect("projection mutex poisoned");
        state
            .active
            .get(build_id)
            .cloned()
            .or_else(|| state.history.iter().find(|s| s.build_id == build_id).cloned())
    }

    pub fn history(&self) -> Vec<BuildSummary> {
        let state = self.state.lock().expect("projection mutex poisoned");
        state.history.iter().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().expect("projection mutex poisoned").active.len()
    }
}

fn push_history(history: &mut VecDeque<BuildSummary>, summary: BuildSummary, max_size: usize) {
    if history.len() >= max_size {
        history.pop_front();
    }
    history.push_back(summary);
}

#[cfg(test)]
mod tests {
    use super::*;
    use docbuilder_types::BuildOutcome;

    async fn store() -> EventStore {
        EventStore::open_in_memory().await.expect("open")
    }

    #[tokio::test]
    async fn append_assigns_monotonic_ids() {
        let store = store().await;
        let e1 = store.append("b1", EventType::BuildStarted, b"{}", Default::default()).await.expect("append");
        let e2 = store.append("b1", EventType::BuildCompleted, b"{}", Default::default()).await.expect("append");
        assert!(e2.id > e1.id);
    }

    #[tokio::test]
    async fn get_by_build_id_returns_ascending_order() {
        let store = store().await;
        store.append("b1", EventType::BuildStarted, b"{}", Default::default()).await.expect("append");
        store.append("b2", EventType::BuildStarted, b"{}", Default::default()).await.expect("append");
        store.append("b1", EventType::BuildCompleted, b"{}", Default::default()).await.expect("append");

        let events = store.get_by_build_id("b1").await.expect("query");
        assert_eq!(events.len(), 2);
        assert!(events[0].id < events[1].id);
        assert!(events.iter().all(|e| e.build_id == "b1"));
    }

    #[tokio::test]
    async fn projection_tracks_running_build_then_completes() {
        let store = store().await;
        let projection = BuildHistoryProjection::new(10);

        let payload = serde_json::to_vec(&BuildStartedPayload { reason: "schedule".into(), repo_filter: None }).unwrap();
        let e1 = store.append("b1", EventType::BuildStarted, &payload, Default::default()).await.expect("append");
        projection.apply(&e1);
        assert_eq!(projection.active_count(), 1);

        let completed = serde_json::to_vec(&BuildCompletedPayload {
            outcome: BuildOutcome::Completed,
            duration_ms: 10,
            repo_count: 2,
            file_count: 5,
        })
        .unwrap();
        let e2 = store.append("b1", EventType::BuildCompleted, &completed, Default::default()).await.expect("append");
        projection.apply(&e2);

        assert_eq!(projection.active_count(), 0);
        let summary = projection.summary("b1").expect("summary");
        assert_eq!(summary.status, BuildStatus::Completed);
        assert_eq!(summary.repo_count, 2);
        assert_eq!(summary.file_count, 5);
    }

    #[tokio::test]
    async fn projection_records_failure_stage_and_message() {
        let store = store().await;
        let projection = BuildHistoryProjection::new(10);

        let start = serde_json::to_vec(&BuildStartedPayload { reason: "webhook".into(), repo_filter: None }).unwrap();
        let e1 = store.append("b1", EventType::BuildStarted, &start, Default::default()).await.expect("append");
        projection.apply(&e1);

        let err = ClassifiedError::builder(Category::Git, "clone failed").build();
        let failed = serde_json::to_vec(&BuildFailedPayload { stage: "sync".into(), error: err }).unwrap();
        let e2 = store.append("b1", EventType::BuildFailed, &failed, Default::default()).await.expect("append");
        projection.apply(&e2);

        let summary = projection.summary("b1").expect("summary");
        assert_eq!(summary.status, BuildStatus::Failed);
        assert_eq!(summary.error_stage.as_deref(), Some("sync"));
    }

    #[tokio::test]
    async fn history_ring_buffer_evicts_oldest() {
        let store = store().await;
        let projection = BuildHistoryProjection::new(2);

        for i in 0..3 {
            let build_id = format!("b{i}");
            let start = serde_json::to_vec(&BuildStartedPayload { reason: "schedule".into(), repo_filter: None }).unwrap();
            let e1 = store.append(&build_id, EventType::BuildStarted, &start, Default::default()).await.expect("append");
            projection.apply(&e1);
            let completed = serde_json::to_vec(&BuildCompletedPayload {
                outcome: BuildOutcome::Completed,
                duration_ms: 1,
                repo_count: 0,
                file_count: 0,
            })
            .unwrap();
            let e2 = store.append(&build_id, EventType::BuildCompleted, &completed, Default::default()).await.expect("append");
            projection.apply(&e2);
        }

        let history = projection.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].build_id, "b1");
        assert_eq!(history[1].build_id, "b2");
    }

    #[tokio::test]
    async fn projection_round_trips_with_rebuild_from_store() {
        let store = store().await;
        let live = BuildHistoryProjection::new(10);

        let start = serde_json::to_vec(&BuildStartedPayload { reason: "schedule".into(), repo_filter: None }).unwrap();
        let e1 = store.append("b1", EventType::BuildStarted, &start, Default::default()).await.expect("append");
        live.apply(&e1);
        let completed = serde_json::to_vec(&BuildCompletedPayload {
            outcome: BuildOutcome::Completed,
            duration_ms: 1,
            repo_count: 3,
            file_count: 9,
        })
        .unwrap();
        let e2 = store.append("b1", EventType::BuildCompleted, &completed, Default::default()).await.expect("append");
        live.apply(&e2);

        let rebuilt = BuildHistoryProjection::new(10);
        rebuilt.rebuild(&store).await.expect("rebuild");

        let a = live.summary("b1").expect("live summary");
        let b = rebuilt.summary("b1").expect("rebuilt summary");
        assert_eq!(a.status, b.status);
        assert_eq!(a.repo_count, b.repo_count);
        assert_eq!(a.file_count, b.file_count);
    }

    #[tokio::test]
    async fn event_monotonicity_holds_across_build_ids() {
        let store = store().await;
        let mut last_id = 0;
        for i in 0..10 {
            let build_id = format!("b{}", i % 3);
            let event = store.append(&build_id, EventType::BuildStarted, b"{}", Default::default()).await.expect("append");
            assert!(event.id > last_id);
            last_id = event.id;
        }
    }
}
