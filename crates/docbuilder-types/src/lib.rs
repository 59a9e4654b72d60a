//! # Types
//!
//! Core domain types shared across the orchestration core: the classified
//! error model (C1), the repository/auth/hash data model (§3), durable event
//! records (C6), and job metadata (§3).
//!
//! ## Serialization
//!
//! Most types implement `Serialize`/`Deserialize` for persistence to disk or
//! transport over HTTP. Timestamps are `chrono::DateTime<Utc>`.
//!
//! ## Stability
//!
//! These types are considered stable unless otherwise noted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use docbuilder_retry::RetryStrategy;

/// Failure category. Drives both the CLI exit code and the HTTP status code
/// an adapter maps the error to; never parsed from the message string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Config,
    Validation,
    Auth,
    NotFound,
    AlreadyExists,
    Network,
    Git,
    Forge,
    Build,
    Hugo,
    Filesystem,
    Docs,
    Eventstore,
    Runtime,
    Daemon,
    Internal,
}

/// Failure severity. Only `Fatal`/`Error` abort the current job; `Warning`
/// is recorded but does not stop the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Fatal,
}

/// A single structured error carrying category/severity/retry strategy and
/// a context map, built with a fluent builder. Created at the failure site
/// and propagated upward without re-wrapping within a layer (§7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub category: Category,
    pub severity: Severity,
    pub retry_strategy: RetryStrategy,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ClassifiedError {
    /// Start building a classified error in the given category, defaulting
    /// to `Severity::Error` and `RetryStrategy::Never`.
    pub fn builder(category: Category, message: impl Into<String>) -> ClassifiedErrorBuilder {
        ClassifiedErrorBuilder {
            category,
            severity: Severity::Error,
            retry_strategy: RetryStrategy::Never,
            message: message.into(),
            cause: None,
            context: BTreeMap::new(),
        }
    }

    /// `true` if this severity should abort the current job (§7).
    pub fn aborts_job(&self) -> bool {
        self.severity >= Severity::Error
    }

    /// CLI exit code per §4.1's category → code mapping.
    pub fn cli_exit_code(&self) -> i32 {
        match self.category {
            Category::Validation => 2,
            Category::Auth => 5,
            Category::Config => 7,
            Category::Network | Category::Git | Category::Forge => 8,
            Category::Internal => 10,
            Category::Build | Category::Hugo | Category::Filesystem => 11,
            Category::Daemon | Category::Runtime => 12,
            _ => 1,
        }
    }

    /// HTTP status code per §4.1's category → status mapping.
    pub fn http_status_code(&self) -> u16 {
        match self.category {
            Category::Validation | Category::Config => 400,
            Category::Auth => 401,
            Category::NotFound => 404,
            Category::AlreadyExists => 409,
            Category::Network | Category::Git | Category::Forge => 502,
            Category::Build | Category::Hugo => 422,
            Category::Filesystem | Category::Internal => 500,
            Category::Runtime | Category::Daemon => 503,
            _ => 500,
        }
    }

    /// `true` when this category is appropriate to show directly to an
    /// end user (its message is not an internal implementation detail).
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self.category,
            Category::Config | Category::Validation | Category::Auth
        )
    }

    /// The canonical JSON body an HTTP adapter writes: `{error, code,
    /// details?, retryable?}`. `internal`/`runtime` categories never leak
    /// their message; everything else passes it through.
    pub fn to_http_body(&self) -> serde_json::Value {
        let retryable = docbuilder_retry::is_retryable(self.retry_strategy);
        let message = match self.category {
            Category::Internal | Category::Runtime | Category::Daemon => {
                "an internal error occurred".to_string()
            }
            _ => self.message.clone(),
        };
        serde_json::json!({
            "error": message,
            "code": format!("{:?}", self.category).to_lowercase(),
            "details": self.context,
            "retryable": retryable,
        })
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.category, self.message)
    }
}

impl std::error::Error for ClassifiedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// Fluent builder for [`ClassifiedError`].
pub struct ClassifiedErrorBuilder {
    category: Category,
    severity: Severity,
    retry_strategy: RetryStrategy,
    message: String,
    cause: Option<String>,
    context: BTreeMap<String, String>,
}

impl ClassifiedErrorBuilder {
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn retry_strategy(mut self, retry_strategy: RetryStrategy) -> Self {
        self.retry_strategy = retry_strategy;
        self
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> ClassifiedError {
        ClassifiedError {
            category: self.category,
            severity: self.severity,
            retry_strategy: self.retry_strategy,
            message: self.message,
            cause: self.cause,
            context: self.context,
        }
    }
}

/// Authentication method used for a git remote. Resolved per git call; never
/// persisted in HTTP responses (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthConfig {
    None,
    Ssh { key_path: String },
    Token { token: String },
    Basic { user: String, pass: String },
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::None
    }
}

/// A logical documentation source (§3). Unique by `name` after version
/// expansion; read-only during a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub is_tag: bool,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub is_versioned: bool,
}

/// Deterministic content fingerprint of a repository (§3): the commit SHA
/// plus a hash over sorted `(path, blob_hash)` pairs within the configured
/// doc paths. Stable across processes given identical git trees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoHash {
    pub name: String,
    pub commit: String,
    pub hash: String,
}

impl RepoHash {
    /// Compute a `RepoHash` from a commit SHA and sorted `(path, blob_hash)`
    /// pairs. The caller is responsible for sorting `entries` lexicographically
    /// by path and for skipping nonexistent paths before calling this.
    pub fn compute(name: impl Into<String>, commit: impl Into<String>, entries: &[(String, String)]) -> Self {
        use sha2::{Digest, Sha256};
        let commit = commit.into();
        let mut hasher = Sha256::new();
        hasher.update(commit.as_bytes());
        for (path, blob_hash) in entries {
            hasher.update(path.as_bytes());
            hasher.update(blob_hash.as_bytes());
        }
        RepoHash {
            name: name.into(),
            commit,
            hash: hex::encode(hasher.finalize()),
        }
    }
}

/// Deterministic fingerprint of every input to a site generation (§3). Two
/// builds with equal `BuildSignature` must produce byte-identical rendered
/// output given a deterministic `SiteGenerator` (the cache determinism
/// contract, §8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSignature {
    pub repo_hashes: Vec<RepoHash>,
    pub theme: String,
    pub theme_version: String,
    pub transforms: Vec<String>,
    pub config_hash: String,
    pub build_hash: String,
}

impl BuildSignature {
    /// Compose a signature from its inputs. `repo_hashes` and `transforms`
    /// are sorted in place so the resulting `build_hash` is order-independent.
    pub fn compose(
        mut repo_hashes: Vec<RepoHash>,
        theme: impl Into<String>,
        theme_version: impl Into<String>,
        mut transforms: Vec<String>,
        base_url: &str,
        title: &str,
    ) -> Self {
        use sha2::{Digest, Sha256};

        repo_hashes.sort_by(|a, b| a.name.cmp(&b.name));
        transforms.sort();
        let theme = theme.into();
        let theme_version = theme_version.into();

        let config_hash = {
            let payload = serde_json::json!({"theme": theme, "base_url": base_url, "title": title});
            let mut hasher = Sha256::new();
            hasher.update(serde_json::to_vec(&payload).expect("json serialization cannot fail").as_slice());
            hex::encode(hasher.finalize())
        };

        let without_build_hash = serde_json::json!({
            "repo_hashes": repo_hashes,
            "theme": theme,
            "theme_version": theme_version,
            "transforms": transforms,
            "config_hash": config_hash,
        });
        let build_hash = {
            let mut hasher = Sha256::new();
            hasher.update(serde_json::to_vec(&without_build_hash).expect("json serialization cannot fail").as_slice());
            hex::encode(hasher.finalize())
        };

        BuildSignature {
            repo_hashes,
            theme,
            theme_version,
            transforms,
            config_hash,
            build_hash,
        }
    }
}

/// Persisted map entry `"{url}:{branch}" -> last observed SHA` (§3, §4.4).
/// Only updated after a successful fetch or ls-remote observing that SHA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteHeadEntry {
    pub url: String,
    pub branch: String,
    pub commit_sha: String,
    pub updated_at: DateTime<Utc>,
}

impl RemoteHeadEntry {
    /// The on-disk map key for this entry: `"{url}:{branch}"`.
    pub fn key(url: &str, branch: &str) -> String {
        format!("{url}:{branch}")
    }
}

/// Unit of work dequeued by a worker (§3, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Discovery,
    Build,
    WebhookBuild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    /// Terminal states (`Succeeded`/`Failed`) are final (§3 invariant).
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub kind: JobKind,
    pub priority: u8,
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    pub reason: String,
    pub enqueued_at: DateTime<Utc>,
    pub state: JobState,
}

/// Queue sizing/backpressure policy (§3). The working bounded-FIFO
/// implementation lives in `docbuilder-daemon`; this struct is the
/// data-model description of its configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobQueueConfig {
    pub queue_size: usize,
    pub concurrent_builds: usize,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            queue_size: 64,
            concurrent_builds: 4,
        }
    }
}

/// A single immutable append-only log record (§3, C6). Payloads are typed
/// per [`EventType`]; a `decode` helper recovers the typed payload from the
/// stored JSON bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub build_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Event {
    /// Decode this event's JSON payload as `T`. Returns an `internal`
    /// classified error on malformed payloads (should never happen for
    /// events this crate wrote itself).
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, ClassifiedError> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            ClassifiedError::builder(Category::Internal, format!("malformed event payload: {e}"))
                .severity(Severity::Error)
                .build()
        })
    }
}

/// The event-type tag stored alongside each [`Event`]'s payload (§3, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    BuildStarted,
    RepositoryCloned,
    DocumentsDiscovered,
    TransformApplied,
    HugoConfigGenerated,
    SiteGenerated,
    BuildCompleted,
    BuildFailed,
    BuildReportGenerated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BuildStarted => "build_started",
            EventType::RepositoryCloned => "repository_cloned",
            EventType::DocumentsDiscovered => "documents_discovered",
            EventType::TransformApplied => "transform_applied",
            EventType::HugoConfigGenerated => "hugo_config_generated",
            EventType::SiteGenerated => "site_generated",
            EventType::BuildCompleted => "build_completed",
            EventType::BuildFailed => "build_failed",
            EventType::BuildReportGenerated => "build_report_generated",
        }
    }
}

/// Typed payload for [`EventType::BuildStarted`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStartedPayload {
    pub reason: String,
    #[serde(default)]
    pub repo_filter: Option<String>,
}

/// Typed payload for [`EventType::RepositoryCloned`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryClonedPayload {
    pub name: String,
    pub commit: String,
    pub incremental: bool,
}

/// Typed payload for [`EventType::DocumentsDiscovered`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentsDiscoveredPayload {
    pub repo: String,
    pub file_count: u64,
}

/// Typed payload for [`EventType::BuildCompleted`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCompletedPayload {
    pub outcome: BuildOutcome,
    pub duration_ms: u64,
    pub repo_count: u64,
    pub file_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    Completed,
    Skipped,
}

/// Typed payload for [`EventType::BuildFailed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildFailedPayload {
    pub stage: String,
    pub error: ClassifiedError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_exit_code_mapping_matches_spec() {
        let build = |category| ClassifiedError::builder(category, "x").build();
        assert_eq!(build(Category::Validation).cli_exit_code(), 2);
        assert_eq!(build(Category::Auth).cli_exit_code(), 5);
        assert_eq!(build(Category::Config).cli_exit_code(), 7);
        assert_eq!(build(Category::Network).cli_exit_code(), 8);
        assert_eq!(build(Category::Git).cli_exit_code(), 8);
        assert_eq!(build(Category::Forge).cli_exit_code(), 8);
        assert_eq!(build(Category::Internal).cli_exit_code(), 10);
        assert_eq!(build(Category::Build).cli_exit_code(), 11);
        assert_eq!(build(Category::Hugo).cli_exit_code(), 11);
        assert_eq!(build(Category::Filesystem).cli_exit_code(), 11);
        assert_eq!(build(Category::Daemon).cli_exit_code(), 12);
        assert_eq!(build(Category::Runtime).cli_exit_code(), 12);
        assert_eq!(build(Category::NotFound).cli_exit_code(), 1);
    }

    #[test]
    fn http_status_mapping_matches_spec() {
        let build = |category| ClassifiedError::builder(category, "x").build();
        assert_eq!(build(Category::Validation).http_status_code(), 400);
        assert_eq!(build(Category::Config).http_status_code(), 400);
        assert_eq!(build(Category::Auth).http_status_code(), 401);
        assert_eq!(build(Category::NotFound).http_status_code(), 404);
        assert_eq!(build(Category::AlreadyExists).http_status_code(), 409);
        assert_eq!(build(Category::Network).http_status_code(), 502);
        assert_eq!(build(Category::Build).http_status_code(), 422);
        assert_eq!(build(Category::Filesystem).http_status_code(), 500);
        assert_eq!(build(Category::Runtime).http_status_code(), 503);
        assert_eq!(build(Category::Daemon).http_status_code(), 503);
    }

    #[test]
    fn internal_errors_never_leak_message_over_http() {
        let err = ClassifiedError::builder(Category::Internal, "leaked stack trace: foo.rs:42")
            .build();
        let body = err.to_http_body();
        assert_eq!(body["error"], "an internal error occurred");
    }

    #[test]
    fn user_facing_categories_keep_their_message() {
        let err = ClassifiedError::builder(Category::Validation, "branch name is required").build();
        let body = err.to_http_body();
        assert_eq!(body["error"], "branch name is required");
    }

    #[test]
    fn warning_severity_does_not_abort_job() {
        let err = ClassifiedError::builder(Category::Daemon, "queue almost full")
            .severity(Severity::Warning)
            .build();
        assert!(!err.aborts_job());
    }

    #[test]
    fn error_and_fatal_severity_abort_job() {
        let err = ClassifiedError::builder(Category::Git, "clone failed")
            .severity(Severity::Error)
            .build();
        assert!(err.aborts_job());
    }

    #[test]
    fn repo_hash_is_deterministic_for_identical_inputs() {
        let entries = vec![
            ("docs/a.md".to_string(), "blobhash1".to_string()),
            ("docs/b.md".to_string(), "blobhash2".to_string()),
        ];
        let a = RepoHash::compute("repo", "deadbeef", &entries);
        let b = RepoHash::compute("repo", "deadbeef", &entries);
        assert_eq!(a, b);
    }

    #[test]
    fn repo_hash_changes_with_content() {
        let entries_a = vec![("docs/a.md".to_string(), "blobhash1".to_string())];
        let entries_b = vec![("docs/a.md".to_string(), "blobhash2".to_string())];
        let a = RepoHash::compute("repo", "deadbeef", &entries_a);
        let b = RepoHash::compute("repo", "deadbeef", &entries_b);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn repo_hash_with_no_entries_is_valid() {
        // compute_repo_hash(path, commit, ["nonexistent"]) must still
        // produce a valid hash based on commit alone (§8 boundary case).
        let hash = RepoHash::compute("repo", "deadbeef", &[]);
        assert_eq!(hash.commit, "deadbeef");
        assert!(!hash.hash.is_empty());
    }

    #[test]
    fn build_signature_is_order_independent() {
        let hashes_a = vec![
            RepoHash::compute("b", "sha-b", &[]),
            RepoHash::compute("a", "sha-a", &[]),
        ];
        let hashes_b = vec![
            RepoHash::compute("a", "sha-a", &[]),
            RepoHash::compute("b", "sha-b", &[]),
        ];
        let sig_a = BuildSignature::compose(
            hashes_a,
            "hugo-theme",
            "1.0.0",
            vec!["frontmatter".into(), "links".into()],
            "https://docs.example.com",
            "Example Docs",
        );
        let sig_b = BuildSignature::compose(
            hashes_b,
            "hugo-theme",
            "1.0.0",
            vec!["links".into(), "frontmatter".into()],
            "https://docs.example.com",
            "Example Docs",
        );
        assert_eq!(sig_a.build_hash, sig_b.build_hash);
    }

    #[test]
    fn build_signature_changes_with_repo_hash() {
        let sig_a = BuildSignature::compose(
            vec![RepoHash::compute("a", "sha-1", &[])],
            "theme",
            "1.0.0",
            vec![],
            "https://x",
            "X",
        );
        let sig_b = BuildSignature::compose(
            vec![RepoHash::compute("a", "sha-2", &[])],
            "theme",
            "1.0.0",
            vec![],
            "https://x",
            "X",
        );
        assert_ne!(sig_a.build_hash, sig_b.build_hash);
    }

    #[test]
    fn job_terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn event_decode_roundtrips_typed_payload() {
        let payload = DocumentsDiscoveredPayload {
            repo: "org/docs".into(),
            file_count: 12,
        };
        let event = Event {
            id: 1,
            build_id: "build-1".into(),
            event_type: EventType::DocumentsDiscovered,
            timestamp: Utc::now(),
            payload: serde_json::to_vec(&payload).unwrap(),
            metadata: BTreeMap::new(),
        };
        let decoded: DocumentsDiscoveredPayload = event.decode().unwrap();
        assert_eq!(decoded.repo, "org/docs");
        assert_eq!(decoded.file_count, 12);
    }

    #[test]
    fn remote_head_entry_key_format() {
        assert_eq!(
            RemoteHeadEntry::key("https://example.com/org/repo.git", "main"),
            "https://example.com/org/repo.git:main"
        );
    }

    proptest::proptest! {
        #[test]
        fn repo_hash_ignores_entry_order_when_pre_sorted(
            a_hash in "[a-f0-9]{8}",
            b_hash in "[a-f0-9]{8}",
        ) {
            // The invariant is determinism given *identical* sorted inputs,
            // not order-independence: feeding entries in a different order
            // must change the hash unless the caller sorts first.
            let sorted = vec![("a.md".to_string(), a_hash.clone()), ("b.md".to_string(), b_hash.clone())];
            let unsorted = vec![("b.md".to_string(), b_hash), ("a.md".to_string(), a_hash)];
            let sorted_hash = RepoHash::compute("r", "c", &sorted);
            let unsorted_hash = RepoHash::compute("r", "c", &unsorted);
            proptest::prop_assert_ne!(sorted_hash.hash, unsorted_hash.hash);
        }
    }
}
