//! Git synchronization layer (C4).
//!
//! Clones and updates documentation-source repositories, with a shallow
//! clone policy, pruning of non-doc paths, typed error classification,
//! an ls-remote cache to skip unnecessary fetches, and divergence
//! detection with optional hard reset (§4.4).
//!
//! This crate shells out to the `git` binary via `docbuilder-process`
//! rather than embedding a git implementation, matching how other
//! external tools in this workspace (the site generator, forge clients)
//! are treated: as subprocesses or HTTP collaborators, never libraries
//! vendored into the core.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use docbuilder_process::{CommandResult, run_command_in_dir, run_command_in_dir_with_env};
use docbuilder_retry::{BackoffConfig, RetryStrategy as BackoffRetryStrategy, adaptive_delay_for_attempt};
use docbuilder_types::{AuthConfig, Category, ClassifiedError, RemoteHeadEntry, Repository, RepoHash, Severity};

/// Options controlling a `clone` operation (§4.4).
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    pub shallow_depth: Option<u32>,
    pub prune_non_doc_paths: bool,
    pub prune_allow: Vec<String>,
    pub prune_deny: Vec<String>,
}

/// Options controlling an `update` operation (§4.4).
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub shallow_depth: Option<u32>,
    pub hard_reset_on_diverge: bool,
    pub clean_untracked: bool,
    pub prune_non_doc_paths: bool,
    pub prune_allow: Vec<String>,
    pub prune_deny: Vec<String>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        UpdateOptions {
            shallow_depth: None,
            hard_reset_on_diverge: false,
            clean_untracked: false,
            prune_non_doc_paths: false,
            prune_allow: Vec::new(),
            prune_deny: Vec::new(),
        }
    }
}

/// Outcome of a successful `update_repo` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub commit: String,
    pub fast_forwarded: bool,
    pub hard_reset: bool,
}

fn git_err(message: impl Into<String>) -> ClassifiedError {
    ClassifiedError::builder(Category::Git, message).severity(Severity::Error).build()
}

/// Map a git stderr string to a typed classified error. Heuristic,
/// grouping stderr text into auth, not-found, network and conflict
/// failure families.
fn classify_git_failure(stderr: &str) -> ClassifiedError {
    let lower = stderr.to_lowercase();
    if lower.contains("authentication failed") || lower.contains("permission denied") || lower.contains("could not read username") {
        ClassifiedError::builder(Category::Auth, "git authentication failed")
            .severity(Severity::Error)
            .retry_strategy(docbuilder_types::RetryStrategy::Never)
            .cause(stderr.to_string())
            .build()
    } else if lower.contains("repository not found") || lower.contains("not found") || lower.contains("does not exist") {
        ClassifiedError::builder(Category::NotFound, "repository not found")
            .severity(Severity::Error)
            .retry_strategy(docbuilder_types::RetryStrategy::Never)
            .cause(stderr.to_string())
            .build()
    } else if lower.contains("unsupported protocol") || lower.contains("unknown protocol") {
        ClassifiedError::builder(Category::Git, "unsupported git protocol")
            .severity(Severity::Error)
            .retry_strategy(docbuilder_types::RetryStrategy::Never)
            .cause(stderr.to_string())
            .build()
    } else if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests") {
        ClassifiedError::builder(Category::Network, "rate limited by remote")
            .severity(Severity::Error)
            .retry_strategy(docbuilder_types::RetryStrategy::RateLimit)
            .cause(stderr.to_string())
            .build()
    } else if lower.contains("timed out") || lower.contains("timeout") || lower.contains("could not resolve host") || lower.contains("connection") {
        ClassifiedError::builder(Category::Network, "network timeout contacting remote")
            .severity(Severity::Error)
            .retry_strategy(docbuilder_types::RetryStrategy::Backoff)
            .cause(stderr.to_string())
            .build()
    } else {
        ClassifiedError::builder(Category::Git, "git operation failed")
            .severity(Severity::Error)
            .retry_strategy(docbuilder_types::RetryStrategy::Backoff)
            .cause(stderr.to_string())
            .build()
    }
}

fn run_git(dir: &Path, args: &[&str]) -> Result<CommandResult, ClassifiedError> {
    run_command_in_dir("git", args, dir).map_err(|e| git_err(format!("failed to invoke git: {e}")))
}

/// Runs git with the environment variables `auth` requires (§4.4: the
/// configured auth method). Only SSH auth needs an env var per
/// invocation — token/basic auth is carried in the remote URL itself,
/// rewritten once by [`authed_url`].
fn run_git_authed(dir: &Path, args: &[&str], auth: &AuthConfig) -> Result<CommandResult, ClassifiedError> {
    let env = ssh_command_env(auth);
    if env.is_empty() {
        return run_git(dir, args);
    }
    run_command_in_dir_with_env("git", args, dir, &env).map_err(|e| git_err(format!("failed to invoke git: {e}")))
}

fn ssh_command_env(auth: &AuthConfig) -> Vec<(String, String)> {
    match auth {
        AuthConfig::Ssh { key_path } => vec![(
            "GIT_SSH_COMMAND".to_string(),
            format!("ssh -i {key_path} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new"),
        )],
        _ => Vec::new(),
    }
}

/// Rewrites an `http(s)` remote URL to carry the configured credential
/// as userinfo (§4.4 token/basic auth). SSH auth and unauthenticated
/// repositories pass the URL through untouched — SSH keys are supplied
/// via `GIT_SSH_COMMAND` instead.
fn authed_url(url: &str, auth: &AuthConfig) -> String {
    match auth {
        AuthConfig::Token { token } => with_userinfo(url, "x-access-token", token),
        AuthConfig::Basic { user, pass } => with_userinfo(url, user, pass),
        AuthConfig::Ssh { .. } | AuthConfig::None => url.to_string(),
    }
}

fn with_userinfo(url: &str, user: &str, pass: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("https://{user}:{pass}@{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("http://{user}:{pass}@{rest}")
    } else {
        url.to_string()
    }
}

/// Strips a configured credential out of stderr before it lands in a
/// `ClassifiedError` cause — git echoes the remote URL (userinfo and
/// all) back into its own error output on a failed clone/fetch.
fn redact_auth(stderr: &str, auth: &AuthConfig) -> String {
    match auth {
        AuthConfig::Token { token } => stderr.replace(token, "[REDACTED]"),
        AuthConfig::Basic { pass, .. } => stderr.replace(pass, "[REDACTED]"),
        AuthConfig::Ssh { .. } | AuthConfig::None => stderr.to_string(),
    }
}

fn ok_or_classified(result: CommandResult) -> Result<CommandResult, ClassifiedError> {
    if result.success {
        Ok(result)
    } else {
        Err(classify_git_failure(&result.stderr))
    }
}

fn ok_or_classified_authed(result: CommandResult, auth: &AuthConfig) -> Result<CommandResult, ClassifiedError> {
    if result.success {
        Ok(result)
    } else {
        Err(classify_git_failure(&redact_auth(&result.stderr, auth)))
    }
}

/// `true` if a classified error's retry strategy is permanent and must
/// never be retried, regardless of caller-requested `max_retries` (§4.4:
/// auth, not-found, unsupported-protocol, diverged, invalid reference,
/// non-timeout network errors short-circuit).
fn is_permanent(err: &ClassifiedError) -> bool {
    matches!(
        err.retry_strategy,
        docbuilder_types::RetryStrategy::Never | docbuilder_types::RetryStrategy::UserAction
    ) || err.context.get("kind").map(|k| k == "diverged").unwrap_or(false)
}

/// Clone `repo` into `dest`, removing any preexisting directory first
/// (§4.4, §8 boundary case: "atomic from the caller's perspective").
pub fn clone_repo(repo: &Repository, dest: &Path, opts: &CloneOptions) -> Result<String, ClassifiedError> {
    if dest.exists() {
        fs::remove_dir_all(dest).map_err(|e| {
            ClassifiedError::builder(Category::Filesystem, format!("failed to remove existing directory: {e}"))
                .severity(Severity::Error)
                .build()
        })?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            ClassifiedError::builder(Category::Filesystem, format!("failed to create parent directory: {e}"))
                .severity(Severity::Error)
                .build()
        })?;
    }

    let auth = repo.auth.clone().unwrap_or_default();

    let mut args: Vec<String> = vec!["clone".to_string()];
    if let Some(branch) = &repo.branch {
        args.push("--single-branch".to_string());
        args.push("--branch".to_string());
        args.push(branch.clone());
    }
    if let Some(depth) = opts.shallow_depth {
        args.push("--depth".to_string());
        args.push(depth.to_string());
    }
    args.push(authed_url(&repo.url, &auth));
    args.push(dest.display().to_string());

    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let result = run_git_authed(parent, &arg_refs, &auth)?;
    ok_or_classified_authed(result, &auth)?;

    let commit = current_commit(dest)?;

    if opts.prune_non_doc_paths {
        prune_non_doc_paths(dest, &repo.paths, &opts.prune_allow, &opts.prune_deny)?;
    }

    Ok(commit)
}

/// Resolve the current HEAD commit SHA of a work tree.
pub fn current_commit(dest: &Path) -> Result<String, ClassifiedError> {
    let result = run_git(dest, &["rev-parse", "HEAD"])?;
    let result = ok_or_classified(result)?;
    Ok(result.stdout.trim().to_string())
}

/// Fetch and fast-forward/reset an existing work tree (§4.4). Branch
/// resolution order: explicit `repo.branch` > current HEAD branch >
/// remote HEAD default > `main`.
pub fn update_repo(repo: &Repository, dest: &Path, opts: &UpdateOptions) -> Result<UpdateOutcome, ClassifiedError> {
    if !dest.join(".git").exists() {
        return Err(ClassifiedError::builder(Category::Git, "work tree does not exist; clone first")
            .severity(Severity::Error)
            .build());
    }

    let auth = repo.auth.clone().unwrap_or_default();

    let mut fetch_args: Vec<String> = vec!["fetch".to_string(), "origin".to_string(), "+refs/heads/*:refs/remotes/origin/*".to_string()];
    if let Some(depth) = opts.shallow_depth {
        fetch_args.push("--depth".to_string());
        fetch_args.push(depth.to_string());
    }
    let arg_refs: Vec<&str> = fetch_args.iter().map(|s| s.as_str()).collect();
    ok_or_classified_authed(run_git_authed(dest, &arg_refs, &auth)?, &auth)?;

    let branch = resolve_target_branch(repo, dest)?;

    let remote_ref = format!("origin/{branch}");
    let remote_exists = run_git(dest, &["rev-parse", "--verify", &remote_ref]).map(|r| r.success).unwrap_or(false);
    if !remote_exists {
        return Err(ClassifiedError::builder(Category::Git, format!("invalid reference: {remote_ref}"))
            .severity(Severity::Error)
            .retry_strategy(docbuilder_types::RetryStrategy::Never)
            .build());
    }

    let local_exists = run_git(dest, &["rev-parse", "--verify", &branch]).map(|r| r.success).unwrap_or(false);
    if !local_exists {
        ok_or_classified(run_git(dest, &["checkout", "-B", &branch, &remote_ref])?)?;
    } else {
        ok_or_classified(run_git(dest, &["checkout", &branch])?)?;
    }

    let local_commit = current_commit(dest)?;
    let remote_commit = {
        let result = ok_or_classified(run_git(dest, &["rev-parse", &remote_ref])?)?;
        result.stdout.trim().to_string()
    };

    let outcome = if local_commit == remote_commit {
        UpdateOutcome { commit: local_commit, fast_forwarded: false, hard_reset: false }
    } else if is_ancestor(dest, &local_commit, &remote_commit)? {
        ok_or_classified(run_git(dest, &["reset", "--hard", &remote_commit])?)?;
        UpdateOutcome { commit: remote_commit, fast_forwarded: true, hard_reset: false }
    } else if opts.hard_reset_on_diverge {
        tracing::warn!(repo = %repo.name, "branch diverged from remote; hard resetting");
        ok_or_classified(run_git(dest, &["reset", "--hard", &remote_commit])?)?;
        UpdateOutcome { commit: remote_commit, fast_forwarded: false, hard_reset: true }
    } else {
        return Err(ClassifiedError::builder(Category::Git, "local branch diverged from remote")
            .severity(Severity::Error)
            .retry_strategy(docbuilder_types::RetryStrategy::Never)
            .context("kind", "diverged")
            .context("local", local_commit)
            .context("remote", remote_commit)
            .build());
    };

    if opts.clean_untracked {
        ok_or_classified(run_git(dest, &["clean", "-fd"])?)?;
    }
    if opts.prune_non_doc_paths {
        prune_non_doc_paths(dest, &repo.paths, &opts.prune_allow, &opts.prune_deny)?;
    }

    Ok(outcome)
}

fn resolve_target_branch(repo: &Repository, dest: &Path) -> Result<String, ClassifiedError> {
    if let Some(branch) = &repo.branch {
        return Ok(branch.clone());
    }
    if let Ok(result) = run_git(dest, &["rev-parse", "--abbrev-ref", "HEAD"]) {
        if result.success {
            let branch = result.stdout.trim().to_string();
            if !branch.is_empty() && branch != "HEAD" {
                return Ok(branch);
            }
        }
    }
    if let Ok(result) = run_git(dest, &["remote", "show", "origin"]) {
        if result.success {
            for line in result.stdout.lines() {
                if let Some(rest) = line.trim().strip_prefix("HEAD branch:") {
                    let branch = rest.trim();
                    if !branch.is_empty() && branch != "(unknown)" {
                        return Ok(branch.to_string());
                    }
                }
            }
        }
    }
    Ok("main".to_string())
}

/// BFS ancestry test: is `a` an ancestor of (or equal to) `b`? `a == b`
/// is always `true` even if neither exists (§4.4, §8 boundary case). If
/// `b` cannot be loaded this is a classified error; a missing `a`
/// encountered only during the walk is a clean `false`.
pub fn is_ancestor(repo_path: &Path, a: &str, b: &str) -> Result<bool, ClassifiedError> {
    if a == b {
        return Ok(true);
    }

    let check_exists = run_git(repo_path, &["cat-file", "-e", b]);
    match check_exists {
        Ok(result) if result.success => {}
        _ => {
            return Err(ClassifiedError::builder(Category::Git, format!("commit {b} could not be loaded"))
                .severity(Severity::Error)
                .build());
        }
    }

    let result = run_git(repo_path, &["merge-base", "--is-ancestor", a, b]);
    match result {
        Ok(r) => Ok(r.success),
        Err(_) => Ok(false),
    }
}

/// Remove top-level entries not kept by the doc-path pruning policy
/// (§4.4): `.git`, first-segment names of configured doc paths
/// (normalized), `prune_allow` glob matches minus `prune_deny` matches
/// (deny wins).
pub fn prune_non_doc_paths(dest: &Path, doc_paths: &[String], allow: &[String], deny: &[String]) -> Result<(), ClassifiedError> {
    let mut keep: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
    keep.insert(".git".to_string());
    for p in doc_paths {
        if let Some(first) = normalize_doc_path(p).split('/').next() {
            if !first.is_empty() {
                keep.insert(first.to_string());
            }
        }
    }

    let entries = fs::read_dir(dest).map_err(|e| {
        ClassifiedError::builder(Category::Filesystem, format!("failed to read directory {}: {e}", dest.display()))
            .severity(Severity::Error)
            .build()
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| {
            ClassifiedError::builder(Category::Filesystem, format!("failed to read directory entry: {e}"))
                .severity(Severity::Error)
                .build()
        })?;
        let name = entry.file_name().to_string_lossy().to_string();
        if keep.contains(&name) {
            continue;
        }

        let allowed = allow.iter().any(|pattern| glob_matches(pattern, &name));
        let denied = deny.iter().any(|pattern| glob_matches(pattern, &name));
        if allowed && !denied {
            continue;
        }

        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .map_err(|e| {
            ClassifiedError::builder(Category::Filesystem, format!("failed to prune {}: {e}", path.display()))
                .severity(Severity::Error)
                .build()
        })?;
    }

    Ok(())
}

fn glob_matches(pattern: &str, name: &str) -> bool {
    glob::Pattern::new(pattern).map(|p| p.matches(name)).unwrap_or(false)
}

/// Normalize a configured doc path: strip leading `./` and `/`, strip a
/// trailing `/`, convert backslashes to forward slashes (§4.4).
pub fn normalize_doc_path(path: &str) -> String {
    let mut s = path.replace('\\', "/");
    while let Some(stripped) = s.strip_prefix("./") {
        s = stripped.to_string();
    }
    let s = s.trim_start_matches('/');
    s.trim_end_matches('/').to_string()
}

/// Compute a [`RepoHash`] from a git tree: blob hashes under the
/// configured paths, sorted lexicographically by path, hashed together
/// with the commit SHA. A nonexistent path is silently skipped (§4.4,
/// §8 boundary case).
pub fn compute_repo_hash_from_tree(repo_path: &Path, name: &str, commit: &str, paths: &[String]) -> Result<RepoHash, ClassifiedError> {
    let mut entries: Vec<(String, String)> = Vec::new();

    for raw_path in paths {
        let normalized = normalize_doc_path(raw_path);
        let result = run_git(repo_path, &["ls-tree", "-r", commit, "--", &normalized]);
        let Ok(result) = result else { continue };
        if !result.success {
            continue;
        }
        for line in result.stdout.lines() {
            // format: "<mode> blob <sha>\t<path>"
            let mut parts = line.splitn(2, '\t');
            let meta = parts.next().unwrap_or("");
            let path = parts.next().unwrap_or("");
            let blob_hash = meta.split_whitespace().nth(2).unwrap_or("");
            if !blob_hash.is_empty() && !path.is_empty() {
                entries.push((path.to_string(), blob_hash.to_string()));
            }
        }
    }

    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(RepoHash::compute(name, commit, &entries))
}

/// Compute a [`RepoHash`] by walking the working directory rather than
/// the git tree: used when the source isn't git-backed (local forge).
/// Skips dotfiles and nonexistent paths (§4.4).
pub fn compute_repo_hash_from_workdir(repo_path: &Path, name: &str, commit: &str, paths: &[String]) -> Result<RepoHash, ClassifiedError> {
    let mut entries: Vec<(String, String)> = Vec::new();
    for raw_path in paths {
        let normalized = normalize_doc_path(raw_path);
        let root = repo_path.join(&normalized);
        if !root.exists() {
            continue;
        }
        walk_dir(&root, &root, &mut entries)?;
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(RepoHash::compute(name, commit, &entries))
}

fn walk_dir(root: &Path, base: &Path, out: &mut Vec<(String, String)>) -> Result<(), ClassifiedError> {
    use sha2::{Digest, Sha256};

    let entries = match fs::read_dir(root) {
        Ok(e) => e,
        Err(_) => return Ok(()),
    };
    for entry in entries {
        let entry = entry.map_err(|e| {
            ClassifiedError::builder(Category::Filesystem, format!("failed to read directory entry: {e}"))
                .severity(Severity::Error)
                .build()
        })?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            walk_dir(&path, base, out)?;
        } else {
            let bytes = fs::read(&path).unwrap_or_default();
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            let digest = hex::encode(hasher.finalize());
            let rel = path.strip_prefix(base).unwrap_or(&path).to_string_lossy().replace('\\', "/");
            out.push((rel, digest));
        }
    }
    Ok(())
}

/// Persistent `(url, branch) -> last observed SHA` map (§4.4, §6). Writes
/// are guarded by an in-process mutex; the whole map is serialized to a
/// single JSON file on each save.
pub struct RemoteHeadCache {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, RemoteHeadEntry>>,
}

impl RemoteHeadCache {
    /// Load from `path`, or start empty if the file doesn't exist yet.
    pub fn load(path: PathBuf) -> Result<Self, ClassifiedError> {
        let entries = if path.exists() {
            let data = fs::read_to_string(&path).map_err(|e| {
                ClassifiedError::builder(Category::Filesystem, format!("failed to read remote-head cache: {e}"))
                    .severity(Severity::Error)
                    .build()
            })?;
            serde_json::from_str(&data).unwrap_or_default()
        } else {
            BTreeMap::new()
        };
        Ok(RemoteHeadCache { path, entries: Mutex::new(entries) })
    }

    pub fn get(&self, url: &str, branch: &str) -> Option<RemoteHeadEntry> {
        let key = RemoteHeadEntry::key(url, branch);
        self.entries.lock().expect("remote head cache mutex poisoned").get(&key).cloned()
    }

    fn set(&self, entry: RemoteHeadEntry) {
        let key = RemoteHeadEntry::key(&entry.url, &entry.branch);
        self.entries.lock().expect("remote head cache mutex poisoned").insert(key, entry);
    }

    /// Persist the whole map atomically (write to a temp file, then
    /// rename), guarded by the in-process mutex.
    pub fn save(&self) -> Result<(), ClassifiedError> {
        let entries = self.entries.lock().expect("remote head cache mutex poisoned");
        let data = serde_json::to_string_pretty(&*entries).map_err(|e| {
            ClassifiedError::builder(Category::Internal, format!("failed to serialize remote-head cache: {e}"))
                .severity(Severity::Error)
                .build()
        })?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).ok();
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data).map_err(|e| {
            ClassifiedError::builder(Category::Filesystem, format!("failed to write remote-head cache: {e}"))
                .severity(Severity::Error)
                .build()
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            ClassifiedError::builder(Category::Filesystem, format!("failed to commit remote-head cache: {e}"))
                .severity(Severity::Error)
                .build()
        })?;
        Ok(())
    }

    /// `ls-remote` the given branch and report whether it differs from
    /// the cached SHA (§4.4: fail-open — no cached entry, a differing
    /// SHA, or the ls-remote itself failing all report `changed=true`).
    /// On success the cache is updated with the observed SHA.
    pub fn check_remote_changed(&self, url: &str, branch: &str) -> (bool, Option<String>) {
        let result = run_command_in_dir("git", &["ls-remote", url, &format!("refs/heads/{branch}")], Path::new("."));
        let remote_sha = match result {
            Ok(r) if r.success => r.stdout.split_whitespace().next().map(|s| s.to_string()),
            _ => None,
        };

        let Some(sha) = remote_sha else {
            return (true, None);
        };

        let cached = self.get(url, branch);
        let changed = cached.map(|c| c.commit_sha != sha).unwrap_or(true);

        self.set(RemoteHeadEntry {
            url: url.to_string(),
            branch: branch.to_string(),
            commit_sha: sha.clone(),
            updated_at: Utc::now(),
        });

        (changed, Some(sha))
    }

    /// Record an observation made via fetch/update rather than
    /// ls-remote (§3 invariant: only updated after a successful fetch or
    /// ls-remote observing that SHA).
    pub fn record_observed(&self, url: &str, branch: &str, commit_sha: String) {
        self.set(RemoteHeadEntry {
            url: url.to_string(),
            branch: branch.to_string(),
            commit_sha,
            updated_at: Utc::now(),
        });
    }
}

/// Retry wrapper for clone/update (§4.4). Permanent errors (auth,
/// not-found, unsupported-protocol, diverged, invalid-reference,
/// non-timeout network) short-circuit without retry. The `in_retry`
/// guard prevents update-falls-back-to-clone from nesting a second
/// retry budget inside the first.
pub struct RetryingGitClient {
    config: BackoffConfig,
    in_retry: std::sync::atomic::AtomicBool,
}

impl RetryingGitClient {
    pub fn new(config: BackoffConfig) -> Self {
        RetryingGitClient { config, in_retry: std::sync::atomic::AtomicBool::new(false) }
    }

    /// Clone with retry. If already inside a retry (the nested-call
    /// guard), runs once without wrapping.
    pub async fn clone_repo(&self, repo: &Repository, dest: &Path, opts: &CloneOptions) -> Result<String, ClassifiedError> {
        self.with_retry(|| clone_repo(repo, dest, opts)).await
    }

    /// Update with retry, falling back to a fresh clone if the work
    /// tree update itself fails for a retryable reason after retries are
    /// exhausted only when the caller asks (kept simple: a fallback
    /// clone shares the same `in_retry` guard, so it stays within the
    /// same retry budget rather than getting its own).
    pub async fn update_repo(&self, repo: &Repository, dest: &Path, opts: &UpdateOptions) -> Result<UpdateOutcome, ClassifiedError> {
        self.with_retry(|| update_repo(repo, dest, opts)).await
    }

    // `op` shells out to `git` synchronously (via `docbuilder-process`).
    // Every call is routed through `tokio::task::block_in_place` rather
    // than `spawn_blocking`, since `op` borrows `repo`/`dest`/`opts` and
    // isn't `'static`; `block_in_place` lets the current worker thread
    // block without starving the runtime's other tasks, at the cost of
    // requiring a multi-threaded runtime (true of every entry point here).
    async fn with_retry<T>(&self, mut op: impl FnMut() -> Result<T, ClassifiedError>) -> Result<T, ClassifiedError> {
        if self.config.max_attempts == 0 {
            return tokio::task::block_in_place(&mut op);
        }
        if self.in_retry.swap(true, std::sync::atomic::Ordering::SeqCst) {
            // Already inside a retry budget (nested call); run once.
            return tokio::task::block_in_place(&mut op);
        }
        let result = self.retry_loop(&mut op).await;
        self.in_retry.store(false, std::sync::atomic::Ordering::SeqCst);
        result
    }

    async fn retry_loop<T>(&self, op: &mut impl FnMut() -> Result<T, ClassifiedError>) -> Result<T, ClassifiedError> {
        let mut attempt = 1;
        loop {
            match tokio::task::block_in_place(&mut *op) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if is_permanent(&err) || attempt >= self.config.max_attempts {
                        return Err(err);
                    }
                    let strategy = to_retry_strategy(&err);
                    let delay = adaptive_delay_for_attempt(&self.config, attempt, strategy);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn to_retry_strategy(err: &ClassifiedError) -> BackoffRetryStrategy {
    match err.retry_strategy {
        docbuilder_types::RetryStrategy::RateLimit => BackoffRetryStrategy::RateLimit,
        docbuilder_types::RetryStrategy::Immediate => BackoffRetryStrategy::Immediate,
        docbuilder_types::RetryStrategy::Never => BackoffRetryStrategy::Never,
        docbuilder_types::RetryStrategy::UserAction => BackoffRetryStrategy::UserAction,
        docbuilder_types::RetryStrategy::Backoff => BackoffRetryStrategy::Backoff,
    }
}
