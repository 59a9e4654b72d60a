//! Configuration loading and CLI-override merge (§6 expansion, C8).
//!
//! `.docbuilder.toml` is loaded with [`Config::load_from_file`] or
//! discovered upward from a workspace with [`Config::load_from_workspace`],
//! then merged with CLI flags captured in [`CliOverrides`]: `Option<T>`
//! fields are `None` when the user didn't pass the flag (file value or default
//! wins), `bool` flags are OR'd (a flag can only turn a setting on,
//! never silently off). [`Config::merge`] produces the [`RuntimeConfig`]
//! threaded through the orchestrator at startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use docbuilder_retry::BackoffConfig;
use docbuilder_types::{AuthConfig, Category, ClassifiedError, Severity};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = ".docbuilder.toml";

/// A configured source-code hosting service (§6 `ForgeClient` capability
/// set; this is the config-file shape, not the runtime client).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeConfig {
    pub name: String,
    pub kind: ForgeKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub auto_discover: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForgeKind {
    Github,
    Gitlab,
    Forgejo,
    Local,
}

/// An explicitly configured repository, prior to forge-driven discovery
/// expansion (§3 `Repository`, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub is_tag: bool,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Extra tag/branch refs to expand into version-scoped `Repository`
    /// entries (see §4.10 `version_count`/`available_versions`).
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub default_version: Option<String>,
}

/// Forge/repository discovery filters (§4.7 `FilteringConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilteringConfig {
    pub required_paths: Vec<String>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub ignore_files: Vec<String>,
}

impl Default for FilteringConfig {
    fn default() -> Self {
        FilteringConfig {
            required_paths: Vec::new(),
            include_patterns: vec!["*".to_string()],
            exclude_patterns: Vec::new(),
            ignore_files: vec![".docbuilderignore".to_string()],
        }
    }
}

/// Git sync policy (§4.4, §4.8 worker step 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Standard 5-field cron expression. `None` disables scheduled sync.
    pub schedule: Option<String>,
    pub shallow_depth: Option<u32>,
    pub incremental: bool,
    pub hard_reset_on_diverge: bool,
    pub clean_untracked: bool,
    pub prune_non_doc_paths: bool,
    pub prune_allow: Vec<String>,
    pub prune_deny: Vec<String>,
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    /// Bound on concurrent git subprocesses, independent of
    /// `daemon.concurrent_builds` (§4.4 expansion: one build may shell
    /// out to git several times per repo).
    pub git_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            schedule: None,
            shallow_depth: Some(1),
            incremental: true,
            hard_reset_on_diverge: false,
            clean_untracked: false,
            prune_non_doc_paths: true,
            prune_allow: Vec::new(),
            prune_deny: Vec::new(),
            max_retries: 3,
            backoff: BackoffConfig::default(),
            git_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    #[default]
    Auto,
    Always,
    Never,
}

/// Site-generation policy (§4.5 `BuildSignature` inputs, §4.8 step 8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub theme: String,
    pub theme_version: String,
    pub transforms: Vec<String>,
    pub base_url: String,
    pub title: String,
    pub render_mode: RenderMode,
    pub skip_if_unchanged: bool,
    pub output_dir: PathBuf,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            theme: "default".to_string(),
            theme_version: "0.0.0".to_string(),
            transforms: Vec::new(),
            base_url: "http://localhost:8080".to_string(),
            title: "Documentation".to_string(),
            render_mode: RenderMode::Auto,
            skip_if_unchanged: true,
            output_dir: PathBuf::from("public"),
        }
    }
}

/// WebSocket reload-on-rebuild listener (§4.9 livereload listener).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivereloadConfig {
    pub port: u16,
}

/// The three-or-four-listener HTTP surface (§4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub docs_port: u16,
    pub webhook_port: u16,
    pub admin_port: u16,
    pub livereload: Option<LivereloadConfig>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig { docs_port: 8080, webhook_port: 8081, admin_port: 8082, livereload: None }
    }
}

/// Job queue / worker-pool sizing (§3 `JobQueue`, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub queue_size: usize,
    pub concurrent_builds: usize,
    pub history_size: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig { queue_size: 64, concurrent_builds: 4, history_size: 100 }
    }
}

/// Top-level `.docbuilder.toml`-sourced configuration (§6 expansion).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub forges: Vec<ForgeConfig>,
    pub repositories: Vec<RepositoryConfig>,
    pub filtering: FilteringConfig,
    pub sync: SyncConfig,
    pub build: BuildConfig,
    pub http: HttpConfig,
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from(".docbuilder"),
            forges: Vec::new(),
            repositories: Vec::new(),
            filtering: FilteringConfig::default(),
            sync: SyncConfig::default(),
            build: BuildConfig::default(),
            http: HttpConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

/// Fallback data directory for a daemon invocation with no discoverable
/// `.docbuilder.toml` and no `-d`/`--data-dir` flag: `$XDG_DATA_HOME/docbuilder`
/// (or the platform equivalent), falling back to `.docbuilder` in the
/// current directory if the platform has no data-home concept.
pub fn default_state_home() -> PathBuf {
    dirs::data_local_dir().map(|d| d.join("docbuilder")).unwrap_or_else(|| PathBuf::from(".docbuilder"))
}

impl Config {
    /// Search upward from `workspace_root` for `.docbuilder.toml`;
    /// `Ok(None)` if none is found anywhere up to the filesystem root.
    pub fn load_from_workspace(workspace_root: &Path) -> Result<Option<Self>> {
        let mut dir = Some(workspace_root);
        while let Some(d) = dir {
            let candidate = d.join(CONFIG_FILE);
            if candidate.exists() {
                return Self::load_from_file(&candidate).map(Some);
            }
            dir = d.parent();
        }
        Ok(None)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate_anyhow()?;
        Ok(config)
    }

    /// `anyhow`-flavored validation for CLI call sites that already
    /// propagate with `.context(...)` (§7 expansion: library code
    /// returns `ClassifiedError`, orchestration glue uses `anyhow`).
    fn validate_anyhow(&self) -> Result<()> {
        self.validate().map_err(|e| anyhow::anyhow!("{e}"))
    }

    /// Validate the loaded configuration, returning a `validation`
    /// classified error on the first problem found (§4.8 "invalid
    /// schedules are rejected with `validation/invalid cron`").
    pub fn validate(&self) -> Result<(), ClassifiedError> {
        let validation_err = |message: String| {
            ClassifiedError::builder(Category::Validation, message).severity(Severity::Error).build()
        };

        if let Some(schedule) = &self.sync.schedule {
            schedule
                .parse::<cron::Schedule>()
                .map_err(|e| validation_err(format!("invalid cron: {schedule:?}: {e}")))?;
        }

        if self.daemon.queue_size == 0 {
            return Err(validation_err("daemon.queue_size must be greater than 0".to_string()));
        }
        if self.daemon.concurrent_builds == 0 {
            return Err(validation_err("daemon.concurrent_builds must be greater than 0".to_string()));
        }
        if self.sync.git_concurrency == 0 {
            return Err(validation_err("sync.git_concurrency must be greater than 0".to_string()));
        }

        let ports: [(&str, u16); 3] = [
            ("docs", self.http.docs_port),
            ("webhook", self.http.webhook_port),
            ("admin", self.http.admin_port),
        ];
        for i in 0..ports.len() {
            for j in (i + 1)..ports.len() {
                let (name_a, port_a) = ports[i];
                let (name_b, port_b) = ports[j];
                if port_a == port_b {
                    return Err(validation_err(format!(
                        "http.{name_a}_port and http.{name_b}_port must not both be {port_a}"
                    )));
                }
            }
        }

        for repo in &self.repositories {
            if repo.name.is_empty() {
                return Err(validation_err("repositories[].name must not be empty".to_string()));
            }
            if repo.url.is_empty() {
                return Err(validation_err(format!("repositories[{}].url must not be empty", repo.name)));
            }
        }

        let mut seen_repo_names = std::collections::BTreeSet::new();
        for repo in &self.repositories {
            if !seen_repo_names.insert(&repo.name) {
                return Err(validation_err(format!("duplicate repository name: {}", repo.name)));
            }
        }

        Ok(())
    }

    /// Merge CLI overrides into a lightweight [`RuntimeConfig`] the CLI
    /// entrypoints and orchestrator construct from: `Option` fields take
    /// the CLI value when present, else the config value; `bool` flags
    /// are OR'd (§6 expansion).
    pub fn merge(&self, cli: CliOverrides) -> RuntimeConfig {
        RuntimeConfig {
            output_dir: cli.output_dir.unwrap_or_else(|| self.build.output_dir.clone()),
            incremental: cli.incremental || self.sync.incremental,
            render_mode: cli.render_mode.unwrap_or(self.build.render_mode),
            repo_filter: cli.repo_filter,
            data_dir: cli.data_dir.unwrap_or_else(|| self.data_dir.clone()),
            docs_dir: cli.docs_dir,
            theme: cli.theme.unwrap_or_else(|| self.build.theme.clone()),
            title: cli.title.unwrap_or_else(|| self.build.title.clone()),
            base_url: cli.base_url.unwrap_or_else(|| self.build.base_url.clone()),
            preview_port: cli.preview_port.unwrap_or(self.http.docs_port),
            force: cli.force,
            render: cli.render || !matches!(self.build.render_mode, RenderMode::Never),
        }
    }
}

/// CLI-captured overrides for merging with a loaded [`Config`] (§6 CLI
/// surface). `Option<T>` is `None` when the user did not pass the flag.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub output_dir: Option<PathBuf>,
    pub incremental: bool,
    pub render_mode: Option<RenderMode>,
    pub repo_filter: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub docs_dir: Option<PathBuf>,
    pub theme: Option<String>,
    pub title: Option<String>,
    pub base_url: Option<String>,
    pub preview_port: Option<u16>,
    pub force: bool,
    pub render: bool,
}

/// The merged configuration actually threaded through a single CLI
/// invocation or orchestrator startup (§6 expansion, the
/// `RuntimeOptions`-equivalent this crate produces).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub output_dir: PathBuf,
    pub incremental: bool,
    pub render_mode: RenderMode,
    pub repo_filter: Option<String>,
    pub data_dir: PathBuf,
    pub docs_dir: Option<PathBuf>,
    pub theme: String,
    pub title: String,
    pub base_url: String,
    pub preview_port: u16,
    pub force: bool,
    pub render: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_validates() {
        Config::default().validate().expect("default config is valid");
    }

    #[test]
    fn duplicate_port_rejected() {
        let mut config = Config::default();
        config.http.webhook_port = config.http.docs_port;
        let err = config.validate().unwrap_err();
        assert_eq!(err.category, Category::Validation);
    }

    #[test]
    fn invalid_cron_rejected() {
        let mut config = Config::default();
        config.sync.schedule = Some("not a cron expression".to_string());
        let err = config.validate().unwrap_err();
        assert_eq!(err.category, Category::Validation);
        assert!(err.message.contains("invalid cron"));
    }

    #[test]
    fn valid_cron_accepted() {
        let mut config = Config::default();
        config.sync.schedule = Some("0 0 * * * *".to_string());
        config.validate().expect("valid 6-field cron");
    }

    #[test]
    fn duplicate_repository_name_rejected() {
        let mut config = Config::default();
        config.repositories.push(RepositoryConfig {
            name: "docs".into(),
            url: "https://example.com/a.git".into(),
            branch: None,
            is_tag: false,
            paths: vec![],
            auth: None,
            versions: vec![],
            default_version: None,
        });
        config.repositories.push(RepositoryConfig {
            name: "docs".into(),
            url: "https://example.com/b.git".into(),
            branch: None,
            is_tag: false,
            paths: vec![],
            auth: None,
            versions: vec![],
            default_version: None,
        });
        let err = config.validate().unwrap_err();
        assert!(err.message.contains("duplicate repository name"));
    }

    #[test]
    fn load_from_file_round_trips_toml() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(".docbuilder.toml");
        std::fs::write(
            &path,
            r#"
            data_dir = ".docbuilder"

            [[repositories]]
            name = "docs"
            url = "https://example.com/docs.git"
            "#,
        )
        .expect("write");
        let config = Config::load_from_file(&path).expect("load");
        assert_eq!(config.repositories.len(), 1);
        assert_eq!(config.repositories[0].name, "docs");
    }

    #[test]
    fn load_from_workspace_searches_upward() {
        let td = tempdir().expect("tempdir");
        std::fs::write(td.path().join(".docbuilder.toml"), "data_dir = \".docbuilder\"\n").expect("write");
        let nested = td.path().join("a/b/c");
        std::fs::create_dir_all(&nested).expect("mkdir");
        let found = Config::load_from_workspace(&nested).expect("search").expect("found");
        assert_eq!(found.data_dir, PathBuf::from(".docbuilder"));
    }

    #[test]
    fn load_from_workspace_returns_none_when_absent() {
        let td = tempdir().expect("tempdir");
        let result = Config::load_from_workspace(td.path()).expect("search");
        assert!(result.is_none());
    }

    #[test]
    fn cli_overrides_take_precedence_over_config() {
        let config = Config::default();
        let cli = CliOverrides {
            theme: Some("custom-theme".into()),
            ..Default::default()
        };
        let merged = config.merge(cli);
        assert_eq!(merged.theme, "custom-theme");
    }

    #[test]
    fn bool_overrides_are_ored_never_turned_off() {
        let mut config = Config::default();
        config.sync.incremental = false;
        let merged = config.merge(CliOverrides { incremental: true, ..Default::default() });
        assert!(merged.incremental);

        config.sync.incremental = true;
        let merged = config.merge(CliOverrides::default());
        assert!(merged.incremental);
    }

    #[test]
    fn default_state_home_is_never_empty() {
        assert!(!default_state_home().as_os_str().is_empty());
    }

    #[test]
    fn merge_falls_back_to_config_when_cli_is_none() {
        let config = Config::default();
        let merged = config.merge(CliOverrides::default());
        assert_eq!(merged.theme, config.build.theme);
        assert_eq!(merged.base_url, config.build.base_url);
    }
}
