//! CLI adapter for DocBuilder (§6 CLI surface).
//!
//! Six subcommands sit on top of the orchestration core: `build` and
//! `discover` run a single pass of the pipeline the daemon runs on a
//! schedule; `daemon` starts the long-running orchestrator with its full
//! HTTP surface; `init` scaffolds a starter config; `preview` serves an
//! already-generated site; `generate` runs the transform+site-generator
//! tail of the pipeline directly against a docs directory, with no git or
//! discovery involved. Exit codes come from
//! [`docbuilder_types::ClassifiedError::cli_exit_code`].

mod progress;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use docbuilder_config::{CliOverrides, Config, RenderMode};
use docbuilder_types::ClassifiedError;

#[derive(Parser, Debug)]
#[command(name = "docbuilder", version, about = "Documentation aggregation daemon: discover, sync, build and serve unified docs sites")]
struct Cli {
    /// Path to `.docbuilder.toml`. Searched upward from the current
    /// directory when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single sync+build pass over the configured repositories.
    Build {
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        incremental: bool,
        #[arg(long, value_enum)]
        render_mode: Option<RenderModeArg>,
        /// Restrict the build to one configured repository.
        #[arg(short = 'r', long = "repo")]
        repo: Option<String>,
    },
    /// Enumerate repositories across configured forges.
    Discover {
        /// Restrict output to one repository, matched by name or URL suffix.
        #[arg(short, long = "repo")]
        repo: Option<String>,
    },
    /// Start the long-running orchestrator: scheduler, webhooks, HTTP surface.
    Daemon {
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
    /// Scaffold a starter `.docbuilder.toml`.
    Init {
        #[arg(long)]
        force: bool,
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Serve an already-generated site directory.
    Preview {
        #[arg(long)]
        docs_dir: PathBuf,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Transform and render a docs directory directly, with no git sync.
    Generate {
        #[arg(long)]
        docs_dir: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = "default")]
        theme: String,
        #[arg(long, default_value = "Documentation")]
        title: String,
        #[arg(long, default_value = "http://localhost:8080")]
        base_url: String,
        #[arg(long)]
        render: bool,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum RenderModeArg {
    Auto,
    Always,
    Never,
}

impl From<RenderModeArg> for RenderMode {
    fn from(value: RenderModeArg) -> Self {
        match value {
            RenderModeArg::Auto => RenderMode::Auto,
            RenderModeArg::Always => RenderMode::Always,
            RenderModeArg::Never => RenderMode::Never,
        }
    }
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to start tokio runtime");

    match runtime.block_on(run()) {
        Ok(()) => std::process::ExitCode::from(0),
        Err(err) => {
            report_error(&err);
            std::process::ExitCode::from(exit_code_for(&err) as u8)
        }
    }
}

/// Maps an error to a CLI exit code (§4.1): a `ClassifiedError` uses its
/// own mapping; anything else is a generic failure.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<ClassifiedError>().map(|e| e.cli_exit_code()).unwrap_or(1)
}

/// Prints a user-facing message for the error (§7): user-facing
/// categories (`config`/`validation`/`auth`) print just the message;
/// everything else is prefixed with its category.
fn report_error(err: &anyhow::Error) {
    if let Some(classified) = err.downcast_ref::<ClassifiedError>() {
        if classified.is_user_facing() {
            eprintln!("error: {}", classified.message);
        } else {
            eprintln!("error: {:?}: {}", classified.category, classified.message);
        }
    } else {
        eprintln!("error: {err:#}");
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Build { output, incremental, render_mode, repo } => {
            let runtime = config.merge(CliOverrides {
                output_dir: output,
                incremental,
                render_mode: render_mode.map(Into::into),
                repo_filter: repo,
                ..Default::default()
            });
            commands::build(config, runtime).await
        }
        Commands::Discover { repo } => commands::discover(config, repo).await,
        Commands::Daemon { data_dir } => {
            let runtime = config.merge(CliOverrides { data_dir, ..Default::default() });
            commands::daemon(config, runtime).await
        }
        Commands::Init { force, output } => commands::init(force, &output),
        Commands::Preview { docs_dir, port } => commands::preview(&docs_dir, port).await,
        Commands::Generate { docs_dir, output, theme, title, base_url, render } => {
            commands::generate(&docs_dir, &output, &theme, &title, &base_url, render).await
        }
    }
}

/// Loads `.docbuilder.toml` from an explicit `--config` path, or searches
/// upward from the current directory; falls back to [`Config::default`]
/// when neither finds one (every field has a default).
fn load_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return Config::load_from_file(path).with_context(|| format!("loading {}", path.display()));
    }
    let cwd = std::env::current_dir().context("reading current directory")?;
    Ok(Config::load_from_workspace(&cwd)?.unwrap_or_default())
}

fn bind_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

mod commands {
    use super::*;
    use docbuilder_cache::CacheStore;
    use docbuilder_config::RuntimeConfig;
    use docbuilder_daemon::Daemon;
    use docbuilder_daemon::build_forge_client;
    use docbuilder_daemon::collaborators::{HugoSiteGenerator, PassthroughTransformPipeline, SiteGenerator, TransformPipeline};
    use docbuilder_daemon::versioning::expand_repository_versions;
    use docbuilder_daemon::worker::{self, RepoLocks, WorkerContext};
    use docbuilder_discovery::{DiscoveryService, ForgeHandle};
    use docbuilder_git::RetryingGitClient;
    use docbuilder_http::HttpServersConfig;
    use docbuilder_store::{BuildHistoryProjection, EventStore};
    use docbuilder_types::{Category, Job, JobKind, JobState, Severity};
    use tokio_util::sync::CancellationToken;
    use tracing::info;

    use crate::progress::ProgressReporter;
    use crate::{ClassifiedError, bind_addr};

    /// `docbuilder build`: constructs the same [`WorkerContext`] the
    /// daemon's worker pool uses and runs [`worker::process_job`] once
    /// for a synthetic CLI-originated job, so a one-shot build takes the
    /// identical nine-step pipeline a scheduled build does.
    pub async fn build(config: Config, runtime: RuntimeConfig) -> Result<()> {
        std::fs::create_dir_all(&runtime.data_dir).with_context(|| format!("creating data dir {}", runtime.data_dir.display()))?;
        let store = Arc::new(EventStore::open(&runtime.data_dir.join("events.sqlite")).await.map_err(anyhow::Error::from)?);
        let projection = Arc::new(BuildHistoryProjection::new(config.daemon.history_size));
        projection.rebuild(&store).await.map_err(anyhow::Error::from)?;

        let repositories = expand_repository_versions(&config.repositories);
        let mut reporter = ProgressReporter::new(repositories.len());
        for (i, repo) in repositories.iter().enumerate() {
            reporter.set_repo(i + 1, &repo.name);
            reporter.finish_repo();
        }

        let ctx = WorkerContext {
            config: Arc::new(arc_swap::ArcSwap::from_pointee(config.clone())),
            repositories: Arc::new(arc_swap::ArcSwap::from_pointee(repositories)),
            git: Arc::new(RetryingGitClient::new(config.sync.backoff.clone())),
            repo_locks: Arc::new(RepoLocks::new()),
            store: store.clone(),
            projection,
            cache: Arc::new(CacheStore::new(runtime.data_dir.join("cache"))),
            transforms: Arc::new(PassthroughTransformPipeline) as Arc<dyn TransformPipeline>,
            site_generator: Arc::new(HugoSiteGenerator) as Arc<dyn SiteGenerator>,
            livereload: Arc::new(|| {}),
            workspace_root: runtime.data_dir.join("workspace"),
            site_root: runtime.output_dir.clone(),
            concurrent_builds: config.daemon.concurrent_builds,
        };

        let job = Job {
            id: 0,
            kind: JobKind::Build,
            priority: 0,
            repo: runtime.repo_filter,
            branch: None,
            reason: "cli".to_string(),
            enqueued_at: chrono::Utc::now(),
            state: JobState::Running,
        };

        worker::process_job(&job, &ctx).await.map_err(anyhow::Error::from)?;
        reporter.finish();
        store.close().await;
        Ok(())
    }

    /// `docbuilder discover`: enumerates every `auto_discover` forge and
    /// prints the merged, filtered result as JSON (§4.7).
    pub async fn discover(config: Config, repo_filter: Option<String>) -> Result<()> {
        let forges: Vec<ForgeHandle> = config
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

        let service = DiscoveryService::new(forges, config.filtering.clone());
        let result = service.discover().await;

        let repositories: Vec<_> = result
            .repositories
            .into_iter()
            .filter(|r| repo_filter.as_deref().is_none_or(|name| r.name == name || r.url.ends_with(name)))
            .collect();

        for (forge, err) in &result.errors {
            eprintln!("warning: discovery failed for forge {forge}: {err}");
        }

        println!("{}", serde_json::to_string_pretty(&repositories).context("encoding discovery result")?);
        Ok(())
    }

    /// `docbuilder daemon`: the long-running orchestrator. Runs until
    /// `Ctrl-C`, then shuts down through the daemon's own 30-second grace
    /// window (§5).
    pub async fn daemon(mut config: Config, runtime: RuntimeConfig) -> Result<()> {
        config.data_dir = runtime.data_dir.clone();
        config.validate().map_err(anyhow::Error::from)?;

        let daemon = Daemon::new(config.clone(), cli_config_path()).await.map_err(anyhow::Error::from)?;
        info!(data_dir = %runtime.data_dir.display(), "starting docbuilder daemon");

        let http = HttpServersConfig {
            docs_addr: bind_addr(config.http.docs_port),
            webhook_addr: bind_addr(config.http.webhook_port),
            admin_addr: bind_addr(config.http.admin_port),
            livereload_addr: config.http.livereload.as_ref().map(|l| bind_addr(l.port)),
        };

        let shutdown = CancellationToken::new();
        let shutdown_handle = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received ctrl-c, shutting down");
            shutdown_handle.cancel();
        });

        daemon.start(http, runtime.output_dir.clone(), shutdown).await.map_err(anyhow::Error::from)?;
        Ok(())
    }

    fn cli_config_path() -> Option<String> {
        std::env::current_dir().ok().map(|d| d.join(docbuilder_config::CONFIG_FILE).display().to_string())
    }

    /// `docbuilder init`: writes a starter `.docbuilder.toml` with every
    /// field at its default, refusing to clobber an existing file unless
    /// `--force` is passed.
    pub fn init(force: bool, output_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(output_dir).with_context(|| format!("creating {}", output_dir.display()))?;
        let path = output_dir.join(docbuilder_config::CONFIG_FILE);
        if path.exists() && !force {
            bail!(ClassifiedError::builder(Category::AlreadyExists, format!("{} already exists; pass --force to overwrite", path.display()))
                .severity(Severity::Error)
                .build());
        }
        let toml = toml::to_string_pretty(&Config::default()).context("serializing default config")?;
        std::fs::write(&path, toml).with_context(|| format!("writing {}", path.display()))?;
        println!("wrote {}", path.display());
        Ok(())
    }

    /// `docbuilder preview`: serves an already-generated site directory
    /// with the same docs-listener router the daemon uses, minus
    /// livereload injection.
    pub async fn preview(docs_dir: &Path, port: u16) -> Result<()> {
        if !docs_dir.is_dir() {
            bail!(ClassifiedError::builder(Category::NotFound, format!("{} is not a directory", docs_dir.display())).build());
        }
        let router = docbuilder_http::docs::router(docs_dir.to_path_buf(), None);
        let addr = bind_addr(port);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ClassifiedError::builder(Category::Network, format!("failed to bind {addr}: {e}")).build())?;
        println!("serving {} on http://{}", docs_dir.display(), addr);

        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ClassifiedError::builder(Category::Runtime, format!("preview server error: {e}")).build())?;
        Ok(())
    }

    /// `docbuilder generate`: the transform+render tail of the pipeline,
    /// run directly against `docs_dir` with no git sync or discovery —
    /// the entry point for "I already have the docs checked out, just
    /// render them."
    pub async fn generate(docs_dir: &Path, output: &Path, theme: &str, _title: &str, _base_url: &str, render: bool) -> Result<()> {
        if !docs_dir.is_dir() {
            bail!(ClassifiedError::builder(Category::NotFound, format!("{} is not a directory", docs_dir.display())).build());
        }

        let pipeline = PassthroughTransformPipeline;
        pipeline.apply(docs_dir, &[]).await.map_err(anyhow::Error::from)?;

        if render {
            std::fs::create_dir_all(output).with_context(|| format!("creating {}", output.display()))?;
            let generator = HugoSiteGenerator;
            generator.generate(docs_dir, output, theme).await.map_err(anyhow::Error::from)?;
            println!("generated site at {}", output.display());
        } else {
            println!("skipped rendering; pass --render to invoke the site generator");
        }
        Ok(())
    }
}
