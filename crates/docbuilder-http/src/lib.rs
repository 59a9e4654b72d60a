//! HTTP surface (C9, §4.9).
//!
//! Three listeners — docs, webhook, admin — plus an optional fourth
//! (livereload) share a common middleware chain and are bound to their
//! ports up front: if any bind fails, the already-bound listeners are
//! dropped and a single combined error is returned, rather than the
//! daemon limping along with a partially-started HTTP surface.

pub mod admin;
pub mod daemon_handle;
pub mod docs;
pub mod livereload;
pub mod middleware;
pub mod webhook;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use docbuilder_types::{Category, ClassifiedError};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use daemon_handle::{DaemonHandle, DaemonStatusSnapshot, LastBuildSummary, MetricsSnapshot, RepositoryStatus, SystemMetrics};
pub use livereload::LivereloadHub;
pub use webhook::WebhookForgeHandle;

/// Ports/addresses for each listener (§6 `HttpConfig`, expanded to
/// concrete addresses by the caller).
pub struct HttpServersConfig {
    pub docs_addr: SocketAddr,
    pub webhook_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub livereload_addr: Option<SocketAddr>,
}

/// Bound, ready-to-serve listeners plus the routers to run on them.
pub struct HttpServers {
    docs: (TcpListener, axum::Router),
    webhook: (TcpListener, axum::Router),
    admin: (TcpListener, axum::Router),
    livereload: Option<(TcpListener, axum::Router)>,
    pub livereload_hub: LivereloadHub,
}

impl HttpServers {
    /// Bind every configured listener up front (§4.9). Any failure is
    /// reported as one combined `ClassifiedError`; successfully bound
    /// sockets are simply dropped (closing them) rather than served.
    pub async fn bind(
        config: HttpServersConfig,
        site_dir: PathBuf,
        daemon: Arc<dyn DaemonHandle>,
        webhook_handles: Vec<WebhookForgeHandle>,
    ) -> Result<Self, ClassifiedError> {
        let docs_result = try_bind(config.docs_addr).await;
        let webhook_result = try_bind(config.webhook_addr).await;
        let admin_result = try_bind(config.admin_addr).await;
        let livereload_result = match config.livereload_addr {
            Some(addr) => Some(try_bind(addr).await),
            None => None,
        };

        let mut errors = Vec::new();
        if let Err(e) = &docs_result {
            errors.push(format!("docs listener on {}: {e}", config.docs_addr));
        }
        if let Err(e) = &webhook_result {
            errors.push(format!("webhook listener on {}: {e}", config.webhook_addr));
        }
        if let Err(e) = &admin_result {
            errors.push(format!("admin listener on {}: {e}", config.admin_addr));
        }
        if let Some(Err(e)) = &livereload_result {
            errors.push(format!(
                "livereload listener on {}: {e}",
                config.livereload_addr.expect("livereload_result is Some only when livereload_addr is Some")
            ));
        }
        if !errors.is_empty() {
            return Err(ClassifiedError::builder(Category::Daemon, format!("daemon/http startup failed: {}", errors.join("; "))).build());
        }

        let livereload_hub = LivereloadHub::new();
        let livereload_port = config.livereload_addr.map(|a| a.port());

        let docs_router = middleware::with_common_layers(docs::router(site_dir, livereload_port));
        let webhook_router = middleware::with_common_layers(webhook::router(webhook_handles, daemon.clone()));
        let admin_router = middleware::with_common_layers(admin::router(daemon));
        let livereload_router = livereload_result
            .map(|r| r.expect("checked above"))
            .map(|listener| (listener, middleware::with_common_layers(livereload::router(livereload_hub.clone()))));

        Ok(HttpServers {
            docs: (docs_result.expect("checked above"), docs_router),
            webhook: (webhook_result.expect("checked above"), webhook_router),
            admin: (admin_result.expect("checked above"), admin_router),
            livereload: livereload_router,
            livereload_hub,
        })
    }

    /// Serve every listener until `cancel` trips, then shut each down
    /// gracefully. Returns once all listeners have stopped.
    pub async fn serve(self, cancel: CancellationToken) -> Result<(), ClassifiedError> {
        let mut tasks = tokio::task::JoinSet::new();
        spawn_listener(&mut tasks, "docs", self.docs, cancel.clone());
        spawn_listener(&mut tasks, "webhook", self.webhook, cancel.clone());
        spawn_listener(&mut tasks, "admin", self.admin, cancel.clone());
        if let Some(livereload) = self.livereload {
            spawn_listener(&mut tasks, "livereload", livereload, cancel.clone());
        }

        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(e),
                Err(join_err) => errors.push(format!("listener task panicked: {join_err}")),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ClassifiedError::builder(Category::Runtime, format!("http shutdown reported errors: {}", errors.join("; "))).build())
        }
    }
}

async fn try_bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

fn spawn_listener(tasks: &mut tokio::task::JoinSet<Result<(), String>>, label: &'static str, (listener, router): (TcpListener, axum::Router), cancel: CancellationToken) {
    tasks.spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| format!("{label}: {e}"))
    });
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use async_trait::async_trait;

    use super::*;

    struct StubDaemon;

    #[async_trait]
    impl DaemonHandle for StubDaemon {
        fn version(&self) -> &str {
            "0.0.0-test"
        }
        fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
            chrono::Utc::now()
        }
        fn config_file(&self) -> Option<String> {
            None
        }
        fn sanitized_config(&self) -> serde_json::Value {
            serde_json::json!({})
        }
        async fn status(&self) -> DaemonStatusSnapshot {
            DaemonStatusSnapshot {
                status: "running".into(),
                version: "0.0.0-test".into(),
                uptime_seconds: 0,
                config_file: None,
                queue_length: 0,
                active_jobs: 0,
                last_build: None,
                repositories: Vec::new(),
                system: SystemMetrics {
                    memory_bytes: 0,
                    worker_count: 0,
                    workspace_size_bytes: 0,
                },
            }
        }
        async fn trigger_webhook_build(&self, _full_name: &str, _branch: Option<String>) -> Result<Option<String>, ClassifiedError> {
            Ok(None)
        }
        async fn trigger_manual_build(&self) -> Result<String, ClassifiedError> {
            Ok("job-1".into())
        }
        async fn trigger_discover(&self) -> Result<(), ClassifiedError> {
            Ok(())
        }
        async fn metrics(&self) -> MetricsSnapshot {
            MetricsSnapshot {
                http_requests_total: 0,
                active_jobs: 0,
                last_discovery_duration_ms: None,
                last_build_duration_ms: None,
                repositories_total: 0,
            }
        }
    }

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test]
    async fn bind_fails_combined_when_one_port_is_taken() {
        let blocker = TcpListener::bind(loopback(0)).await.unwrap();
        let taken_port = blocker.local_addr().unwrap().port();

        let config = HttpServersConfig {
            docs_addr: loopback(0),
            webhook_addr: loopback(taken_port),
            admin_addr: loopback(0),
            livereload_addr: None,
        };
        let dir = tempfile::tempdir().unwrap();
        let result = HttpServers::bind(config, dir.path().to_path_buf(), Arc::new(StubDaemon), Vec::new()).await;
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.message.contains("webhook"));
    }

    #[tokio::test]
    async fn bind_succeeds_on_free_ports() {
        let config = HttpServersConfig {
            docs_addr: loopback(0),
            webhook_addr: loopback(0),
            admin_addr: loopback(0),
            livereload_addr: None,
        };
        let dir = tempfile::tempdir().unwrap();
        let servers = HttpServers::bind(config, dir.path().to_path_buf(), Arc::new(StubDaemon), Vec::new()).await;
        assert!(servers.is_ok());
    }
}
