//! Discovery service (C7, §4.7).
//!
//! Drives one [`ForgeClient`](docbuilder_forge::ForgeClient) per configured
//! forge concurrently, applies [`FilteringConfig`](docbuilder_config::FilteringConfig),
//! and converts whatever survives into [`Repository`] entities ready for a
//! build. A failure talking to one forge never aborts discovery for the
//! others — it is recorded in [`DiscoveryResult::errors`] instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use docbuilder_config::FilteringConfig;
use docbuilder_forge::{ForgeClient, RemoteRepository};
use docbuilder_types::{AuthConfig, Repository};

/// One configured forge, bound to its client and the scopes discovery
/// should enumerate within it.
pub struct ForgeHandle {
    pub name: String,
    pub client: Arc<dyn ForgeClient>,
    pub scopes: Vec<String>,
    pub token: Option<String>,
}

/// Aggregate discovery outcome (§4.7): repositories that survived
/// filtering, plus a per-forge error map for anything that failed
/// outright (auth failure, network error, rate limit).
#[derive(Debug, Default)]
pub struct DiscoveryResult {
    pub repositories: Vec<Repository>,
    pub errors: BTreeMap<String, String>,
}

pub struct DiscoveryService {
    forges: Vec<ForgeHandle>,
    filtering: FilteringConfig,
}

impl DiscoveryService {
    pub fn new(forges: Vec<ForgeHandle>, filtering: FilteringConfig) -> Self {
        Self { forges, filtering }
    }

    /// Enumerate every configured forge concurrently and merge results.
    pub async fn discover(&self) -> DiscoveryResult {
        let mut set = tokio::task::JoinSet::new();
        for handle in &self.forges {
            let client = handle.client.clone();
            let scopes = handle.scopes.clone();
            let name = handle.name.clone();
            let token = handle.token.clone();
            set.spawn(async move {
                let outcome = client.list_repositories(&scopes).await;
                (name, token, outcome)
            });
        }

        let mut result = DiscoveryResult::default();
        while let Some(joined) = set.join_next().await {
            let (name, token, outcome) = match joined {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "discovery task panicked");
                    continue;
                }
            };
            match outcome {
                Ok(remotes) => {
                    for remote in remotes {
                        if self.passes_filters(&remote) {
                            result.repositories.push(to_repository(remote, &name, token.as_deref()));
                        }
                    }
                }
                Err(e) => {
                    result.errors.insert(name, e.to_string());
                }
            }
        }
        result.repositories.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }

    /// `true` iff `remote` should be kept (§4.7): none of the exclude
    /// patterns match, at least one include pattern matches (default
    /// `*`), and it is not archived. `required_paths` is checked
    /// best-effort only here — the git sync layer performs the
    /// authoritative check once the repository is actually cloned.
    fn passes_filters(&self, remote: &RemoteRepository) -> bool {
        if remote.archived {
            return false;
        }
        let excluded = self
            .filtering
            .exclude_patterns
            .iter()
            .any(|p| glob_matches(p, &remote.full_name));
        if excluded {
            return false;
        }
        if self.filtering.include_patterns.is_empty() {
            return true;
        }
        self.filtering
            .include_patterns
            .iter()
            .any(|p| glob_matches(p, &remote.full_name))
    }
}

fn glob_matches(pattern: &str, candidate: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(candidate))
        .unwrap_or(false)
}

fn to_repository(remote: RemoteRepository, forge_name: &str, token: Option<&str>) -> Repository {
    let name = remote
        .full_name
        .rsplit('/')
        .next()
        .unwrap_or(&remote.full_name)
        .to_string();
    let auth = token.map(|t| AuthConfig::Token { token: t.to_string() });
    let mut tags = BTreeMap::new();
    tags.insert("forge".to_string(), forge_name.to_string());
    if let Some(description) = remote.description {
        tags.insert("description".to_string(), description);
    }
    Repository {
        name,
        url: remote.clone_url,
        branch: Some(remote.default_branch),
        is_tag: false,
        paths: Vec::new(),
        auth,
        tags,
        version: None,
        is_versioned: false,
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use docbuilder_forge::WebhookEvent;
    use docbuilder_types::ClassifiedError;

    use super::*;

    struct StubForge {
        repos: Vec<RemoteRepository>,
        fail: bool,
    }

    #[async_trait]
    impl ForgeClient for StubForge {
        fn name(&self) -> &str {
            "stub"
        }

        async fn list_repositories(&self, _scopes: &[String]) -> Result<Vec<RemoteRepository>, ClassifiedError> {
            if self.fail {
                return Err(ClassifiedError::builder(docbuilder_types::Category::Forge, "boom").build());
            }
            Ok(self.repos.clone())
        }

        async fn list_organizations(&self) -> Result<Vec<String>, ClassifiedError> {
            Ok(Vec::new())
        }

        async fn get_repository(&self, _owner: &str, _name: &str) -> Result<RemoteRepository, ClassifiedError> {
            unimplemented!()
        }

        fn validate_webhook(&self, _body: &[u8], _signature: &str, _secret: &str) -> bool {
            false
        }

        fn parse_webhook_event(&self, _body: &[u8], _event_type: &str) -> Result<WebhookEvent, ClassifiedError> {
            unimplemented!()
        }

        fn get_edit_url(&self, _repo: &Repository, _path: &str, _branch: &str) -> String {
            String::new()
        }
    }

    fn remote(full_name: &str, archived: bool) -> RemoteRepository {
        RemoteRepository {
            full_name: full_name.to_string(),
            clone_url: format!("https://example.com/{full_name}.git"),
            default_branch: "main".to_string(),
            description: None,
            topics: Vec::new(),
            archived,
        }
    }

    #[tokio::test]
    async fn discover_converts_and_sorts_repositories() {
        let forge = ForgeHandle {
            name: "acme".to_string(),
            client: Arc::new(StubForge {
                repos: vec![remote("acme/zeta", false), remote("acme/alpha", false)],
                fail: false,
            }),
            scopes: Vec::new(),
            token: None,
        };
        let service = DiscoveryService::new(vec![forge], FilteringConfig::default());
        let result = service.discover().await;
        assert!(result.errors.is_empty());
        assert_eq!(result.repositories.len(), 2);
        assert_eq!(result.repositories[0].name, "alpha");
        assert_eq!(result.repositories[1].name, "zeta");
    }

    #[tokio::test]
    async fn discover_records_per_forge_errors_without_aborting_others() {
        let failing = ForgeHandle {
            name: "broken".to_string(),
            client: Arc::new(StubForge { repos: Vec::new(), fail: true }),
            scopes: Vec::new(),
            token: None,
        };
        let ok = ForgeHandle {
            name: "acme".to_string(),
            client: Arc::new(StubForge {
                repos: vec![remote("acme/docs", false)],
                fail: false,
            }),
            scopes: Vec::new(),
            token: None,
        };
        let service = DiscoveryService::new(vec![failing, ok], FilteringConfig::default());
        let result = service.discover().await;
        assert_eq!(result.repositories.len(), 1);
        assert_eq!(result.errors.get("broken").map(String::as_str), Some("Forge: boom"));
    }

    #[tokio::test]
    async fn archived_repositories_are_excluded() {
        let forge = ForgeHandle {
            name: "acme".to_string(),
            client: Arc::new(StubForge {
                repos: vec![remote("acme/docs", true)],
                fail: false,
            }),
            scopes: Vec::new(),
            token: None,
        };
        let service = DiscoveryService::new(vec![forge], FilteringConfig::default());
        let result = service.discover().await;
        assert!(result.repositories.is_empty());
    }

    #[tokio::test]
    async fn exclude_pattern_wins_over_include() {
        let forge = ForgeHandle {
            name: "acme".to_string(),
            client: Arc::new(StubForge {
                repos: vec![remote("acme/internal-tools", false)],
                fail: false,
            }),
            scopes: Vec::new(),
            token: None,
        };
        let filtering = FilteringConfig {
            exclude_patterns: vec!["*internal*".to_string()],
            ..FilteringConfig::default()
        };
        let service = DiscoveryService::new(vec![forge], filtering);
        let result = service.discover().await;
        assert!(result.repositories.is_empty());
    }
}
