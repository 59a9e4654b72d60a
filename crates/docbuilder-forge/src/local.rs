//! Local filesystem forge: repositories that already exist on disk, with
//! no forge API behind them. Supports `list_repositories` only, scanning
//! `scopes` as directory paths rather than organization names (§6).

use std::path::PathBuf;

use async_trait::async_trait;
use docbuilder_types::Repository;

use crate::{ForgeClient, RemoteRepository, WebhookEvent, unsupported};

pub struct LocalClient {
    root: PathBuf,
}

impl LocalClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ForgeClient for LocalClient {
    fn name(&self) -> &str {
        "local"
    }

    async fn list_repositories(&self, scopes: &[String]) -> Result<Vec<RemoteRepository>, docbuilder_types::ClassifiedError> {
        let dirs: Vec<PathBuf> = if scopes.is_empty() {
            vec![self.root.clone()]
        } else {
            scopes.iter().map(|s| self.root.join(s)).collect()
        };

        let mut repos = Vec::new();
        for dir in dirs {
            let entries = std::fs::read_dir(&dir).map_err(|e| {
                docbuilder_types::ClassifiedError::builder(
                    docbuilder_types::Category::Filesystem,
                    format!("could not read local forge directory {}: {e}", dir.display()),
                )
                .build()
            })?;
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.join(".git").exists() {
                    continue;
                }
                let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                repos.push(RemoteRepository {
                    full_name: name,
                    clone_url: path.to_string_lossy().to_string(),
                    default_branch: "main".to_string(),
                    description: None,
                    topics: Vec::new(),
                    archived: false,
                });
            }
        }
        Ok(repos)
    }

    async fn list_organizations(&self) -> Result<Vec<String>, docbuilder_types::ClassifiedError> {
        Err(unsupported("local", "list_organizations"))
    }

    async fn get_repository(&self, _owner: &str, _name: &str) -> Result<RemoteRepository, docbuilder_types::ClassifiedError> {
        Err(unsupported("local", "get_repository"))
    }

    fn validate_webhook(&self, _body: &[u8], _signature: &str, _secret: &str) -> bool {
        false
    }

    fn parse_webhook_event(&self, _body: &[u8], _event_type: &str) -> Result<WebhookEvent, docbuilder_types::ClassifiedError> {
        Err(unsupported("local", "parse_webhook_event"))
    }

    fn get_edit_url(&self, repo: &Repository, path: &str, _branch: &str) -> String {
        format!("file://{}/{}", repo.url.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_edit_url_uses_file_scheme() {
        let client = LocalClient::new("/tmp");
        let repo = Repository {
            name: "docs".into(),
            url: "/home/acme/docs".into(),
            branch: None,
            is_tag: false,
            paths: vec![],
            auth: None,
            tags: Default::default(),
            version: None,
            is_versioned: false,
        };
        assert_eq!(client.get_edit_url(&repo, "README.md", "main"), "file:///home/acme/docs/README.md");
    }

    #[tokio::test]
    async fn list_repositories_finds_git_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("docs-repo/.git")).unwrap();
        std::fs::create_dir_all(tmp.path().join("not-a-repo")).unwrap();
        let client = LocalClient::new(tmp.path());
        let repos = client.list_repositories(&[]).await.unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].full_name, "docs-repo");
    }

    #[tokio::test]
    async fn list_organizations_is_unsupported() {
        let client = LocalClient::new("/tmp");
        assert!(client.list_organizations().await.is_err());
    }
}
