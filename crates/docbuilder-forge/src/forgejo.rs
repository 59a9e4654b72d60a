//! Forgejo/Gitea forge client: REST API v1, GitHub-shaped webhook payloads
//! signed the same way (`X-Hub-Signature-256`).

use async_trait::async_trait;
use docbuilder_types::Repository;
use serde::Deserialize;

use crate::{ForgeClient, RemoteRepository, WebhookEvent, config_err, forge_err};

pub struct ForgejoClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl ForgejoClient {
    /// Forgejo is self-hosted; unlike GitHub/GitLab there is no sensible
    /// default host, so `base_url` is required at construction.
    pub fn new(base_url: String, token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(format!("docbuilder/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client builder with only a user-agent never fails");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            http,
        }
    }

    fn api_url(&self, path: &str) -> Result<String, docbuilder_types::ClassifiedError> {
        if self.base_url.is_empty() {
            return Err(config_err("forgejo forge requires base_url to be configured"));
        }
        Ok(format!("{}/api/v1{path}", self.base_url))
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.http.get(url);
        match &self.token {
            Some(token) => req.header("Authorization", format!("token {token}")),
            None => req,
        }
    }

    async fn fetch<T: for<'de> Deserialize<'de>>(&self, url: String) -> Result<T, docbuilder_types::ClassifiedError> {
        let resp = self
            .request(&url)
            .send()
            .await
            .map_err(|e| forge_err(format!("forgejo request to {url} failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(forge_err(format!("forgejo request to {url} returned {}", resp.status())));
        }
        resp.json::<T>()
            .await
            .map_err(|e| forge_err(format!("forgejo response from {url} did not parse: {e}")))
    }
}

#[derive(Deserialize)]
struct FjRepo {
    full_name: String,
    clone_url: String,
    default_branch: String,
    description: Option<String>,
    #[serde(default)]
    archived: bool,
}

impl From<FjRepo> for RemoteRepository {
    fn from(r: FjRepo) -> Self {
        RemoteRepository {
            full_name: r.full_name,
            clone_url: r.clone_url,
            default_branch: r.default_branch,
            description: r.description,
            topics: Vec::new(),
            archived: r.archived,
        }
    }
}

#[derive(Deserialize)]
struct FjOrg {
    username: String,
}

#[derive(Deserialize)]
struct FjPushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: FjPushRepo,
    #[serde(default)]
    commits: Vec<FjCommit>,
}

#[derive(Deserialize)]
struct FjPushRepo {
    full_name: String,
}

#[derive(Deserialize)]
struct FjCommit {
    id: String,
}

#[async_trait]
impl ForgeClient for ForgejoClient {
    fn name(&self) -> &str {
        "forgejo"
    }

    async fn list_repositories(&self, scopes: &[String]) -> Result<Vec<RemoteRepository>, docbuilder_types::ClassifiedError> {
        if scopes.is_empty() {
            let url = self.api_url("/user/repos?limit=50")?;
            let repos: Vec<FjRepo> = self.fetch(url).await?;
            return Ok(repos.into_iter().map(RemoteRepository::from).collect());
        }
        let mut all = Vec::new();
        for org in scopes {
            let url = self.api_url(&format!("/orgs/{org}/repos?limit=50"))?;
            let repos: Vec<FjRepo> = self.fetch(url).await?;
            all.extend(repos.into_iter().map(RemoteRepository::from));
        }
        Ok(all)
    }

    async fn list_organizations(&self) -> Result<Vec<String>, docbuilder_types::ClassifiedError> {
        let url = self.api_url("/user/orgs?limit=50")?;
        let orgs: Vec<FjOrg> = self.fetch(url).await?;
        Ok(orgs.into_iter().map(|o| o.username).collect())
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<RemoteRepository, docbuilder_types::ClassifiedError> {
        let url = self.api_url(&format!("/repos/{owner}/{name}"))?;
        let repo: FjRepo = self.fetch(url).await?;
        Ok(repo.into())
    }

    fn validate_webhook(&self, body: &[u8], signature: &str, secret: &str) -> bool {
        docbuilder_webhook::verify_sha256_prefixed(secret, body, signature)
    }

    fn parse_webhook_event(&self, body: &[u8], event_type: &str) -> Result<WebhookEvent, docbuilder_types::ClassifiedError> {
        if event_type != "push" {
            return Err(forge_err(format!("forgejo event type {event_type:?} carries no repository/branch")));
        }
        let payload: FjPushPayload =
            serde_json::from_slice(body).map_err(|e| forge_err(format!("forgejo push payload did not parse: {e}")))?;
        let branch = payload.git_ref.strip_prefix("refs/heads/").map(str::to_string);
        Ok(WebhookEvent {
            repository: payload.repository.full_name,
            branch,
            commits: payload.commits.into_iter().map(|c| c.id).collect(),
            metadata: Default::default(),
        })
    }

    fn get_edit_url(&self, repo: &Repository, path: &str, branch: &str) -> String {
        let base = repo.url.trim_end_matches(".git").trim_end_matches('/');
        format!("{base}/_edit/{branch}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_url_requires_base_url() {
        let client = ForgejoClient::new(String::new(), None);
        assert!(client.api_url("/user/repos").is_err());
    }

    #[test]
    fn api_url_trims_trailing_slash_before_joining() {
        let client = ForgejoClient::new("https://git.example.com/".to_string(), None);
        assert_eq!(client.api_url("/user/repos").unwrap(), "https://git.example.com/api/v1/user/repos");
    }

    #[test]
    fn get_edit_url_uses_underscore_edit_convention() {
        let client = ForgejoClient::new("https://git.example.com".to_string(), None);
        let repo = Repository {
            name: "docs".into(),
            url: "https://git.example.com/acme/docs.git".into(),
            branch: None,
            is_tag: false,
            paths: vec![],
            auth: None,
            tags: Default::default(),
            version: None,
            is_versioned: false,
        };
        assert_eq!(
            client.get_edit_url(&repo, "README.md", "main"),
            "https://git.example.com/acme/docs/_edit/main/README.md"
        );
    }

    #[test]
    fn parse_webhook_event_extracts_branch_and_commits() {
        let client = ForgejoClient::new("https://git.example.com".to_string(), None);
        let body = br#"{
            "ref": "refs/heads/main",
            "repository": {"full_name": "acme/docs"},
            "commits": [{"id": "abc123"}]
        }"#;
        let event = client.parse_webhook_event(body, "push").unwrap();
        assert_eq!(event.repository, "acme/docs");
        assert_eq!(event.branch.as_deref(), Some("main"));
    }
}
