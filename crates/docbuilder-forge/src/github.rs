//! GitHub forge client: REST API v3 + `X-Hub-Signature-256` webhooks.

use async_trait::async_trait;
use docbuilder_types::Repository;
use serde::Deserialize;

use crate::{ForgeClient, RemoteRepository, WebhookEvent, forge_err};

const DEFAULT_BASE_URL: &str = "https://api.github.com";

pub struct GithubClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl GithubClient {
    pub fn new(base_url: Option<String>, token: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(format!("docbuilder/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client builder with only a user-agent never fails");
        Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            token,
            http,
        }
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.http.get(url).header("Accept", "application/vnd.github+json");
        match &self.token {
            Some(token) => req.header("Authorization", format!("Bearer {token}")),
            None => req,
        }
    }

    async fn fetch<T: for<'de> Deserialize<'de>>(&self, url: String) -> Result<T, docbuilder_types::ClassifiedError> {
        let resp = self
            .request(&url)
            .send()
            .await
            .map_err(|e| forge_err(format!("github request to {url} failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(forge_err(format!("github request to {url} returned {}", resp.status())));
        }
        resp.json::<T>()
            .await
            .map_err(|e| forge_err(format!("github response from {url} did not parse: {e}")))
    }
}

#[derive(Deserialize)]
struct GhRepo {
    full_name: String,
    clone_url: String,
    default_branch: String,
    description: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    archived: bool,
}

impl From<GhRepo> for RemoteRepository {
    fn from(r: GhRepo) -> Self {
        RemoteRepository {
            full_name: r.full_name,
            clone_url: r.clone_url,
            default_branch: r.default_branch,
            description: r.description,
            topics: r.topics,
            archived: r.archived,
        }
    }
}

#[derive(Deserialize)]
struct GhOrg {
    login: String,
}

#[derive(Deserialize)]
struct GhPushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: GhPushRepo,
    #[serde(default)]
    commits: Vec<GhCommit>,
}

#[derive(Deserialize)]
struct GhPushRepo {
    full_name: String,
}

#[derive(Deserialize)]
struct GhCommit {
    id: String,
}

#[async_trait]
impl ForgeClient for GithubClient {
    fn name(&self) -> &str {
        "github"
    }

    async fn list_repositories(&self, scopes: &[String]) -> Result<Vec<RemoteRepository>, docbuilder_types::ClassifiedError> {
        if scopes.is_empty() {
            let url = format!("{}/user/repos?per_page=100", self.base_url);
            let repos: Vec<GhRepo> = self.fetch(url).await?;
            return Ok(repos.into_iter().map(RemoteRepository::from).collect());
        }
        let mut all = Vec::new();
        for org in scopes {
            let url = format!("{}/orgs/{org}/repos?per_page=100", self.base_url);
            let repos: Vec<GhRepo> = self.fetch(url).await?;
            all.extend(repos.into_iter().map(RemoteRepository::from));
        }
        Ok(all)
    }

    async fn list_organizations(&self) -> Result<Vec<String>, docbuilder_types::ClassifiedError> {
        let url = format!("{}/user/orgs?per_page=100", self.base_url);
        let orgs: Vec<GhOrg> = self.fetch(url).await?;
        Ok(orgs.into_iter().map(|o| o.login).collect())
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<RemoteRepository, docbuilder_types::ClassifiedError> {
        let url = format!("{}/repos/{owner}/{name}", self.base_url);
        let repo: GhRepo = self.fetch(url).await?;
        Ok(repo.into())
    }

    fn validate_webhook(&self, body: &[u8], signature: &str, secret: &str) -> bool {
        docbuilder_webhook::verify_sha256_prefixed(secret, body, signature)
    }

    fn parse_webhook_event(&self, body: &[u8], event_type: &str) -> Result<WebhookEvent, docbuilder_types::ClassifiedError> {
        if event_type != "push" {
            return Err(forge_err(format!("github event type {event_type:?} carries no repository/branch")));
        }
        let payload: GhPushPayload =
            serde_json::from_slice(body).map_err(|e| forge_err(format!("github push payload did not parse: {e}")))?;
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
        format!("{base}/edit/{branch}/{path}")
    }
}
