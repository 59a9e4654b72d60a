//! GitLab forge client: REST API v4 + `X-Gitlab-Token` webhooks.
//!
//! Unlike GitHub/Forgejo, GitLab does not sign the webhook body — it
//! echoes a shared secret verbatim in `X-Gitlab-Token`, so `signature`
//! here is the header value itself, compared in constant time.

use async_trait::async_trait;
use docbuilder_types::Repository;
use serde::Deserialize;

use crate::{ForgeClient, RemoteRepository, WebhookEvent, forge_err};

const DEFAULT_BASE_URL: &str = "https://gitlab.com/api/v4";

pub struct GitlabClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl GitlabClient {
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
        let req = self.http.get(url);
        match &self.token {
            Some(token) => req.header("PRIVATE-TOKEN", token),
            None => req,
        }
    }

    async fn fetch<T: for<'de> Deserialize<'de>>(&self, url: String) -> Result<T, docbuilder_types::ClassifiedError> {
        let resp = self
            .request(&url)
            .send()
            .await
            .map_err(|e| forge_err(format!("gitlab request to {url} failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(forge_err(format!("gitlab request to {url} returned {}", resp.status())));
        }
        resp.json::<T>()
            .await
            .map_err(|e| forge_err(format!("gitlab response from {url} did not parse: {e}")))
    }
}

#[derive(Deserialize)]
struct GlProject {
    path_with_namespace: String,
    http_url_to_repo: String,
    default_branch: String,
    description: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    archived: bool,
}

impl From<GlProject> for RemoteRepository {
    fn from(p: GlProject) -> Self {
        RemoteRepository {
            full_name: p.path_with_namespace,
            clone_url: p.http_url_to_repo,
            default_branch: p.default_branch,
            description: p.description,
            topics: p.topics,
            archived: p.archived,
        }
    }
}

#[derive(Deserialize)]
struct GlGroup {
    full_path: String,
}

#[derive(Deserialize)]
struct GlPushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    project: GlPushProject,
    #[serde(default)]
    commits: Vec<GlCommit>,
}

#[derive(Deserialize)]
struct GlPushProject {
    path_with_namespace: String,
}

#[derive(Deserialize)]
struct GlCommit {
    id: String,
}

#[async_trait]
impl ForgeClient for GitlabClient {
    fn name(&self) -> &str {
        "gitlab"
    }

    async fn list_repositories(&self, scopes: &[String]) -> Result<Vec<RemoteRepository>, docbuilder_types::ClassifiedError> {
        if scopes.is_empty() {
            let url = format!("{}/projects?membership=true&per_page=100", self.base_url);
            let projects: Vec<GlProject> = self.fetch(url).await?;
            return Ok(projects.into_iter().map(RemoteRepository::from).collect());
        }
        let mut all = Vec::new();
        for group in scopes {
            let encoded = urlencode(group);
            let url = format!("{}/groups/{encoded}/projects?per_page=100", self.base_url);
            let projects: Vec<GlProject> = self.fetch(url).await?;
            all.extend(projects.into_iter().map(RemoteRepository::from));
        }
        Ok(all)
    }

    async fn list_organizations(&self) -> Result<Vec<String>, docbuilder_types::ClassifiedError> {
        let url = format!("{}/groups?per_page=100", self.base_url);
        let groups: Vec<GlGroup> = self.fetch(url).await?;
        Ok(groups.into_iter().map(|g| g.full_path).collect())
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<RemoteRepository, docbuilder_types::ClassifiedError> {
        let encoded = urlencode(&format!("{owner}/{name}"));
        let url = format!("{}/projects/{encoded}", self.base_url);
        let project: GlProject = self.fetch(url).await?;
        Ok(project.into())
    }

    fn validate_webhook(&self, _body: &[u8], signature: &str, secret: &str) -> bool {
        docbuilder_webhook::verify_shared_token(secret, signature)
    }

    fn parse_webhook_event(&self, body: &[u8], event_type: &str) -> Result<WebhookEvent, docbuilder_types::ClassifiedError> {
        if event_type != "Push Hook" && event_type != "push" {
            return Err(forge_err(format!("gitlab event type {event_type:?} carries no repository/branch")));
        }
        let payload: GlPushPayload =
            serde_json::from_slice(body).map_err(|e| forge_err(format!("gitlab push payload did not parse: {e}")))?;
        let branch = payload.git_ref.strip_prefix("refs/heads/").map(str::to_string);
        Ok(WebhookEvent {
            repository: payload.project.path_with_namespace,
            branch,
            commits: payload.commits.into_iter().map(|c| c.id).collect(),
            metadata: Default::default(),
        })
    }

    fn get_edit_url(&self, repo: &Repository, path: &str, branch: &str) -> String {
        let base = repo.url.trim_end_matches(".git").trim_end_matches('/');
        format!("{base}/-/edit/{branch}/{path}")
    }
}

/// Percent-encode the handful of characters GitLab's `:id` path segment
/// needs escaped (namespaced paths contain `/`).
fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '/' => "%2F".to_string(),
            c => c.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GitlabClient {
        GitlabClient::new(None, None)
    }

    #[test]
    fn default_base_url_is_gitlab_com_api_v4() {
        assert_eq!(client().base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn urlencode_escapes_path_separators() {
        assert_eq!(urlencode("acme/docs"), "acme%2Fdocs");
    }

    #[test]
    fn get_edit_url_uses_dash_edit_convention() {
        let repo = Repository {
            name: "docs".into(),
            url: "https://gitlab.com/acme/docs".into(),
            branch: None,
            is_tag: false,
            paths: vec![],
            auth: None,
            tags: Default::default(),
            version: None,
            is_versioned: false,
        };
        assert_eq!(
            client().get_edit_url(&repo, "README.md", "main"),
            "https://gitlab.com/acme/docs/-/edit/main/README.md"
        );
    }

    #[test]
    fn parse_webhook_event_extracts_branch_and_commits() {
        let body = br#"{
            "ref": "refs/heads/main",
            "project": {"path_with_namespace": "acme/docs"},
            "commits": [{"id": "abc123"}]
        }"#;
        let event = client().parse_webhook_event(body, "Push Hook").unwrap();
        assert_eq!(event.repository, "acme/docs");
        assert_eq!(event.branch.as_deref(), Some("main"));
        assert_eq!(event.commits, vec!["abc123".to_string()]);
    }

    #[test]
    fn validate_webhook_compares_shared_token() {
        assert!(client().validate_webhook(b"", "my-token", "my-token"));
        assert!(!client().validate_webhook(b"", "wrong", "my-token"));
    }
}
