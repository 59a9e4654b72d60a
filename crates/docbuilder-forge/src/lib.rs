//! Forge client capability set (§6, §4.7).
//!
//! Discovery and the webhook listener only ever talk to a
//! `dyn ForgeClient`; they never branch on which host a repository lives
//! on. Each concrete forge — `github`, `gitlab`, `forgejo`, `local` —
//! implements the same capability set against its own REST/webhook shape,
//! sharing the HMAC/shared-token verification helpers from
//! `docbuilder-webhook`.

pub mod forgejo;
pub mod github;
pub mod gitlab;
pub mod local;

pub use forgejo::ForgejoClient;
pub use github::GithubClient;
pub use gitlab::GitlabClient;
pub use local::LocalClient;

use std::collections::BTreeMap;

use async_trait::async_trait;
use docbuilder_types::{Category, ClassifiedError, Repository};
use serde::{Deserialize, Serialize};

/// A repository as reported by a forge's listing/lookup API, prior to
/// discovery filtering and conversion into a [`Repository`] (§4.7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRepository {
    pub full_name: String,
    pub clone_url: String,
    pub default_branch: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub archived: bool,
}

/// A parsed webhook delivery (§6): forge-specific headers and body reduced
/// to the fields the repo-updater actually acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub repository: String,
    pub branch: Option<String>,
    pub commits: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Capability set implemented once per forge (§6). `validate_webhook` and
/// `get_edit_url` are synchronous — no network round-trip is needed for
/// either. Everything else reaches out to the forge's API.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    /// Short identifier used in `DiscoveryResult::errors` keys and log
    /// fields (e.g. `"github"`, the configured forge name).
    fn name(&self) -> &str;

    /// List repositories visible within `scopes` (organizations/groups).
    /// An empty `scopes` means "everything this credential can see".
    async fn list_repositories(&self, scopes: &[String]) -> Result<Vec<RemoteRepository>, ClassifiedError>;

    /// List organizations/groups the configured credential belongs to.
    async fn list_organizations(&self) -> Result<Vec<String>, ClassifiedError>;

    async fn get_repository(&self, owner: &str, name: &str) -> Result<RemoteRepository, ClassifiedError>;

    /// Verify an inbound webhook signature against the forge's convention.
    /// `signature` is the raw header value; never errors, only rejects.
    fn validate_webhook(&self, body: &[u8], signature: &str, secret: &str) -> bool;

    /// Parse a webhook body into the fields the daemon needs, given the
    /// forge's event-type header value (e.g. `"push"`).
    fn parse_webhook_event(&self, body: &[u8], event_type: &str) -> Result<WebhookEvent, ClassifiedError>;

    /// Build an "edit this page" link for `path` on `branch`.
    fn get_edit_url(&self, repo: &Repository, path: &str, branch: &str) -> String;
}

fn forge_err(message: impl Into<String>) -> ClassifiedError {
    ClassifiedError::builder(Category::Forge, message).build()
}

fn config_err(message: impl Into<String>) -> ClassifiedError {
    ClassifiedError::builder(Category::Config, message).build()
}

fn unsupported(forge: &str, operation: &str) -> ClassifiedError {
    ClassifiedError::builder(
        Category::Validation,
        format!("{forge} forge client does not support {operation}"),
    )
    .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_carries_forge_and_operation_in_message() {
        let err = unsupported("local", "list_organizations");
        assert!(err.message.contains("local"));
        assert!(err.message.contains("list_organizations"));
    }
}
