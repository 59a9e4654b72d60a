//! Repository version expansion (§4.10): a single configured repository
//! with `versions: [...]` becomes one tracked [`Repository`] per version,
//! named `"{base}@{version}"`, so the status surface can report
//! `version_count`/`default_version`/`available_versions` per base repo.

use docbuilder_config::RepositoryConfig;
use docbuilder_types::Repository;

/// Expands every configured repository into its tracked `Repository`
/// entities. A repository with no `versions` expands to exactly itself.
pub fn expand_repository_versions(configs: &[RepositoryConfig]) -> Vec<Repository> {
    configs.iter().flat_map(expand_one).collect()
}

fn expand_one(config: &RepositoryConfig) -> Vec<Repository> {
    if config.versions.is_empty() {
        return vec![to_repository(config, None)];
    }
    config.versions.iter().map(|version| to_repository(config, Some(version.clone()))).collect()
}

fn to_repository(config: &RepositoryConfig, version: Option<String>) -> Repository {
    let name = match &version {
        Some(v) => format!("{}@{}", config.name, v),
        None => config.name.clone(),
    };
    let branch = version.clone().or_else(|| config.branch.clone());
    Repository {
        name,
        url: config.url.clone(),
        branch,
        is_tag: config.is_tag,
        paths: config.paths.clone(),
        auth: config.auth.clone(),
        tags: config.tags.clone(),
        version,
        is_versioned: !config.versions.is_empty(),
    }
}

/// The default version for a base repository name, if configured.
pub fn default_version(configs: &[RepositoryConfig], base_name: &str) -> Option<String> {
    configs.iter().find(|c| c.name == base_name).and_then(|c| c.default_version.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, versions: Vec<&str>) -> RepositoryConfig {
        RepositoryConfig {
            name: name.to_string(),
            url: format!("https://example.test/{name}.git"),
            branch: None,
            is_tag: false,
            paths: Vec::new(),
            auth: None,
            tags: Default::default(),
            versions: versions.into_iter().map(String::from).collect(),
            default_version: None,
        }
    }

    #[test]
    fn unversioned_repo_expands_to_itself() {
        let repos = expand_repository_versions(&[config("guide", vec![])]);
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].name, "guide");
        assert!(!repos[0].is_versioned);
    }

    #[test]
    fn versioned_repo_expands_per_version() {
        let repos = expand_repository_versions(&[config("guide", vec!["v1", "v2"])]);
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].name, "guide@v1");
        assert_eq!(repos[1].name, "guide@v2");
        assert!(repos.iter().all(|r| r.is_versioned));
    }

    #[test]
    fn default_version_looks_up_by_base_name() {
        let mut cfg = config("guide", vec!["v1", "v2"]);
        cfg.default_version = Some("v2".to_string());
        assert_eq!(default_version(&[cfg], "guide"), Some("v2".to_string()));
        assert_eq!(default_version(&[], "guide"), None);
    }
}
