//! Collaborator interfaces (C11): the worker loop depends on these traits,
//! not on Hugo or any particular transform implementation, so alternate
//! site generators/pipelines can be substituted in tests or future forges.

use std::path::{Path, PathBuf};

use docbuilder_types::{Category, ClassifiedError};

/// A single discovered documentation source file, relative to its repo's
/// doc root.
#[derive(Debug, Clone)]
pub struct DocFile {
    pub repo: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
}

/// Applies configured content transforms to a repo's doc tree before
/// handoff to the site generator. Runs once per repo, in-place under the
/// repo's workdir.
#[async_trait::async_trait]
pub trait TransformPipeline: Send + Sync {
    async fn apply(&self, repo_root: &Path, transforms: &[String]) -> Result<(), ClassifiedError>;
}

/// No-op pipeline: copies doc files through unchanged. Used until a real
/// transform (frontmatter rewriting, link rewriting, etc.) is configured.
pub struct PassthroughTransformPipeline;

#[async_trait::async_trait]
impl TransformPipeline for PassthroughTransformPipeline {
    async fn apply(&self, _repo_root: &Path, _transforms: &[String]) -> Result<(), ClassifiedError> {
        Ok(())
    }
}

/// Renders an assembled content tree into a static site.
#[async_trait::async_trait]
pub trait SiteGenerator: Send + Sync {
    async fn generate(&self, content_root: &Path, output_dir: &Path, theme: &str) -> Result<(), ClassifiedError>;
}

/// Shells out to `hugo` the same way `docbuilder-process`'s callers are
/// documented to. Runs on the blocking pool since `hugo` is a CPU-bound
/// subprocess, not an async-friendly one.
pub struct HugoSiteGenerator;

#[async_trait::async_trait]
impl SiteGenerator for HugoSiteGenerator {
    async fn generate(&self, content_root: &Path, output_dir: &Path, theme: &str) -> Result<(), ClassifiedError> {
        let content_root = content_root.to_path_buf();
        let output_dir = output_dir.to_path_buf();
        let theme = theme.to_string();

        tokio::task::spawn_blocking(move || {
            let output_arg = output_dir.to_string_lossy().to_string();
            let result = docbuilder_process::run_command_in_dir(
                "hugo",
                &["--theme", &theme, "--destination", &output_arg, "--minify"],
                &content_root,
            )
            .map_err(|e| ClassifiedError::builder(Category::Runtime, format!("failed to spawn hugo: {e}")).build())?;

            result.ok().map_err(|e| ClassifiedError::builder(Category::Runtime, format!("hugo exited with an error: {e}")).build())?;

            Ok(())
        })
        .await
        .map_err(|join_err| ClassifiedError::builder(Category::Runtime, format!("hugo task panicked: {join_err}")).build())?
    }
}
