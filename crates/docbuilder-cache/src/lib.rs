//! Content-addressable build cache (C5).
//!
//! A build's [`BuildSignature`] (composed in `docbuilder-types` from
//! repo hashes, theme, transforms, and site config) is the cache key.
//! Two builds with equal signatures are contractually required to
//! produce byte-identical rendered output (§8), so a hit lets the
//! worker skip invoking the `SiteGenerator` entirely. Invalidation is
//! implicit — a changed input changes the signature — there is no TTL.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use docbuilder_types::{BuildSignature, Category, ClassifiedError, Severity};
use serde::{Deserialize, Serialize};

/// On-disk record for a cached build, stored as `<cache_dir>/<build_hash>/manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheManifest {
    pub build_hash: String,
    pub signature: BuildSignature,
    pub created_at: DateTime<Utc>,
    pub site_dir: PathBuf,
}

/// Directory-backed cache store keyed by `build_hash` (§4.5, §6).
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CacheStore { root: root.into() }
    }

    fn entry_dir(&self, build_hash: &str) -> PathBuf {
        self.root.join(build_hash)
    }

    fn manifest_path(&self, build_hash: &str) -> PathBuf {
        self.entry_dir(build_hash).join("manifest.json")
    }

    /// `true` if a manifest for this signature's `build_hash` already
    /// exists — the cache-hit condition that lets a worker skip a build
    /// when `skip_if_unchanged` is enabled (§4.5, §4.8 step 6).
    pub fn has_manifest(&self, signature: &BuildSignature) -> bool {
        self.manifest_path(&signature.build_hash).exists()
    }

    pub fn load_manifest(&self, build_hash: &str) -> Result<Option<CacheManifest>, ClassifiedError> {
        let path = self.manifest_path(build_hash);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path).map_err(|e| {
            ClassifiedError::builder(Category::Filesystem, format!("failed to read cache manifest: {e}"))
                .severity(Severity::Error)
                .build()
        })?;
        let manifest: CacheManifest = serde_json::from_str(&data).map_err(|e| {
            ClassifiedError::builder(Category::Internal, format!("corrupt cache manifest: {e}"))
                .severity(Severity::Error)
                .build()
        })?;
        Ok(Some(manifest))
    }

    /// Record a freshly generated site under this signature's
    /// `build_hash`. `site_dir` is the directory the `SiteGenerator`
    /// wrote to; this just records the manifest pointing at it (the
    /// caller owns moving/copying bytes into cache storage if desired).
    pub fn store_manifest(&self, signature: &BuildSignature, site_dir: PathBuf) -> Result<CacheManifest, ClassifiedError> {
        let dir = self.entry_dir(&signature.build_hash);
        fs::create_dir_all(&dir).map_err(|e| {
            ClassifiedError::builder(Category::Filesystem, format!("failed to create cache entry dir: {e}"))
                .severity(Severity::Error)
                .build()
        })?;
        let manifest = CacheManifest {
            build_hash: signature.build_hash.clone(),
            signature: signature.clone(),
            created_at: Utc::now(),
            site_dir,
        };
        let data = serde_json::to_string_pretty(&manifest).map_err(|e| {
            ClassifiedError::builder(Category::Internal, format!("failed to serialize cache manifest: {e}"))
                .severity(Severity::Error)
                .build()
        })?;
        fs::write(self.manifest_path(&signature.build_hash), data).map_err(|e| {
            ClassifiedError::builder(Category::Filesystem, format!("failed to write cache manifest: {e}"))
                .severity(Severity::Error)
                .build()
        })?;
        Ok(manifest)
    }
}

/// Decision returned by [`evaluate`]: whether the build should proceed
/// or can be skipped because an identical signature was already built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDecision {
    Skip { build_hash: String },
    Build,
}

/// Evaluate whether a build with `signature` can be skipped, honoring
/// the `skip_if_unchanged` knob (§4.5). When disabled, always builds
/// regardless of cache state.
pub fn evaluate(store: &CacheStore, signature: &BuildSignature, skip_if_unchanged: bool) -> CacheDecision {
    if skip_if_unchanged && store.has_manifest(signature) {
        CacheDecision::Skip { build_hash: signature.build_hash.clone() }
    } else {
        CacheDecision::Build
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docbuilder_types::RepoHash;
    use tempfile::tempdir;

    fn sample_signature(seed: &str) -> BuildSignature {
        BuildSignature::compose(
            vec![RepoHash::compute("repo", seed, &[])],
            "hugo-theme",
            "1.0.0",
            vec!["links".into()],
            "https://docs.example.com",
            "Example Docs",
        )
    }

    #[test]
    fn fresh_store_has_no_manifest() {
        let td = tempdir().expect("tempdir");
        let store = CacheStore::new(td.path());
        let sig = sample_signature("abc");
        assert!(!store.has_manifest(&sig));
    }

    #[test]
    fn store_then_load_round_trips() {
        let td = tempdir().expect("tempdir");
        let store = CacheStore::new(td.path());
        let sig = sample_signature("abc");

        store.store_manifest(&sig, td.path().join("site")).expect("store");
        assert!(store.has_manifest(&sig));

        let loaded = store.load_manifest(&sig.build_hash).expect("load").expect("present");
        assert_eq!(loaded.build_hash, sig.build_hash);
    }

    #[test]
    fn evaluate_skips_on_matching_signature_when_enabled() {
        let td = tempdir().expect("tempdir");
        let store = CacheStore::new(td.path());
        let sig = sample_signature("abc");
        store.store_manifest(&sig, td.path().join("site")).expect("store");

        assert_eq!(evaluate(&store, &sig, true), CacheDecision::Skip { build_hash: sig.build_hash.clone() });
    }

    #[test]
    fn evaluate_always_builds_when_skip_disabled() {
        let td = tempdir().expect("tempdir");
        let store = CacheStore::new(td.path());
        let sig = sample_signature("abc");
        store.store_manifest(&sig, td.path().join("site")).expect("store");

        assert_eq!(evaluate(&store, &sig, false), CacheDecision::Build);
    }

    #[test]
    fn evaluate_builds_when_signature_changes() {
        let td = tempdir().expect("tempdir");
        let store = CacheStore::new(td.path());
        let sig_a = sample_signature("abc");
        let sig_b = sample_signature("def");
        store.store_manifest(&sig_a, td.path().join("site")).expect("store");

        assert_eq!(evaluate(&store, &sig_b, true), CacheDecision::Build);
    }
}
