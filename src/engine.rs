//! Pipeline driver
//!
//! Owns the shared runtime (worker pool, cancellation token, artifact
//! store) and runs the passes in order: collect → preprocess → attribute,
//! plus the online detect verb. Cross-pass state (`aveFuncs`, the
//! uniqueness map) flows as explicit pass outputs persisted in the store;
//! downstream passes read an immutable snapshot.

use crate::attribution::AttributionEngine;
use crate::collector::{git, resolve_sources, RepoCollector};
use crate::config::SporaConfig;
use crate::detector::{ComponentMatch, Detector};
use crate::preprocessor::Preprocessor;
use crate::runtime::cancel::CancelToken;
use crate::storage::ArtifactStore;
use crate::{SporaError, SporaResult};
use serde::Serialize;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

/// Timing and unit counts of one finished pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassStats {
    pub name: String,
    pub duration_ms: u64,
    pub units_processed: usize,
    pub units_skipped: usize,
    /// Failures that make the overall run exit non-zero.
    pub units_failed: usize,
}

impl PassStats {
    fn finish(name: &str, started: Instant, processed: usize, skipped: usize, failed: usize) -> Self {
        let stats = Self {
            name: name.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            units_processed: processed,
            units_skipped: skipped,
            units_failed: failed,
        };
        info!(
            "{}: {} processed, {} skipped, {} failed in {}ms",
            stats.name,
            stats.units_processed,
            stats.units_skipped,
            stats.units_failed,
            stats.duration_ms
        );
        stats
    }
}

pub struct SporaEngine {
    config: SporaConfig,
    store: ArtifactStore,
    pool: rayon::ThreadPool,
    cancel: CancelToken,
}

impl SporaEngine {
    pub fn new(config: SporaConfig) -> SporaResult<Self> {
        let store = ArtifactStore::new(&config.artifact_root);
        store.ensure_layout()?;
        let pool = crate::runtime::build_pool(config.effective_workers())?;
        info!(
            "engine ready: {} workers, db at {}",
            config.effective_workers(),
            config.artifact_root.display()
        );
        Ok(Self {
            config,
            store,
            pool,
            cancel: CancelToken::new(),
        })
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Shallow-clone repository URLs into the checkout root. Per-URL
    /// failures are isolated.
    pub fn clone_repos(&self, urls: &[String]) -> SporaResult<PassStats> {
        let started = Instant::now();
        std::fs::create_dir_all(&self.config.checkout_root)?;

        let (mut cloned, mut skipped, mut failed) = (0usize, 0usize, 0usize);
        for url in urls {
            self.cancel.check()?;
            let name = repo_name_from_url(url);
            let dest = self.config.checkout_root.join(&name);
            if dest.exists() {
                info!("{name}: checkout already present, skipping");
                skipped += 1;
                continue;
            }
            match git::shallow_clone(url, &dest, self.config.git_timeout(), &self.cancel) {
                Ok(()) => {
                    info!("cloned {url} → {}", dest.display());
                    cloned += 1;
                }
                Err(SporaError::Cancelled) => return Err(SporaError::Cancelled),
                Err(e) => {
                    warn!("clone of {url} failed: {e}");
                    failed += 1;
                }
            }
        }
        Ok(PassStats::finish("clone", started, cloned, skipped + failed, 0))
    }

    /// Collect fingerprint indices for every repository in the list
    /// (a directory of checkouts, or a file of checkout paths).
    pub fn collect(&self, repo_list: &Path) -> SporaResult<PassStats> {
        let started = Instant::now();
        let sources = resolve_sources(repo_list)?;
        info!("collecting {} repositories", sources.len());

        let collector = RepoCollector::new(&self.config, &self.store, &self.pool, self.cancel.clone());
        let stats = collector.collect_all(&sources)?;
        Ok(PassStats::finish(
            "collect",
            started,
            stats.tags_indexed,
            stats.tags_skipped + stats.tags_failed + stats.repos_failed,
            stats.storage_failures,
        ))
    }

    /// Merge per-version indices into per-repo signatures and weights.
    pub fn preprocess(&self) -> SporaResult<PassStats> {
        let started = Instant::now();
        let preprocessor = Preprocessor::new(&self.store, &self.pool, self.cancel.clone());
        let (stats, _meta) = preprocessor.run()?;
        Ok(PassStats::finish(
            "preprocess",
            started,
            stats.repos,
            stats.repos_empty,
            stats.repos_failed,
        ))
    }

    /// Build the uniqueness map and the final component DB.
    pub fn attribute(&self) -> SporaResult<PassStats> {
        let started = Instant::now();
        // Immutable snapshot of the preprocessor's output.
        let ave_funcs = self.store.read_ave_funcs()?;

        let engine = AttributionEngine::new(&self.config, &self.store, &self.pool, self.cancel.clone());
        let stats = engine.run(&ave_funcs)?;
        Ok(PassStats::finish(
            "attribute",
            started,
            stats.repos,
            0,
            stats.repos_failed,
        ))
    }

    /// Detect known components inside a target tree.
    pub fn detect(&self, target: &Path) -> SporaResult<Vec<ComponentMatch>> {
        let started = Instant::now();
        let detector = Detector::new(&self.config, &self.store, &self.pool, self.cancel.clone());
        let matches = detector.detect(target)?;
        PassStats::finish("detect", started, matches.len(), 0, 0);
        Ok(matches)
    }
}

/// Derive a checkout directory name from a clone URL.
fn repo_name_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let name = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed)
        .trim_end_matches(".git");
    if name.is_empty() {
        "repo".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_names_from_common_url_forms() {
        assert_eq!(repo_name_from_url("https://github.com/madler/zlib.git"), "zlib");
        assert_eq!(repo_name_from_url("https://github.com/madler/zlib"), "zlib");
        assert_eq!(repo_name_from_url("git@github.com:curl/curl.git"), "curl");
        assert_eq!(repo_name_from_url("https://example.com/repo/"), "repo");
    }

    #[test]
    fn engine_creates_the_artifact_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = SporaConfig::default();
        config.artifact_root = dir.path().join("db");
        config.workers = 2;

        let engine = SporaEngine::new(config).unwrap();
        assert!(engine.store().root().join("funcs").is_dir());
        assert!(engine.store().root().join("finalDB").is_dir());
        assert!(engine.store().root().join("meta").is_dir());
    }
}
