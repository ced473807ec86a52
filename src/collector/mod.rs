//! Repository collector — per-tag fingerprint indices and tag dates
//!
//! For every known repository checkout the collector walks its tag
//! history, checks each tag out, fingerprints every accepted source file
//! in parallel, and writes one `fuzzy_<tag>.hidx` per tag plus the
//! `tagdates` and version-metadata artifacts. The pass is resumable: a
//! `(repo, tag)` whose index already exists is skipped.

pub mod git;

use crate::config::SporaConfig;
use crate::fingerprint::Extractor;
use crate::runtime::cancel::CancelToken;
use crate::runtime::resource::FdLimiter;
use crate::storage::{ArtifactStore, HidxEntry, HidxHeader, VersionRecord, NODATE};
use crate::{SporaError, SporaResult};
use self::git::GitRepo;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// One repository to collect: identifier plus its local checkout.
#[derive(Debug, Clone)]
pub struct RepoSource {
    pub repo_id: String,
    pub checkout: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct CollectStats {
    pub repos: usize,
    /// Repositories skipped on git-level failure; the batch continues.
    pub repos_failed: usize,
    /// Artifact-write failures. These flip the overall exit to non-zero.
    pub storage_failures: usize,
    pub tags_indexed: usize,
    pub tags_skipped: usize,
    pub tags_failed: usize,
    pub functions: usize,
}

pub struct RepoCollector<'a> {
    config: &'a SporaConfig,
    store: &'a ArtifactStore,
    pool: &'a rayon::ThreadPool,
    cancel: CancelToken,
}

impl<'a> RepoCollector<'a> {
    pub fn new(
        config: &'a SporaConfig,
        store: &'a ArtifactStore,
        pool: &'a rayon::ThreadPool,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            store,
            pool,
            cancel,
        }
    }

    /// Collect every repository in the list. A repository that fails
    /// git-wise is skipped with an error log; the batch continues.
    pub fn collect_all(&self, sources: &[RepoSource]) -> SporaResult<CollectStats> {
        let mut stats = CollectStats::default();
        for source in sources {
            self.cancel.check()?;
            match self.collect_repo(source) {
                Ok(repo_stats) => {
                    stats.repos += 1;
                    stats.tags_indexed += repo_stats.tags_indexed;
                    stats.tags_skipped += repo_stats.tags_skipped;
                    stats.tags_failed += repo_stats.tags_failed;
                    stats.functions += repo_stats.functions;
                }
                Err(SporaError::Cancelled) => return Err(SporaError::Cancelled),
                Err(
                    e @ (SporaError::StorageFailed { .. }
                    | SporaError::CorruptedArtifact { .. }
                    | SporaError::Serde(_)
                    | SporaError::Io(_)),
                ) => {
                    error!("collecting {} failed: {e}", source.repo_id);
                    stats.storage_failures += 1;
                }
                Err(e) => {
                    error!("collecting {} failed: {e}", source.repo_id);
                    stats.repos_failed += 1;
                }
            }
        }
        Ok(stats)
    }

    fn collect_repo(&self, source: &RepoSource) -> SporaResult<CollectStats> {
        let mut stats = CollectStats::default();
        let repo_id = source.repo_id.as_str();
        info!("collecting {repo_id}");

        let repo = GitRepo::open(
            &source.checkout,
            self.config.git_timeout(),
            self.cancel.clone(),
        );
        let tags = repo.tags()?;

        if tags.is_empty() {
            // No release history: index the current worktree as a single
            // pseudo-version named after the repository.
            info!("{repo_id}: no tags, indexing worktree as {repo_id}");
            self.store
                .write_tagdates(repo_id, &[(NODATE.to_string(), repo_id.to_string())])?;
            if self.store.hidx_path(repo_id, repo_id).exists() {
                stats.tags_skipped += 1;
            } else {
                stats.functions +=
                    self.index_tree(repo_id, repo_id, &source.checkout)?;
                stats.tags_indexed += 1;
            }
            return Ok(stats);
        }

        let mut tagdates = Vec::with_capacity(tags.len());
        let mut versions = Vec::with_capacity(tags.len());
        for tag in &tags {
            self.cancel.check()?;
            let date = match repo.tag_date(tag) {
                Ok(Some(date)) => date,
                Ok(None) => NODATE.to_string(),
                Err(SporaError::Cancelled) => return Err(SporaError::Cancelled),
                Err(e) => {
                    warn!("{repo_id}: no date for tag {tag}: {e}");
                    NODATE.to_string()
                }
            };
            tagdates.push((date.clone(), sanitize_tag(tag)));
            versions.push(self.version_record(&repo, tag, date));
        }
        self.store.write_tagdates(repo_id, &tagdates)?;
        self.store.write_versions(repo_id, &versions)?;

        for tag in &tags {
            self.cancel.check()?;
            let version = sanitize_tag(tag);
            if self.store.hidx_path(repo_id, &version).exists() {
                stats.tags_skipped += 1;
                continue;
            }

            if let Err(e) = repo.checkout(tag) {
                if matches!(e, SporaError::Cancelled) {
                    return Err(SporaError::Cancelled);
                }
                warn!("{repo_id}: checkout of {tag} failed: {e}");
                stats.tags_failed += 1;
                continue;
            }

            stats.functions += self.index_tree(repo_id, &version, &source.checkout)?;
            stats.tags_indexed += 1;
        }

        info!(
            "{repo_id}: {} tags indexed, {} resumed, {} failed",
            stats.tags_indexed, stats.tags_skipped, stats.tags_failed
        );
        Ok(stats)
    }

    /// Fingerprint one checked-out tree and persist its version index.
    /// A tag with zero acceptable functions still emits a header-only
    /// index so reruns can skip it.
    fn index_tree(&self, repo_id: &str, version: &str, checkout: &Path) -> SporaResult<usize> {
        let limiter = FdLimiter::new(self.config.max_open_files);
        let extractor = Extractor::new(
            self.config.ctags_path.clone(),
            self.config.ctags_timeout(),
            limiter,
            self.cancel.clone(),
        );

        let index = extractor.extract_tree(checkout, self.pool)?;
        let header = HidxHeader {
            repo: repo_id.to_string(),
            files: index.stats.files,
            functions: index.stats.functions,
            lines: index.stats.lines,
        };
        let entries = index.functions.iter().map(|(hex, func)| HidxEntry {
            hash: hex.clone(),
            file: func.file.clone(),
            name: func.name.clone(),
            start_line: func.start_line,
            end_line: func.end_line,
        });
        self.store.write_hidx(repo_id, version, &header, entries)?;

        info!(
            "{repo_id}@{version}: {} files, {} functions, {} unique fingerprints",
            index.stats.files,
            index.stats.functions,
            index.functions.len()
        );
        Ok(index.functions.len())
    }

    fn version_record(&self, repo: &GitRepo, tag: &str, date: String) -> VersionRecord {
        let stats = repo.tag_numstat(tag);
        VersionRecord {
            tag: tag.to_string(),
            commit: repo.tag_commit(tag).unwrap_or_default(),
            author: repo.tag_author(tag).unwrap_or_default(),
            date,
            subject: repo.tag_subject(tag).unwrap_or_default(),
            files_changed: stats.files_changed,
            insertions: stats.insertions,
            deletions: stats.deletions,
        }
    }
}

/// Tag names become file names; path separators cannot survive that.
pub fn sanitize_tag(tag: &str) -> String {
    tag.replace('/', "%")
}

/// Resolve a repo-list argument: either a directory whose subdirectories
/// are checkouts, or a file listing one checkout path per line.
pub fn resolve_sources(list: &Path) -> SporaResult<Vec<RepoSource>> {
    let mut sources = Vec::new();

    if list.is_dir() {
        for entry in std::fs::read_dir(list)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                sources.push(RepoSource {
                    repo_id: entry.file_name().to_string_lossy().into_owned(),
                    checkout: entry.path(),
                });
            }
        }
    } else {
        let raw = std::fs::read_to_string(list)?;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let checkout = PathBuf::from(line);
            let repo_id = checkout
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    SporaError::ParseFailed(format!("repo list entry has no name: {line:?}"))
                })?;
            sources.push(RepoSource { repo_id, checkout });
        }
    }

    sources.sort_by(|a, b| a.repo_id.cmp(&b.repo_id));
    Ok(sources)
}
