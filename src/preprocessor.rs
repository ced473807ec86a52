//! Preprocessor — merge per-version indices into per-repo signatures
//!
//! For each collected repository this pass assigns dense version ids (tags
//! sorted lexicographically, 0..V-1), folds every `fuzzy_<tag>.hidx` into
//! the `hash → versions` signature, tracks each fingerprint's earliest
//! commit date, and derives the idf-style weight table
//! `w(h) = ln(V / |versions(h)|)`.
//!
//! Repositories are processed in parallel; versions within one repo are
//! folded serially in ascending version id so the earliest-date reduction
//! is a plain running minimum.

use crate::runtime::cancel::CancelToken;
use crate::storage::{date_earlier, ArtifactStore, SigEntry, VerIdxEntry, NODATE};
use crate::{SporaError, SporaResult};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct PreprocessStats {
    pub repos: usize,
    pub repos_empty: usize,
    pub repos_failed: usize,
    pub fingerprints: usize,
    pub versions: usize,
}

/// Per-repo function counts, the normalization base for every later
/// embedding and detection ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoMeta {
    pub ave_funcs: u64,
    pub all_funcs: u64,
}

struct RepoOutput {
    repo: String,
    meta: RepoMeta,
    versions: usize,
    fingerprints: usize,
}

pub struct Preprocessor<'a> {
    store: &'a ArtifactStore,
    pool: &'a rayon::ThreadPool,
    cancel: CancelToken,
}

impl<'a> Preprocessor<'a> {
    pub fn new(store: &'a ArtifactStore, pool: &'a rayon::ThreadPool, cancel: CancelToken) -> Self {
        Self {
            store,
            pool,
            cancel,
        }
    }

    /// Process every collected repository and persist the merged metadata
    /// (`aveFuncs`, `allFuncs`). Returns the per-repo counts for the
    /// attribution pass.
    pub fn run(&self) -> SporaResult<(PreprocessStats, BTreeMap<String, RepoMeta>)> {
        let repos = self.store.list_collected_repos()?;
        info!("preprocessing {} repositories", repos.len());

        let results: Vec<(String, SporaResult<Option<RepoOutput>>)> = self.pool.install(|| {
            repos
                .par_iter()
                .map(|repo| (repo.clone(), self.process_repo(repo)))
                .collect()
        });

        let mut stats = PreprocessStats::default();
        let mut meta = BTreeMap::new();
        for (repo, result) in results {
            match result {
                Ok(Some(output)) => {
                    stats.repos += 1;
                    stats.versions += output.versions;
                    stats.fingerprints += output.fingerprints;
                    meta.insert(output.repo, output.meta);
                }
                Ok(None) => {
                    info!("{repo}: no fingerprints, omitted");
                    stats.repos_empty += 1;
                }
                Err(SporaError::Cancelled) => return Err(SporaError::Cancelled),
                Err(e) => {
                    warn!("{repo}: preprocessing failed: {e}");
                    stats.repos_failed += 1;
                }
            }
        }

        let ave: BTreeMap<String, u64> = meta
            .iter()
            .map(|(repo, m)| (repo.clone(), m.ave_funcs))
            .collect();
        let all: BTreeMap<String, u64> = meta
            .iter()
            .map(|(repo, m)| (repo.clone(), m.all_funcs))
            .collect();
        self.store.write_ave_funcs(&ave)?;
        self.store.write_all_funcs(&all)?;

        info!(
            "preprocessed {} repos ({} empty, {} failed), {} fingerprints",
            stats.repos, stats.repos_empty, stats.repos_failed, stats.fingerprints
        );
        Ok((stats, meta))
    }

    fn process_repo(&self, repo: &str) -> SporaResult<Option<RepoOutput>> {
        self.cancel.check()?;

        let tags = self.store.list_hidx_tags(repo)?;
        if tags.is_empty() {
            return Ok(None);
        }
        let tagdates = self.store.read_tagdates(repo)?;

        // Insertion-ordered signature: first-seen order of fingerprints
        // is the iteration order of every later pass.
        let mut order: Vec<String> = Vec::new();
        let mut membership: HashMap<String, Vec<u32>> = HashMap::new();
        let mut earliest: HashMap<String, String> = HashMap::new();

        for (idx, tag) in tags.iter().enumerate() {
            self.cancel.check()?;
            let (_, entries) = self.store.read_hidx(repo, tag)?;
            let date = tagdates
                .get(tag)
                .map(String::as_str)
                .unwrap_or(NODATE);

            for entry in entries {
                let vers = membership.entry(entry.hash.clone()).or_insert_with(|| {
                    order.push(entry.hash.clone());
                    earliest.insert(entry.hash.clone(), NODATE.to_string());
                    Vec::new()
                });
                if vers.last() != Some(&(idx as u32)) {
                    vers.push(idx as u32);
                }
                let current = earliest
                    .get_mut(&entry.hash)
                    .ok_or_else(|| SporaError::ParseFailed("date map out of sync".into()))?;
                if date_earlier(date, current) {
                    *current = date.to_string();
                }
            }
        }

        if order.is_empty() {
            return Ok(None);
        }

        let total_versions = tags.len() as u64;
        let sig: Vec<SigEntry> = order
            .iter()
            .map(|hash| SigEntry {
                hash: hash.clone(),
                vers: membership[hash].clone(),
            })
            .collect();

        let weights: BTreeMap<String, f64> = sig
            .iter()
            .map(|entry| {
                let weight = (total_versions as f64 / entry.vers.len() as f64).ln();
                (entry.hash.clone(), weight)
            })
            .collect();

        let veridx: Vec<VerIdxEntry> = tags
            .iter()
            .enumerate()
            .map(|(idx, tag)| VerIdxEntry {
                ver: tag.clone(),
                idx: idx as u32,
            })
            .collect();

        self.store.write_funcdate(
            repo,
            order.iter().map(|hash| (hash.clone(), earliest[hash].clone())),
        )?;
        self.store.write_veridx(repo, &veridx)?;
        self.store.write_initial_sig(repo, &sig)?;
        self.store.write_weights(repo, &weights)?;

        let all_funcs = sig.len() as u64;
        Ok(Some(RepoOutput {
            repo: repo.to_string(),
            meta: RepoMeta {
                ave_funcs: all_funcs / total_versions,
                all_funcs,
            },
            versions: tags.len(),
            fingerprints: sig.len(),
        }))
    }
}
