//! Redundancy / attribution engine — owners, embedding, final DB
//!
//! Decides which of a repository's fingerprints really belong to it and
//! which belong to a component it embeds.
//!
//! Step 1 merges every repository's earliest-date table into the global
//! uniqueness map: each fingerprint is owned by the repository whose
//! containing version has the oldest commit date (`NODATE` sorts last,
//! ties break to the lexicographically smaller repo id). Ownership is
//! acyclic by construction, so an embedding decision can never subtract
//! fingerprints from their own origin.
//!
//! Step 2 tests every repository R against every candidate owner O: if
//! the fingerprints of R attributed to O cover at least θ of O's average
//! per-version function count, O is declared embedded in R and those
//! fingerprints are removed from R's signature. A near match additionally
//! requires the owner's recorded date for the matched entry to be no
//! later than R's date for its own fingerprint, so a later fork cannot
//! absorb its origin. A fingerprint is subtracted at most once, by the
//! first declared owner in sorted order.
//!
//! Step 3 writes the filtered signatures to the final component DB,
//! copying unchanged signatures verbatim.

use crate::config::{MatchMode, SporaConfig};
use crate::fingerprint::prefilter::DigestIndex;
use crate::fingerprint::tlsh::Tlsh;
use crate::runtime::cancel::CancelToken;
use crate::storage::{date_earlier, ArtifactStore, SigEntry, UniqueEntry, NODATE};
use crate::{SporaError, SporaResult};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct AttributionStats {
    pub repos: usize,
    pub repos_failed: usize,
    pub owned_hashes: usize,
    pub repos_filtered: usize,
    pub hashes_removed: usize,
    pub embedded_pairs: usize,
}

pub struct AttributionEngine<'a> {
    config: &'a SporaConfig,
    store: &'a ArtifactStore,
    pool: &'a rayon::ThreadPool,
    cancel: CancelToken,
}

struct RepoVerdict {
    embedded: Vec<String>,
    removed: usize,
}

impl<'a> AttributionEngine<'a> {
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

    /// Rebuild the final component DB from the preprocessed signatures.
    /// `ave_funcs` is the preprocessor's snapshot; only repositories in it
    /// participate.
    pub fn run(&self, ave_funcs: &BTreeMap<String, u64>) -> SporaResult<AttributionStats> {
        let mut stats = AttributionStats::default();

        // Repositories whose inputs load cleanly. A corrupted artifact
        // excludes the repo from the whole pass.
        let mut repos: Vec<String> = Vec::new();
        let mut funcdates: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut sigs: HashMap<String, Vec<SigEntry>> = HashMap::new();
        for repo in ave_funcs.keys() {
            self.cancel.check()?;
            let loaded = self
                .store
                .read_funcdate(repo)
                .and_then(|dates| Ok((dates, self.store.read_initial_sig(repo)?)));
            match loaded {
                Ok((dates, sig)) => {
                    funcdates.insert(repo.clone(), dates);
                    sigs.insert(repo.clone(), sig);
                    repos.push(repo.clone());
                }
                Err(e) => {
                    warn!("{repo}: excluded from attribution: {e}");
                    stats.repos_failed += 1;
                }
            }
        }

        // ── Step 1: global uniqueness ──
        let owners = self.build_owners(&repos, &funcdates)?;
        stats.owned_hashes = owners.len();

        let unique: Vec<UniqueEntry> = owners
            .iter()
            .map(|(hash, (owner, _))| UniqueEntry {
                hash: hash.clone(),
                oss: vec![owner.clone()],
            })
            .collect();
        self.store.write_unique_funcs(&unique)?;
        info!("uniqueness map: {} fingerprints", unique.len());

        // ── Step 2 + 3: embedding test and final DB, per repo ──
        let sig_sets: HashMap<&str, HashSet<&str>> = sigs
            .iter()
            .map(|(repo, sig)| {
                (
                    repo.as_str(),
                    sig.iter().map(|e| e.hash.as_str()).collect(),
                )
            })
            .collect();
        let prefilters: HashMap<&str, DigestIndex> = match self.config.match_mode {
            MatchMode::Exact => HashMap::new(),
            MatchMode::Near => sigs
                .iter()
                .map(|(repo, sig)| {
                    (
                        repo.as_str(),
                        DigestIndex::from_hex(sig.iter().map(|e| e.hash.as_str())),
                    )
                })
                .collect(),
        };

        let verdicts: Vec<(String, SporaResult<RepoVerdict>)> = self.pool.install(|| {
            repos
                .par_iter()
                .map(|repo| {
                    let verdict = self.filter_repo(
                        repo,
                        &sigs[repo],
                        &owners,
                        &sig_sets,
                        &prefilters,
                        &funcdates,
                        ave_funcs,
                    );
                    (repo.clone(), verdict)
                })
                .collect()
        });

        for (repo, verdict) in verdicts {
            match verdict {
                Ok(v) => {
                    stats.repos += 1;
                    if !v.embedded.is_empty() {
                        stats.repos_filtered += 1;
                        stats.embedded_pairs += v.embedded.len();
                        stats.hashes_removed += v.removed;
                        info!(
                            "{repo}: embeds {} ({} fingerprints subtracted)",
                            v.embedded.join(", "),
                            v.removed
                        );
                    }
                }
                Err(SporaError::Cancelled) => return Err(SporaError::Cancelled),
                Err(e) => {
                    warn!("{repo}: attribution failed: {e}");
                    stats.repos_failed += 1;
                }
            }
        }

        info!(
            "attribution: {} repos, {} filtered, {} fingerprints removed",
            stats.repos, stats.repos_filtered, stats.hashes_removed
        );
        Ok(stats)
    }

    /// Owner of every fingerprint: earliest date wins, `NODATE` last,
    /// ties to the smaller repo id. Order-independent, hence stable under
    /// any merge order.
    fn build_owners(
        &self,
        repos: &[String],
        funcdates: &HashMap<String, HashMap<String, String>>,
    ) -> SporaResult<BTreeMap<String, (String, String)>> {
        let mut owners: BTreeMap<String, (String, String)> = BTreeMap::new();
        for repo in repos {
            self.cancel.check()?;
            for (hash, date) in &funcdates[repo] {
                match owners.get_mut(hash) {
                    None => {
                        owners.insert(hash.clone(), (repo.clone(), date.clone()));
                    }
                    Some((cur_repo, cur_date)) => {
                        let takes_over = date_earlier(date, cur_date)
                            || (!date_earlier(cur_date, date) && repo < cur_repo);
                        if takes_over {
                            *cur_repo = repo.clone();
                            *cur_date = date.clone();
                        }
                    }
                }
            }
        }
        Ok(owners)
    }

    fn filter_repo(
        &self,
        repo: &str,
        sig: &[SigEntry],
        owners: &BTreeMap<String, (String, String)>,
        sig_sets: &HashMap<&str, HashSet<&str>>,
        prefilters: &HashMap<&str, DigestIndex>,
        funcdates: &HashMap<String, HashMap<String, String>>,
        ave_funcs: &BTreeMap<String, u64>,
    ) -> SporaResult<RepoVerdict> {
        self.cancel.check()?;

        // Count, per candidate owner, the fingerprints of this repo that
        // match the owner's own signatures. Signature order is the sig
        // file's insertion order.
        let mut candidates: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (idx, entry) in sig.iter().enumerate() {
            let Some((owner, _)) = owners.get(&entry.hash) else {
                continue;
            };
            if owner == repo {
                continue;
            }
            if self.matches_owner(repo, &entry.hash, owner, sig_sets, prefilters, funcdates) {
                candidates.entry(owner.as_str()).or_default().push(idx);
            }
        }

        let mut embedded: Vec<String> = Vec::new();
        let mut removed: HashSet<usize> = HashSet::new();
        for (owner, matched) in &candidates {
            let ave = ave_funcs.get(*owner).copied().unwrap_or(0);
            if ave == 0 {
                continue;
            }
            let ratio = matched.len() as f64 / ave as f64;
            debug!("{repo}: candidate {owner} ratio {ratio:.3}");
            if ratio >= self.config.embed_threshold {
                embedded.push((*owner).to_string());
                for idx in matched {
                    // First declared owner wins; no double subtraction.
                    removed.insert(*idx);
                }
            }
        }

        if embedded.is_empty() {
            self.store.copy_atomic(
                &self.store.initial_sig_path(repo),
                &self.store.final_sig_path(repo),
            )?;
            return Ok(RepoVerdict {
                embedded,
                removed: 0,
            });
        }

        let filtered: Vec<SigEntry> = sig
            .iter()
            .enumerate()
            .filter(|(idx, _)| !removed.contains(idx))
            .map(|(_, entry)| entry.clone())
            .collect();
        self.store.write_final_sig(repo, &filtered)?;

        Ok(RepoVerdict {
            embedded,
            removed: removed.len(),
        })
    }

    /// Does `hash` (from `repo`'s signature) match candidate owner `owner`?
    /// Exact membership always counts: the owner's date for the same hash
    /// is minimal by construction. A near match pairs `hash` with a
    /// different entry of the owner, so it counts only when the owner's
    /// date for that matched entry is no later than `repo`'s date for
    /// `hash`; `NODATE` on either side is permissive.
    fn matches_owner(
        &self,
        repo: &str,
        hash: &str,
        owner: &str,
        sig_sets: &HashMap<&str, HashSet<&str>>,
        prefilters: &HashMap<&str, DigestIndex>,
        funcdates: &HashMap<String, HashMap<String, String>>,
    ) -> bool {
        let exact = sig_sets
            .get(owner)
            .map(|set| set.contains(hash))
            .unwrap_or(false);
        if exact || self.config.match_mode == MatchMode::Exact {
            return exact;
        }

        let Some(index) = prefilters.get(owner) else {
            return false;
        };
        let digest = match Tlsh::parse_hex(hash) {
            Ok(digest) => digest,
            Err(e) => {
                warn!("undecodable fingerprint {hash:.16}…: {e}");
                return false;
            }
        };
        let Some((matched, _)) = index.nearest_within(&digest, self.config.near_match_distance)
        else {
            return false;
        };

        let owner_date = funcdates.get(owner).and_then(|dates| dates.get(matched));
        let repo_date = funcdates.get(repo).and_then(|dates| dates.get(hash));
        match (owner_date, repo_date) {
            (Some(owner_date), Some(repo_date)) => {
                owner_date == NODATE || repo_date == NODATE || owner_date <= repo_date
            }
            _ => false,
        }
    }
}
