//! Detector — match a target tree against the final component DB
//!
//! Extracts the target's function fingerprints, intersects them with every
//! component entry (exact digests plus TLSH near matches within τ),
//! reports components whose coverage of their per-version average clears
//! θ, predicts the reused version by weighted voting, and classifies each
//! component fingerprint as used / modified / unused.

use crate::config::SporaConfig;
use crate::fingerprint::prefilter::DigestIndex;
use crate::fingerprint::tlsh::Tlsh;
use crate::fingerprint::{ExtractedIndex, Extractor};
use crate::runtime::cache::SoftCache;
use crate::runtime::cancel::CancelToken;
use crate::runtime::resource::FdLimiter;
use crate::storage::{ArtifactStore, SigEntry, VerIdxEntry};
use crate::{SporaError, SporaResult};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// One detected component in the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentMatch {
    pub component: String,
    pub predicted_version: String,
    pub confidence: f64,
    pub used: usize,
    pub modified: usize,
    pub unused: usize,
    pub structural_change: bool,
    pub matched_hashes: Vec<String>,
}

pub struct Detector<'a> {
    config: &'a SporaConfig,
    store: &'a ArtifactStore,
    pool: &'a rayon::ThreadPool,
    cancel: CancelToken,
    weights_cache: SoftCache<String, Arc<HashMap<String, f64>>>,
    veridx_cache: SoftCache<String, Arc<Vec<VerIdxEntry>>>,
}

/// How one component fingerprint matched the target.
struct SigMatch<'s> {
    entry: &'s SigEntry,
    /// Hex digest of the matching target function
    target_hash: String,
    distance: u32,
}

impl<'a> Detector<'a> {
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
            weights_cache: SoftCache::new(config.cache_capacity),
            veridx_cache: SoftCache::new(config.cache_capacity),
        }
    }

    /// Fingerprint `target` and match it against the component DB.
    pub fn detect(&self, target: &Path) -> SporaResult<Vec<ComponentMatch>> {
        let limiter = FdLimiter::new(self.config.max_open_files);
        let extractor = Extractor::new(
            self.config.ctags_path.clone(),
            self.config.ctags_timeout(),
            limiter,
            self.cancel.clone(),
        );

        info!("fingerprinting target {}", target.display());
        let index = extractor.extract_tree(target, self.pool)?;
        info!(
            "target: {} files, {} unique fingerprints",
            index.stats.files,
            index.functions.len()
        );
        self.match_index(&index)
    }

    /// Match an already-extracted fingerprint index against the DB.
    pub fn match_index(&self, target: &ExtractedIndex) -> SporaResult<Vec<ComponentMatch>> {
        self.cancel.check()?;

        let mut target_index = DigestIndex::new();
        for (hex, func) in &target.functions {
            target_index.insert(hex.clone(), func.digest.clone());
        }

        let components = self.store.list_final_components()?;
        let ave_funcs = self.store.read_ave_funcs()?;
        info!("matching against {} components", components.len());

        let results: Vec<(String, SporaResult<Option<ComponentMatch>>)> =
            self.pool.install(|| {
                components
                    .par_iter()
                    .map(|component| {
                        let result =
                            self.evaluate_component(component, target, &target_index, &ave_funcs);
                        (component.clone(), result)
                    })
                    .collect()
            });

        let mut matches = Vec::new();
        for (component, result) in results {
            match result {
                Ok(Some(m)) => matches.push(m),
                Ok(None) => {}
                Err(SporaError::Cancelled) => return Err(SporaError::Cancelled),
                Err(e) => warn!("{component}: skipped during detection: {e}"),
            }
        }

        matches.sort_by(|a, b| a.component.cmp(&b.component));
        info!("detected {} components", matches.len());
        Ok(matches)
    }

    fn evaluate_component(
        &self,
        component: &str,
        target: &ExtractedIndex,
        target_index: &DigestIndex,
        ave_funcs: &BTreeMap<String, u64>,
    ) -> SporaResult<Option<ComponentMatch>> {
        self.cancel.check()?;

        let ave = ave_funcs.get(component).copied().unwrap_or(0);
        if ave == 0 {
            return Ok(None);
        }

        let sig = self.store.read_final_sig(component)?;
        let matched = self.match_signature(&sig, target, target_index);
        if (matched.len() as f64 / ave as f64) < self.config.detect_threshold {
            return Ok(None);
        }

        let weights = self.weights_cache.get_or_try_insert(
            &component.to_string(),
            || -> SporaResult<_> { Ok(Arc::new(self.store.read_weights(component)?)) },
        )?;
        let veridx = self.veridx_cache.get_or_try_insert(
            &component.to_string(),
            || -> SporaResult<_> { Ok(Arc::new(self.store.read_veridx(component)?)) },
        )?;

        let score: f64 = matched
            .iter()
            .map(|m| weights.get(&m.entry.hash).copied().unwrap_or(0.0))
            .sum();

        let (predicted_version, confidence) =
            predict_version(&matched, &weights, &veridx)?;

        let used = matched.iter().filter(|m| m.distance == 0).count();
        let modified = matched.len() - used;
        let unused = sig.len() - matched.len();

        let structural_change =
            self.structural_change(component, &predicted_version, &matched, target);

        info!(
            "{component}: version {predicted_version} (confidence {confidence:.2}), \
             {used} used / {modified} modified / {unused} unused, score {score:.2}"
        );

        Ok(Some(ComponentMatch {
            component: component.to_string(),
            predicted_version,
            confidence,
            used,
            modified,
            unused,
            structural_change,
            matched_hashes: matched.iter().map(|m| m.entry.hash.clone()).collect(),
        }))
    }

    /// Component fingerprints hit by the target, in signature order.
    /// Exact digest hits are distance 0; the rest are TLSH near hits
    /// within τ.
    fn match_signature<'s>(
        &self,
        sig: &'s [SigEntry],
        target: &ExtractedIndex,
        target_index: &DigestIndex,
    ) -> Vec<SigMatch<'s>> {
        let tau = self.config.near_match_distance;
        let mut matched = Vec::new();

        for entry in sig {
            if target.functions.contains_key(&entry.hash) {
                matched.push(SigMatch {
                    entry,
                    target_hash: entry.hash.clone(),
                    distance: 0,
                });
                continue;
            }

            let digest = match Tlsh::parse_hex(&entry.hash) {
                Ok(digest) => digest,
                Err(e) => {
                    warn!("undecodable fingerprint {:.16}…: {e}", entry.hash);
                    continue;
                }
            };
            if let Some((target_hash, distance)) = target_index.nearest_within(&digest, tau) {
                if distance > 0 {
                    matched.push(SigMatch {
                        entry,
                        target_hash: target_hash.to_string(),
                        distance,
                    });
                }
            }
        }
        matched
    }

    /// A matched function was relocated when none of its target paths
    /// shares a trailing path component with its recorded source path.
    fn structural_change(
        &self,
        component: &str,
        version: &str,
        matched: &[SigMatch<'_>],
        target: &ExtractedIndex,
    ) -> bool {
        let source_paths: HashMap<String, String> =
            match self.store.read_hidx(component, version) {
                Ok((_, entries)) => entries
                    .into_iter()
                    .map(|e| (e.hash, e.file))
                    .collect(),
                Err(e) => {
                    warn!("{component}@{version}: no source paths for usage analysis: {e}");
                    return false;
                }
            };

        for m in matched {
            let Some(source) = source_paths.get(&m.entry.hash) else {
                continue;
            };
            let Some(func) = target.functions.get(&m.target_hash) else {
                continue;
            };
            if !func.paths.iter().any(|t| suffix_overlap(t, source)) {
                return true;
            }
        }
        false
    }
}

/// Weighted vote over release membership. The winner is the version with
/// the highest summed weight of matched fingerprints; ties break to the
/// lower version id. Confidence is the winner's share of the total vote.
fn predict_version(
    matched: &[SigMatch<'_>],
    weights: &HashMap<String, f64>,
    veridx: &[VerIdxEntry],
) -> SporaResult<(String, f64)> {
    let version_count = veridx.len();
    if version_count == 0 {
        return Err(SporaError::ParseFailed("empty version index".into()));
    }

    let mut vscore = vec![0.0f64; version_count];
    for m in matched {
        let weight = weights.get(&m.entry.hash).copied().unwrap_or(0.0);
        for &v in &m.entry.vers {
            if let Some(slot) = vscore.get_mut(v as usize) {
                *slot += weight;
            }
        }
    }

    let mut best = 0usize;
    for (idx, score) in vscore.iter().enumerate() {
        if *score > vscore[best] {
            best = idx;
        }
    }
    let total: f64 = vscore.iter().sum();
    // A zero vote total means every matched fingerprint appears in every
    // version. One candidate version is then a certainty; more than one
    // is indistinguishable.
    let confidence = if total > 0.0 {
        vscore[best] / total
    } else if version_count == 1 {
        1.0
    } else {
        0.0
    };

    let version = veridx
        .iter()
        .find(|e| e.idx as usize == best)
        .map(|e| e.ver.clone())
        .ok_or_else(|| SporaError::ParseFailed(format!("version id {best} unmapped")))?;
    Ok((version, confidence))
}

/// Trailing path components match: the file was not relocated.
fn suffix_overlap(target_path: &str, source_path: &str) -> bool {
    let target_name = last_component(target_path);
    let source_name = last_component(source_path);
    match (target_name, source_name) {
        (Some(t), Some(s)) => t == s,
        _ => false,
    }
}

fn last_component(path: &str) -> Option<&str> {
    path.rsplit(['/', '\\'])
        .find(|component| !component.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_overlap_compares_file_names() {
        assert!(suffix_overlap("vendor/zlib/inflate.c", "src/inflate.c"));
        assert!(suffix_overlap("inflate.c", "inflate.c"));
        assert!(!suffix_overlap("vendor/zlib/inflate.c", "src/deflate.c"));
        assert!(!suffix_overlap("", "src/deflate.c"));
    }

    #[test]
    fn version_vote_breaks_ties_downward() {
        let entries = [
            SigEntry {
                hash: "aa".into(),
                vers: vec![1, 2],
            },
        ];
        let matched: Vec<SigMatch<'_>> = entries
            .iter()
            .map(|entry| SigMatch {
                entry,
                target_hash: entry.hash.clone(),
                distance: 0,
            })
            .collect();

        let mut weights = HashMap::new();
        weights.insert("aa".to_string(), 0.4);
        let veridx = vec![
            VerIdxEntry {
                ver: "v1".into(),
                idx: 0,
            },
            VerIdxEntry {
                ver: "v2".into(),
                idx: 1,
            },
            VerIdxEntry {
                ver: "v3".into(),
                idx: 2,
            },
        ];

        let (version, confidence) = predict_version(&matched, &weights, &veridx).unwrap();
        assert_eq!(version, "v2");
        assert!((confidence - 0.5).abs() < 1e-12);
    }

    #[test]
    fn zero_vote_has_zero_confidence() {
        let entries = [SigEntry {
            hash: "aa".into(),
            vers: vec![0],
        }];
        let matched: Vec<SigMatch<'_>> = entries
            .iter()
            .map(|entry| SigMatch {
                entry,
                target_hash: entry.hash.clone(),
                distance: 0,
            })
            .collect();

        // Weight table without the hash: the vote carries no weight, and
        // with several candidate versions nothing is distinguishable.
        let weights = HashMap::new();
        let veridx = vec![
            VerIdxEntry {
                ver: "v1".into(),
                idx: 0,
            },
            VerIdxEntry {
                ver: "v2".into(),
                idx: 1,
            },
        ];
        let (version, confidence) = predict_version(&matched, &weights, &veridx).unwrap();
        assert_eq!(version, "v1");
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn single_version_vote_is_certain() {
        let entries = [SigEntry {
            hash: "aa".into(),
            vers: vec![0],
        }];
        let matched: Vec<SigMatch<'_>> = entries
            .iter()
            .map(|entry| SigMatch {
                entry,
                target_hash: entry.hash.clone(),
                distance: 0,
            })
            .collect();

        let mut weights = HashMap::new();
        weights.insert("aa".to_string(), 0.0);
        let veridx = vec![VerIdxEntry {
            ver: "v1.0".into(),
            idx: 0,
        }];
        let (version, confidence) = predict_version(&matched, &weights, &veridx).unwrap();
        assert_eq!(version, "v1.0");
        assert_eq!(confidence, 1.0);
    }
}
