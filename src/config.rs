//! Engine configuration
//!
//! One flat struct covering every tunable the pipeline consults. A config
//! file is plain JSON with the same field names; CLI flags override fields
//! after loading.

use crate::{SporaError, SporaResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How the attribution engine decides that a fingerprint of repository R
/// "matches" a candidate owner component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Exact digest equality against the owner's signatures only.
    Exact,
    /// Equality or TLSH distance within `near_match_distance`.
    Near,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SporaConfig {
    /// Root directory of all on-disk artifacts (the component database)
    pub artifact_root: PathBuf,
    /// Directory holding local repository checkouts to collect from
    pub checkout_root: PathBuf,
    /// Path to the ctags binary
    pub ctags_path: PathBuf,
    /// Worker count for CPU-bound work; 0 means "all available cores"
    pub workers: usize,
    /// TLSH distance at or below which two digests count as a near match (τ)
    pub near_match_distance: u32,
    /// Ratio of matched functions to a component's per-version average
    /// at which the component counts as embedded (θ)
    pub embed_threshold: f64,
    /// Same ratio, applied by the detector when reporting components
    pub detect_threshold: f64,
    /// Attribution match predicate
    pub match_mode: MatchMode,
    /// Wall-clock deadline for one ctags invocation, in seconds
    pub ctags_timeout_secs: u64,
    /// Wall-clock deadline for one git invocation, in seconds
    pub git_timeout_secs: u64,
    /// Cap on simultaneously open file descriptors in the extractor
    pub max_open_files: usize,
    /// Entry cap of the soft result cache used during detection
    pub cache_capacity: usize,
}

impl Default for SporaConfig {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from("spora-db"),
            checkout_root: PathBuf::from("repos"),
            ctags_path: PathBuf::from("ctags"),
            workers: 0,
            near_match_distance: 30,
            embed_threshold: 0.1,
            detect_threshold: 0.1,
            match_mode: MatchMode::Near,
            ctags_timeout_secs: 30,
            git_timeout_secs: 60,
            max_open_files: 256,
            cache_capacity: 1000,
        }
    }
}

impl SporaConfig {
    /// Load a configuration file, failing fast on unknown shape.
    pub fn load(path: &Path) -> SporaResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| SporaError::CorruptedArtifact {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    /// Effective size of the CPU-bound worker pool:
    /// `min(available cores, configured workers)`.
    pub fn effective_workers(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if self.workers == 0 {
            cores
        } else {
            self.workers.min(cores)
        }
    }

    pub fn ctags_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ctags_timeout_secs)
    }

    pub fn git_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.git_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let cfg = SporaConfig::default();
        assert_eq!(cfg.near_match_distance, 30);
        assert!((cfg.embed_threshold - 0.1).abs() < f64::EPSILON);
        assert!((cfg.detect_threshold - 0.1).abs() < f64::EPSILON);
        assert_eq!(cfg.match_mode, MatchMode::Near);
        assert_eq!(cfg.ctags_timeout_secs, 30);
    }

    #[test]
    fn load_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = SporaConfig::default();
        cfg.workers = 4;
        cfg.match_mode = MatchMode::Exact;
        std::fs::write(&path, serde_json::to_string(&cfg).unwrap()).unwrap();

        let loaded = SporaConfig::load(&path).unwrap();
        assert_eq!(loaded.workers, 4);
        assert_eq!(loaded.match_mode, MatchMode::Exact);
    }

    #[test]
    fn load_rejects_malformed_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(SporaConfig::load(&path).is_err());
    }

    #[test]
    fn effective_workers_is_capped_by_cores() {
        let mut cfg = SporaConfig::default();
        cfg.workers = 100_000;
        assert!(cfg.effective_workers() <= 100_000);
        assert!(cfg.effective_workers() >= 1);
    }
}
