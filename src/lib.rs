//! # spora — OSS Component Provenance Detector
//!
//! Identifies reused open-source components inside a target C/C++ codebase,
//! even when the reused code has been modified, relocated, or partially
//! refactored. Works against a curated component database built from known
//! open-source repositories by fingerprinting every function with a
//! locality-sensitive fuzzy hash and aggregating across version history.
//!
//! ## Architecture (batch pipeline + online detector)
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        SporaEngine                           │
//! │  ┌───────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │ Collector │→ │ Preprocessor │→ │ Attribution engine   │   │
//! │  │ (per tag) │  │ (per repo)   │  │ (cross-repo owners)  │   │
//! │  └───────────┘  └──────────────┘  └──────────┬───────────┘   │
//! │        │               │                     │               │
//! │   fuzzy_*.hidx    sig / weights /       componentDB /        │
//! │   tagdates        funcdate / veridx     uniqueFuncs          │
//! │                                              │               │
//! │  ┌───────────────────────────────────────────▼───────────┐   │
//! │  │ Detector: target fingerprints × component DB          │   │
//! │  │ → components, predicted versions, usage statistics    │   │
//! │  └───────────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Capabilities
//!
//! - **Fuzzy function fingerprints**: TLSH digests of normalized function
//!   bodies, robust to reformatting, comments, and small edits
//! - **Version-aware component DB**: every fingerprint carries its earliest
//!   known birth date and the set of releases containing it
//! - **Origin attribution**: fingerprints shared between components are
//!   attributed to the repository that introduced them first
//! - **Embedding subtraction**: a project that vendors a library does not
//!   re-advertise the library's functions as its own
//! - **Version prediction**: weighted voting over release membership picks
//!   the most likely reused version
//! - **Usage analysis**: per-component used / modified / unused counts and
//!   structural-relocation detection

pub mod attribution;
pub mod collector;
pub mod config;
pub mod detector;
pub mod engine;
pub mod fingerprint;
pub mod preprocessor;
pub mod report;
pub mod runtime;
pub mod storage;

// Re-exports for convenience
pub use config::{MatchMode, SporaConfig};
pub use detector::ComponentMatch;
pub use engine::{PassStats, SporaEngine};
pub use fingerprint::tlsh::Tlsh;
pub use runtime::cancel::CancelToken;
pub use storage::ArtifactStore;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SporaError {
    #[error("parse failed: {0}")]
    ParseFailed(String),

    #[error("{tool} failed: {detail}")]
    SubprocessFailed { tool: String, detail: String },

    #[error("storage failure at {}: {detail}", .path.display())]
    StorageFailed { path: PathBuf, detail: String },

    #[error("corrupted artifact {}: {detail}", .path.display())]
    CorruptedArtifact { path: PathBuf, detail: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type SporaResult<T> = Result<T, SporaError>;

impl SporaError {
    /// Process exit code for the CLI: 2 for I/O and subprocess failures,
    /// 3 for cancellation.
    pub fn exit_code(&self) -> i32 {
        match self {
            SporaError::Cancelled => 3,
            _ => 2,
        }
    }
}
