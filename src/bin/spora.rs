//! spora CLI — collect, preprocess, attribute, detect
//!
//! Exit codes: 0 success, 1 usage error, 2 I/O or subprocess failure,
//! 3 cancelled.

use clap::{Parser, Subcommand};
use spora::{report, SporaConfig, SporaEngine, SporaResult};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "spora")]
#[command(version)]
#[command(about = "OSS component provenance detector for C/C++ codebases")]
#[command(long_about = "
Builds a version-aware component database from known open-source
repositories and detects reused components inside a target codebase,
including modified and relocated functions.

Typical flow:

  # Fetch known repositories
  spora clone --url https://github.com/madler/zlib.git

  # Fingerprint every tag of every checkout
  spora collect repos/

  # Per-repo signatures, weights, version indices
  spora preprocess

  # Cross-repo ownership and embedding subtraction
  spora attribute

  # Scan a target tree against the final database
  spora detect --target ./vendor-drop --out report.json
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON); flags below override its fields
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Artifact database root
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Worker count for CPU-bound work (default: all cores)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Path to the ctags binary
    #[arg(long, global = true)]
    ctags: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Shallow-clone known repositories into the checkout root
    Clone {
        /// Repository URLs
        #[arg(long = "url", required = true)]
        urls: Vec<String>,
    },

    /// Fingerprint every tag of the listed repositories
    Collect {
        /// Directory of checkouts, or a file with one checkout path per line
        repo_list: PathBuf,
    },

    /// Merge version indices into per-repo signatures and weights
    Preprocess,

    /// Attribute shared fingerprints and build the final component DB
    Attribute,

    /// Detect known components inside a target tree
    Detect {
        /// Target source tree
        #[arg(long)]
        target: PathBuf,

        /// Write the JSON report here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version are not usage errors.
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> SporaResult<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => SporaConfig::load(path)?,
        None => SporaConfig::default(),
    };
    if let Some(db) = cli.db {
        config.artifact_root = db;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(ctags) = cli.ctags {
        config.ctags_path = ctags;
    }

    let engine = SporaEngine::new(config)?;

    let failed_units = match cli.command {
        Commands::Clone { urls } => engine.clone_repos(&urls)?.units_failed,
        Commands::Collect { repo_list } => engine.collect(&repo_list)?.units_failed,
        Commands::Preprocess => engine.preprocess()?.units_failed,
        Commands::Attribute => engine.attribute()?.units_failed,
        Commands::Detect { target, out } => {
            let matches = engine.detect(&target)?;
            report::write_report(&matches, out.as_deref())?;
            0
        }
    };

    if failed_units > 0 {
        Ok(ExitCode::from(2))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
