//! Function extraction — ctags-driven fingerprinting of C/C++ sources
//!
//! For every accepted file an external ctags process enumerates function
//! spans; each span is cut out, normalized, and hashed. Files that ctags
//! cannot handle are skipped with a warning — one bad file never aborts a
//! batch.

use crate::fingerprint::normalize::normalized_body;
use crate::fingerprint::tlsh::{HashError, Tlsh};
use crate::runtime::cancel::CancelToken;
use crate::runtime::resource::FdLimiter;
use crate::runtime::subprocess::run_with_deadline;
use crate::{SporaError, SporaResult};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// File extensions accepted as C/C++ sources.
pub const SOURCE_EXTENSIONS: [&str; 6] = ["c", "cc", "cpp", "cxx", "h", "hpp"];

pub fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            SOURCE_EXTENSIONS.iter().any(|accepted| *accepted == ext)
        })
        .unwrap_or(false)
}

// ─── Output Types ──────────────────────────────────────────────────

/// One fingerprinted function, deduplicated by digest within a tree.
#[derive(Debug, Clone)]
pub struct ExtractedFunction {
    /// First file (relative to the extraction root) the digest was seen in
    pub file: String,
    pub name: String,
    pub start_line: usize,
    pub end_line: usize,
    pub digest: Tlsh,
    /// Every relative path containing a function with this digest
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractStats {
    pub files: usize,
    pub functions: usize,
    pub lines: usize,
    pub skipped_files: usize,
}

/// Fingerprint index of one source tree: digest hex → function record.
#[derive(Debug, Clone, Default)]
pub struct ExtractedIndex {
    pub functions: BTreeMap<String, ExtractedFunction>,
    pub stats: ExtractStats,
}

// ─── Extractor ─────────────────────────────────────────────────────

pub struct Extractor {
    ctags_path: PathBuf,
    deadline: Duration,
    limiter: Arc<FdLimiter>,
    cancel: CancelToken,
}

struct FunctionSpan {
    name: String,
    start_line: usize,
    end_line: usize,
}

struct FileExtraction {
    hits: Vec<FunctionHit>,
    line_count: usize,
}

struct FunctionHit {
    hex: String,
    digest: Tlsh,
    rel_path: String,
    name: String,
    start_line: usize,
    end_line: usize,
}

impl Extractor {
    pub fn new(
        ctags_path: PathBuf,
        deadline: Duration,
        limiter: Arc<FdLimiter>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            ctags_path,
            deadline,
            limiter,
            cancel,
        }
    }

    /// Fingerprint every accepted source file below `root`, in parallel on
    /// the given pool. Per-file failures are logged and skipped.
    pub fn extract_tree(
        &self,
        root: &Path,
        pool: &rayon::ThreadPool,
    ) -> SporaResult<ExtractedIndex> {
        self.cancel.check()?;

        let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_source_file(e.path()))
            .map(|e| e.into_path())
            .collect();
        files.sort();

        let results: Vec<(PathBuf, SporaResult<FileExtraction>)> = pool.install(|| {
            files
                .into_par_iter()
                .map(|path| {
                    let extraction = self.extract_file(&path, root);
                    (path, extraction)
                })
                .collect()
        });

        let mut index = ExtractedIndex::default();
        for (path, result) in results {
            match result {
                Ok(extraction) => {
                    index.stats.files += 1;
                    index.stats.lines += extraction.line_count;
                    index.stats.functions += extraction.hits.len();
                    for hit in extraction.hits {
                        let entry = index
                            .functions
                            .entry(hit.hex)
                            .or_insert_with(|| ExtractedFunction {
                                file: hit.rel_path.clone(),
                                name: hit.name,
                                start_line: hit.start_line,
                                end_line: hit.end_line,
                                digest: hit.digest,
                                paths: Vec::new(),
                            });
                        if !entry.paths.contains(&hit.rel_path) {
                            entry.paths.push(hit.rel_path);
                        }
                    }
                }
                Err(SporaError::Cancelled) => return Err(SporaError::Cancelled),
                Err(e) => {
                    warn!("skipping {}: {e}", path.display());
                    index.stats.skipped_files += 1;
                }
            }
        }

        Ok(index)
    }

    fn extract_file(&self, path: &Path, base: &Path) -> SporaResult<FileExtraction> {
        self.cancel.check()?;
        let _permit = self.limiter.acquire();

        let raw = std::fs::read(path)?;
        let content = String::from_utf8_lossy(&raw);
        let lines: Vec<&str> = content.lines().collect();

        let spans = self.list_functions(path)?;

        let rel_path = path
            .strip_prefix(base)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();

        let mut hits = Vec::new();
        for span in spans {
            if span.start_line == 0 || span.end_line > lines.len() || span.start_line > span.end_line {
                warn!(
                    "{}: span {}..{} for `{}` out of bounds ({} lines)",
                    path.display(),
                    span.start_line,
                    span.end_line,
                    span.name,
                    lines.len()
                );
                continue;
            }

            let body = lines[span.start_line - 1..span.end_line].join("\n");
            let inner = match brace_interior(&body) {
                Some(inner) => inner,
                None => continue,
            };

            let normalized = normalized_body(inner);
            match Tlsh::hash(normalized.as_bytes()) {
                Ok(digest) => hits.push(FunctionHit {
                    hex: digest.to_hex(),
                    digest,
                    rel_path: rel_path.clone(),
                    name: span.name,
                    start_line: span.start_line,
                    end_line: span.end_line,
                }),
                Err(HashError::InputTooSmall) => {
                    debug!("{}: `{}` below hash minimum", path.display(), span.name);
                }
                Err(e) => {
                    warn!("{}: `{}`: {e}", path.display(), span.name);
                }
            }
        }

        Ok(FileExtraction {
            hits,
            line_count: lines.len(),
        })
    }

    /// Ask ctags for the function spans of one file.
    fn list_functions(&self, path: &Path) -> SporaResult<Vec<FunctionSpan>> {
        let mut cmd = Command::new(&self.ctags_path);
        cmd.arg("--fields=+ne")
            .arg("--language-force=C++")
            .arg("-f")
            .arg("-")
            .arg(path);

        let output = run_with_deadline(cmd, "ctags", self.deadline, &self.cancel)?;
        Ok(parse_ctags_output(&output.stdout, path))
    }
}

// ─── ctags Output Parsing ──────────────────────────────────────────

/// Parse tab-separated ctags lines into function spans. Malformed lines
/// are logged and skipped; non-function tags are silently ignored.
fn parse_ctags_output(output: &str, source: &Path) -> Vec<FunctionSpan> {
    let mut spans = Vec::new();
    for line in output.lines() {
        if line.is_empty() || line.starts_with("!_") {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 4 {
            warn!("{}: malformed ctags line: {line:?}", source.display());
            continue;
        }

        let kind = fields[3];
        if kind != "f" && kind != "function" {
            continue;
        }

        let mut start_line = None;
        let mut end_line = None;
        for field in &fields[4..] {
            if let Some(v) = field.strip_prefix("line:") {
                start_line = v.parse::<usize>().ok();
            } else if let Some(v) = field.strip_prefix("end:") {
                end_line = v.parse::<usize>().ok();
            }
        }

        match (start_line, end_line) {
            (Some(start), Some(end)) => spans.push(FunctionSpan {
                name: fields[0].to_string(),
                start_line: start,
                end_line: end,
            }),
            _ => {
                warn!(
                    "{}: function tag without line/end fields: {line:?}",
                    source.display()
                );
            }
        }
    }
    spans
}

/// The body between the first `{` and the last `}` of a function span.
fn brace_interior(body: &str) -> Option<&str> {
    let open = body.find('{')?;
    let close = body.rfind('}')?;
    if close <= open {
        return None;
    }
    Some(&body[open + 1..close])
}
