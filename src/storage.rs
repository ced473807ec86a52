//! On-disk artifact store
//!
//! The directory tree below the artifact root is the canonical component
//! database; every in-memory structure can be rebuilt from it. One record
//! type per artifact so loaders fail fast on unexpected shape. All writers
//! go through a temp-file + rename so a crash never leaves a partial
//! artifact behind.
//!
//! ```text
//! <root>/funcs/<repo>/fuzzy_<tag>.hidx   header + hash\tfile\tname\tstart\tend
//! <root>/tagdates/<repo>                 <date>\t<tag> lines
//! <root>/versions/<repo>.json            tag metadata (commit, author, churn)
//! <root>/funcdates/<repo>_funcdate       <hash>\t<date> lines
//! <root>/veridx/<repo>_idx               [{"ver":.., "idx":..}]
//! <root>/initialDB/<repo>_sig            [{"hash":.., "vers":[..]}]
//! <root>/finalDB/<repo>                  same shape, after attribution
//! <root>/weights/<repo>_weights          {hash: weight}
//! <root>/meta/aveFuncs, allFuncs         {repo: count}
//! <root>/meta/uniqueFuncs                [{"hash":.., "OSS":[owner]}]
//! ```

use crate::{SporaError, SporaResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Sentinel for an unresolvable commit date. Sorts after every real date.
pub const NODATE: &str = "NODATE";

/// True if date `a` (ISO `YYYY-MM-DD` or [`NODATE`]) is strictly earlier
/// than `b`.
pub fn date_earlier(a: &str, b: &str) -> bool {
    match (a == NODATE, b == NODATE) {
        (true, _) => false,
        (false, true) => true,
        (false, false) => a < b,
    }
}

// ─── Records ───────────────────────────────────────────────────────

/// One fingerprint of a repository signature: the digest plus the dense
/// version ids containing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigEntry {
    pub hash: String,
    pub vers: Vec<u32>,
}

/// Version-id assignment for one tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerIdxEntry {
    pub ver: String,
    pub idx: u32,
}

/// Origin owner of one fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueEntry {
    pub hash: String,
    #[serde(rename = "OSS")]
    pub oss: Vec<String>,
}

/// Tag metadata captured at collection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub tag: String,
    pub commit: String,
    pub author: String,
    pub date: String,
    pub subject: String,
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
}

/// First line of a `.hidx` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidxHeader {
    pub repo: String,
    pub files: usize,
    pub functions: usize,
    pub lines: usize,
}

/// One fingerprint line of a `.hidx` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidxEntry {
    pub hash: String,
    pub file: String,
    pub name: String,
    pub start_line: usize,
    pub end_line: usize,
}

// ─── Store ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory layout. Idempotent.
    pub fn ensure_layout(&self) -> SporaResult<()> {
        for dir in [
            "funcs",
            "tagdates",
            "versions",
            "funcdates",
            "veridx",
            "initialDB",
            "finalDB",
            "weights",
            "meta",
        ] {
            std::fs::create_dir_all(self.root.join(dir))
                .map_err(|e| self.storage_err(&self.root.join(dir), e))?;
        }
        Ok(())
    }

    // ── Paths ──

    pub fn funcs_dir(&self, repo: &str) -> PathBuf {
        self.root.join("funcs").join(repo)
    }

    pub fn hidx_path(&self, repo: &str, tag: &str) -> PathBuf {
        self.funcs_dir(repo).join(format!("fuzzy_{tag}.hidx"))
    }

    pub fn tagdates_path(&self, repo: &str) -> PathBuf {
        self.root.join("tagdates").join(repo)
    }

    pub fn versions_path(&self, repo: &str) -> PathBuf {
        self.root.join("versions").join(format!("{repo}.json"))
    }

    pub fn funcdate_path(&self, repo: &str) -> PathBuf {
        self.root.join("funcdates").join(format!("{repo}_funcdate"))
    }

    pub fn veridx_path(&self, repo: &str) -> PathBuf {
        self.root.join("veridx").join(format!("{repo}_idx"))
    }

    pub fn initial_sig_path(&self, repo: &str) -> PathBuf {
        self.root.join("initialDB").join(format!("{repo}_sig"))
    }

    pub fn final_sig_path(&self, repo: &str) -> PathBuf {
        self.root.join("finalDB").join(repo)
    }

    pub fn weights_path(&self, repo: &str) -> PathBuf {
        self.root.join("weights").join(format!("{repo}_weights"))
    }

    pub fn ave_funcs_path(&self) -> PathBuf {
        self.root.join("meta").join("aveFuncs")
    }

    pub fn all_funcs_path(&self) -> PathBuf {
        self.root.join("meta").join("allFuncs")
    }

    pub fn unique_funcs_path(&self) -> PathBuf {
        self.root.join("meta").join("uniqueFuncs")
    }

    // ── Listings ──

    /// Repositories with collected fingerprint indices, sorted.
    pub fn list_collected_repos(&self) -> SporaResult<Vec<String>> {
        self.list_dir_names(&self.root.join("funcs"), |entry| {
            entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
        })
    }

    /// Tags with a `.hidx` for one repo, sorted lexicographically.
    pub fn list_hidx_tags(&self, repo: &str) -> SporaResult<Vec<String>> {
        let mut tags: Vec<String> = self
            .list_dir_names(&self.funcs_dir(repo), |entry| {
                entry.file_type().map(|t| t.is_file()).unwrap_or(false)
            })?
            .into_iter()
            .filter_map(|name| {
                name.strip_prefix("fuzzy_")
                    .and_then(|rest| rest.strip_suffix(".hidx"))
                    .map(str::to_string)
            })
            .collect();
        tags.sort();
        Ok(tags)
    }

    /// Components present in the final database, sorted.
    pub fn list_final_components(&self) -> SporaResult<Vec<String>> {
        self.list_dir_names(&self.root.join("finalDB"), |entry| {
            entry.file_type().map(|t| t.is_file()).unwrap_or(false)
        })
    }

    fn list_dir_names(
        &self,
        dir: &Path,
        keep: impl Fn(&std::fs::DirEntry) -> bool,
    ) -> SporaResult<Vec<String>> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if keep(&entry) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    // ── Atomic primitives ──

    /// Write bytes via temp file + rename in the destination directory.
    pub fn atomic_write(&self, path: &Path, contents: &[u8]) -> SporaResult<()> {
        let parent = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| self.storage_err(parent, e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| self.storage_err(path, e))?;
        tmp.write_all(contents)
            .map_err(|e| self.storage_err(path, e))?;
        tmp.persist(path)
            .map_err(|e| self.storage_err(path, e.error))?;
        Ok(())
    }

    /// Atomically copy one artifact over another.
    pub fn copy_atomic(&self, src: &Path, dst: &Path) -> SporaResult<()> {
        let contents = std::fs::read(src).map_err(|e| self.storage_err(src, e))?;
        self.atomic_write(dst, &contents)
    }

    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> SporaResult<()> {
        let json = serde_json::to_vec(value)?;
        self.atomic_write(path, &json)
    }

    pub fn load_json<T: DeserializeOwned>(&self, path: &Path) -> SporaResult<T> {
        let raw = std::fs::read_to_string(path).map_err(|e| self.storage_err(path, e))?;
        serde_json::from_str(&raw).map_err(|e| SporaError::CorruptedArtifact {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    fn storage_err(&self, path: &Path, e: std::io::Error) -> SporaError {
        SporaError::StorageFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        }
    }

    // ── hidx ──

    pub fn write_hidx(
        &self,
        repo: &str,
        tag: &str,
        header: &HidxHeader,
        entries: impl Iterator<Item = HidxEntry>,
    ) -> SporaResult<()> {
        let mut out = format!(
            "{}\t{}\t{}\t{}\n",
            header.repo, header.files, header.functions, header.lines
        );
        for entry in entries {
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\n",
                entry.hash, entry.file, entry.name, entry.start_line, entry.end_line
            ));
        }
        self.atomic_write(&self.hidx_path(repo, tag), out.as_bytes())
    }

    /// Read a `.hidx`, skipping malformed lines with a warning.
    pub fn read_hidx(&self, repo: &str, tag: &str) -> SporaResult<(HidxHeader, Vec<HidxEntry>)> {
        let path = self.hidx_path(repo, tag);
        let raw = std::fs::read_to_string(&path).map_err(|e| self.storage_err(&path, e))?;
        let mut lines = raw.lines();

        let header_line = lines.next().ok_or_else(|| SporaError::CorruptedArtifact {
            path: path.clone(),
            detail: "missing header line".into(),
        })?;
        let header = parse_hidx_header(header_line).ok_or_else(|| {
            SporaError::CorruptedArtifact {
                path: path.clone(),
                detail: format!("bad header: {header_line:?}"),
            }
        })?;

        let mut entries = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            match parse_hidx_entry(line) {
                Some(entry) => entries.push(entry),
                None => warn!("{}: malformed hidx line: {line:?}", path.display()),
            }
        }
        Ok((header, entries))
    }

    // ── tagdates ──

    pub fn write_tagdates(&self, repo: &str, dates: &[(String, String)]) -> SporaResult<()> {
        let mut out = String::new();
        for (date, tag) in dates {
            out.push_str(&format!("{date}\t{tag}\n"));
        }
        self.atomic_write(&self.tagdates_path(repo), out.as_bytes())
    }

    /// Tag → commit date. A missing file yields an empty map (every tag
    /// then resolves to [`NODATE`]).
    pub fn read_tagdates(&self, repo: &str) -> SporaResult<HashMap<String, String>> {
        let path = self.tagdates_path(repo);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| self.storage_err(&path, e))?;
        let mut dates = HashMap::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match line.split_once('\t') {
                Some((date, tag)) => {
                    dates.insert(tag.to_string(), date.to_string());
                }
                None => warn!("{}: malformed tagdates line: {line:?}", path.display()),
            }
        }
        Ok(dates)
    }

    // ── funcdate ──

    pub fn write_funcdate(
        &self,
        repo: &str,
        dates: impl Iterator<Item = (String, String)>,
    ) -> SporaResult<()> {
        let mut out = String::new();
        for (hash, date) in dates {
            out.push_str(&format!("{hash}\t{date}\n"));
        }
        self.atomic_write(&self.funcdate_path(repo), out.as_bytes())
    }

    pub fn read_funcdate(&self, repo: &str) -> SporaResult<HashMap<String, String>> {
        let path = self.funcdate_path(repo);
        let raw = std::fs::read_to_string(&path).map_err(|e| self.storage_err(&path, e))?;
        let mut dates = HashMap::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match line.split_once('\t') {
                Some((hash, date)) => {
                    dates.insert(hash.to_string(), date.to_string());
                }
                None => {
                    return Err(SporaError::CorruptedArtifact {
                        path: path.clone(),
                        detail: format!("malformed funcdate line: {line:?}"),
                    })
                }
            }
        }
        Ok(dates)
    }

    // ── Typed JSON artifacts ──

    pub fn write_initial_sig(&self, repo: &str, sig: &[SigEntry]) -> SporaResult<()> {
        self.write_json(&self.initial_sig_path(repo), &sig)
    }

    pub fn read_initial_sig(&self, repo: &str) -> SporaResult<Vec<SigEntry>> {
        self.load_json(&self.initial_sig_path(repo))
    }

    pub fn write_final_sig(&self, repo: &str, sig: &[SigEntry]) -> SporaResult<()> {
        self.write_json(&self.final_sig_path(repo), &sig)
    }

    pub fn read_final_sig(&self, repo: &str) -> SporaResult<Vec<SigEntry>> {
        self.load_json(&self.final_sig_path(repo))
    }

    pub fn write_veridx(&self, repo: &str, entries: &[VerIdxEntry]) -> SporaResult<()> {
        self.write_json(&self.veridx_path(repo), &entries)
    }

    pub fn read_veridx(&self, repo: &str) -> SporaResult<Vec<VerIdxEntry>> {
        self.load_json(&self.veridx_path(repo))
    }

    pub fn write_weights(&self, repo: &str, weights: &BTreeMap<String, f64>) -> SporaResult<()> {
        self.write_json(&self.weights_path(repo), weights)
    }

    pub fn read_weights(&self, repo: &str) -> SporaResult<HashMap<String, f64>> {
        self.load_json(&self.weights_path(repo))
    }

    pub fn write_versions(&self, repo: &str, versions: &[VersionRecord]) -> SporaResult<()> {
        self.write_json(&self.versions_path(repo), &versions)
    }

    pub fn write_ave_funcs(&self, ave: &BTreeMap<String, u64>) -> SporaResult<()> {
        self.write_json(&self.ave_funcs_path(), ave)
    }

    pub fn read_ave_funcs(&self) -> SporaResult<BTreeMap<String, u64>> {
        self.load_json(&self.ave_funcs_path())
    }

    pub fn write_all_funcs(&self, all: &BTreeMap<String, u64>) -> SporaResult<()> {
        self.write_json(&self.all_funcs_path(), all)
    }

    pub fn write_unique_funcs(&self, entries: &[UniqueEntry]) -> SporaResult<()> {
        self.write_json(&self.unique_funcs_path(), &entries)
    }

    pub fn read_unique_funcs(&self) -> SporaResult<Vec<UniqueEntry>> {
        self.load_json(&self.unique_funcs_path())
    }
}

fn parse_hidx_header(line: &str) -> Option<HidxHeader> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 4 {
        return None;
    }
    Some(HidxHeader {
        repo: fields[0].to_string(),
        files: fields[1].parse().ok()?,
        functions: fields[2].parse().ok()?,
        lines: fields[3].parse().ok()?,
    })
}

fn parse_hidx_entry(line: &str) -> Option<HidxEntry> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 5 {
        return None;
    }
    Some(HidxEntry {
        hash: fields[0].to_string(),
        file: fields[1].to_string(),
        name: fields[2].to_string(),
        start_line: fields[3].parse().ok()?,
        end_line: fields[4].parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ArtifactStore) {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.ensure_layout().unwrap();
        (dir, store)
    }

    #[test]
    fn date_ordering_puts_nodate_last() {
        assert!(date_earlier("2019-04-01", "2020-01-01"));
        assert!(!date_earlier("2020-01-01", "2019-04-01"));
        assert!(date_earlier("2019-04-01", NODATE));
        assert!(!date_earlier(NODATE, "2019-04-01"));
        assert!(!date_earlier(NODATE, NODATE));
    }

    #[test]
    fn hidx_round_trip() {
        let (_dir, store) = store();
        let header = HidxHeader {
            repo: "libfoo".into(),
            files: 2,
            functions: 3,
            lines: 120,
        };
        let entries = vec![
            HidxEntry {
                hash: "aa11".into(),
                file: "src/a.c".into(),
                name: "foo".into(),
                start_line: 10,
                end_line: 22,
            },
            HidxEntry {
                hash: "bb22".into(),
                file: "src/b.c".into(),
                name: "bar".into(),
                start_line: 5,
                end_line: 9,
            },
        ];
        store
            .write_hidx("libfoo", "v1.0", &header, entries.clone().into_iter())
            .unwrap();

        let (read_header, read_entries) = store.read_hidx("libfoo", "v1.0").unwrap();
        assert_eq!(read_header, header);
        assert_eq!(read_entries, entries);
        assert_eq!(store.list_hidx_tags("libfoo").unwrap(), vec!["v1.0"]);
        assert_eq!(store.list_collected_repos().unwrap(), vec!["libfoo"]);
    }

    #[test]
    fn hidx_skips_malformed_lines() {
        let (_dir, store) = store();
        let path = store.hidx_path("r", "v1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "r\t1\t1\t10\naa\tf.c\tmain\t1\t5\nbroken line without tabs\n",
        )
        .unwrap();

        let (_, entries) = store.read_hidx("r", "v1").unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn corrupted_json_fails_fast() {
        let (_dir, store) = store();
        std::fs::write(store.initial_sig_path("r"), "[{not json").unwrap();
        match store.read_initial_sig("r") {
            Err(SporaError::CorruptedArtifact { .. }) => {}
            other => panic!("expected CorruptedArtifact, got {other:?}"),
        }
    }

    #[test]
    fn sig_and_meta_round_trip() {
        let (_dir, store) = store();
        let sig = vec![
            SigEntry {
                hash: "aa".into(),
                vers: vec![0, 2],
            },
            SigEntry {
                hash: "bb".into(),
                vers: vec![1],
            },
        ];
        store.write_initial_sig("r", &sig).unwrap();
        assert_eq!(store.read_initial_sig("r").unwrap(), sig);

        let mut ave = BTreeMap::new();
        ave.insert("r".to_string(), 7u64);
        store.write_ave_funcs(&ave).unwrap();
        assert_eq!(store.read_ave_funcs().unwrap(), ave);

        let unique = vec![UniqueEntry {
            hash: "aa".into(),
            oss: vec!["r".into()],
        }];
        store.write_unique_funcs(&unique).unwrap();
        assert_eq!(store.read_unique_funcs().unwrap(), unique);
        // The owner list serializes under the original "OSS" key.
        let raw = std::fs::read_to_string(store.unique_funcs_path()).unwrap();
        assert!(raw.contains("\"OSS\""));
    }

    #[test]
    fn atomic_write_replaces_existing_content() {
        let (_dir, store) = store();
        let path = store.tagdates_path("r");
        store.atomic_write(&path, b"first").unwrap();
        store.atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn tagdates_round_trip_with_nodate() {
        let (_dir, store) = store();
        store
            .write_tagdates(
                "r",
                &[
                    ("2021-05-04".into(), "v2".into()),
                    (NODATE.into(), "v1".into()),
                ],
            )
            .unwrap();
        let dates = store.read_tagdates("r").unwrap();
        assert_eq!(dates.get("v2").map(String::as_str), Some("2021-05-04"));
        assert_eq!(dates.get("v1").map(String::as_str), Some(NODATE));
        // Missing file is an empty map, not an error.
        assert!(store.read_tagdates("absent").unwrap().is_empty());
    }
}
