//! Git subprocess plumbing
//!
//! Thin wrappers over the git CLI (maximum compatibility with auth setups
//! and odd repository states). Every invocation runs under the configured
//! deadline and the shared cancellation token.

use crate::runtime::cancel::CancelToken;
use crate::runtime::subprocess::run_with_deadline;
use crate::SporaResult;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Churn stats of one tag relative to its parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeStats {
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
}

/// Handle to one local checkout.
pub struct GitRepo {
    dir: PathBuf,
    deadline: Duration,
    cancel: CancelToken,
}

impl GitRepo {
    pub fn open(dir: impl Into<PathBuf>, deadline: Duration, cancel: CancelToken) -> Self {
        Self {
            dir: dir.into(),
            deadline,
            cancel,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn run(&self, args: &[&str]) -> SporaResult<String> {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.dir).args(args);
        let output = run_with_deadline(cmd, "git", self.deadline, &self.cancel)?;
        Ok(output.stdout)
    }

    /// All tags, newest creation date first.
    pub fn tags(&self) -> SporaResult<Vec<String>> {
        let out = self.run(&["tag", "--sort=-creatordate"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Force-checkout a tag, discarding local modifications.
    pub fn checkout(&self, tag: &str) -> SporaResult<()> {
        self.run(&["checkout", "-f", tag])?;
        Ok(())
    }

    pub fn tag_commit(&self, tag: &str) -> SporaResult<String> {
        Ok(self.run(&["rev-list", "-n", "1", tag])?.trim().to_string())
    }

    pub fn tag_author(&self, tag: &str) -> SporaResult<String> {
        Ok(self
            .run(&["log", "-1", "--format=%an", tag])?
            .trim()
            .to_string())
    }

    pub fn tag_subject(&self, tag: &str) -> SporaResult<String> {
        let message = self.run(&["log", "-1", "--format=%B", tag])?;
        Ok(message.lines().next().unwrap_or("").trim().to_string())
    }

    /// Committer date of the tag's commit as ISO `YYYY-MM-DD`, or `None`
    /// when git reports something unparseable.
    pub fn tag_date(&self, tag: &str) -> SporaResult<Option<String>> {
        let out = self.run(&["log", "-1", "--format=%ct", tag])?;
        let date = out
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.format("%Y-%m-%d").to_string());
        Ok(date)
    }

    /// Diff stats against the tag's first parent. The first tag of a
    /// history has no parent; that is reported as zero churn.
    pub fn tag_numstat(&self, tag: &str) -> ChangeStats {
        match self.run(&["diff", "--numstat", &format!("{tag}^"), tag]) {
            Ok(out) => parse_numstat(&out),
            Err(_) => ChangeStats::default(),
        }
    }
}

fn parse_numstat(out: &str) -> ChangeStats {
    let mut stats = ChangeStats::default();
    for line in out.lines() {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 3 {
            continue;
        }
        stats.files_changed += 1;
        // Binary files report "-" counts.
        stats.insertions += fields[0].parse::<u32>().unwrap_or(0);
        stats.deletions += fields[1].parse::<u32>().unwrap_or(0);
    }
    stats
}

/// Shallow-clone a repository URL: `--depth 1 --single-branch --no-tags`.
pub fn shallow_clone(
    url: &str,
    dest: &Path,
    deadline: Duration,
    cancel: &CancelToken,
) -> SporaResult<()> {
    let mut cmd = Command::new("git");
    cmd.args([
        "clone",
        "--depth",
        "1",
        "--single-branch",
        "--no-tags",
        url,
    ])
    .arg(dest);
    run_with_deadline(cmd, "git", deadline, cancel)?;
    Ok(())
}

/// Check that git exists on this system.
pub fn is_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
