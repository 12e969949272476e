//! Per-directory git status cache and the probe behind it.
//!
//! The cache is owned by the dispatcher; the poller refreshes it by
//! running `git` against each active directory and matching the remote
//! URL against tracked repositories. Scheduler gates and the GitHub sync
//! loop read branch, dirtiness, and repository id from here.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cached git status for one directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatusEntry {
    /// Current branch, when HEAD is on one.
    pub branch: Option<String>,

    /// Number of changed files (staged + unstaged + untracked).
    pub changed_files: u32,

    /// Repository tracking the directory's origin remote, when matched.
    pub repository_id: Option<String>,

    /// Raw origin remote URL, when the directory has one.
    pub remote_url: Option<String>,

    /// When the entry was last refreshed.
    pub refreshed_at: DateTime<Utc>,
}

/// Directory-id keyed cache of git status entries.
#[derive(Debug, Default)]
pub struct GitStatusCache {
    entries: HashMap<String, GitStatusEntry>,
}

impl GitStatusCache {
    /// An empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The entry for a directory, if tracked.
    #[must_use]
    pub fn get(&self, directory_id: &str) -> Option<&GitStatusEntry> {
        self.entries.get(directory_id)
    }

    /// Insert or replace an entry.
    pub fn insert(&mut self, directory_id: String, entry: GitStatusEntry) {
        self.entries.insert(directory_id, entry);
    }

    /// Drop an entry (on directory archive).
    pub fn evict(&mut self, directory_id: &str) {
        self.entries.remove(directory_id);
    }

    /// Snapshot of all entries.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, GitStatusEntry> {
        self.entries.clone()
    }
}

/// Raw probe result before repository matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitProbe {
    /// Current branch, when HEAD is on one.
    pub branch: Option<String>,

    /// Number of changed files.
    pub changed_files: u32,

    /// Origin remote URL, when configured.
    pub remote_url: Option<String>,
}

/// Probe a working directory with `git`.
///
/// # Errors
///
/// Fails when the path is not a git work tree or `git` cannot be run.
pub async fn probe_directory(path: &str) -> anyhow::Result<GitProbe> {
    let branch_output = run_git(path, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    let branch = match branch_output.trim() {
        "" | "HEAD" => None,
        name => Some(name.to_owned()),
    };

    let status_output = run_git(path, &["status", "--porcelain"]).await?;
    let changed_files = status_output.lines().filter(|l| !l.trim().is_empty()).count() as u32;

    // A missing origin remote is not an error.
    let remote_url = match run_git(path, &["remote", "get-url", "origin"]).await {
        Ok(url) => {
            let trimmed = url.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            }
        }
        Err(_) => None,
    };

    Ok(GitProbe {
        branch,
        changed_files,
        remote_url,
    })
}

async fn run_git(path: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::process::Command::new("git")
        .current_dir(path)
        .args(args)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
