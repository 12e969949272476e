//! Daemon configuration: defaults, then the TOML file, then environment
//! overrides.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::utils::paths;

/// How the tracked branch for reconciliation is derived per project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BranchStrategy {
    /// Only the pinned branch (may be none).
    PinnedOnly,

    /// Only the currently checked-out branch.
    CurrentOnly,

    /// Pinned branch, falling back to the current branch.
    #[default]
    PinnedThenCurrent,
}

/// GitHub integration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// Whether GitHub commands and the sync loop run at all.
    pub enabled: bool,

    /// Explicit token; falls back to `GITHUB_TOKEN`, then `gh auth token`.
    pub token: Option<String>,

    /// Sync loop interval in seconds.
    pub poll_interval_secs: u64,

    /// Tracked-branch derivation strategy.
    pub branch_strategy: BranchStrategy,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token: None,
            poll_interval_secs: 60,
            branch_strategy: BranchStrategy::default(),
        }
    }
}

/// Linear integration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearConfig {
    /// Whether Linear import is available.
    pub enabled: bool,

    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key_env: "LINEAR_API_KEY".to_owned(),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database path.
    pub database_path: PathBuf,

    /// Unix socket path.
    pub socket_path: PathBuf,

    /// Git status poller interval in seconds.
    pub git_status_poll_interval_secs: u64,

    /// GitHub settings.
    pub github: GitHubConfig,

    /// Linear settings.
    pub linear: LinearConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: paths::database_path(),
            socket_path: paths::socket_path(),
            git_status_poll_interval_secs: 15,
            github: GitHubConfig::default(),
            linear: LinearConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the TOML file (when present),
    /// then environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error when an existing config file cannot be read or
    /// parsed.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map_or_else(paths::config_path, Path::to_path_buf);

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("parse config file {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(db) = std::env::var("CONDUCTOR_DATABASE") {
            if !db.trim().is_empty() {
                config.database_path = PathBuf::from(db);
            }
        }
        if let Ok(socket) = std::env::var("CONDUCTOR_SOCKET") {
            if !socket.trim().is_empty() {
                config.socket_path = PathBuf::from(socket);
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_integrations() {
        let config = Config::default();
        assert!(config.github.enabled);
        assert!(config.linear.enabled);
        assert_eq!(config.github.branch_strategy, BranchStrategy::PinnedThenCurrent);
        assert_eq!(config.linear.api_key_env, "LINEAR_API_KEY");
    }

    #[test]
    fn toml_round_trips() {
        let config = Config::default();
        let raw = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&raw).unwrap();
        assert_eq!(parsed, config);
    }
}
