use std::path::PathBuf;

/// Base data directory (`~/.conductor`).
#[must_use]
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conductor")
}

/// Default database path.
#[must_use]
pub fn database_path() -> PathBuf {
    data_dir().join("conductor.db")
}

/// Default unix socket path.
#[must_use]
pub fn socket_path() -> PathBuf {
    data_dir().join("conductor.sock")
}

/// Default config file path.
#[must_use]
pub fn config_path() -> PathBuf {
    data_dir().join("config.toml")
}

/// Default log directory.
#[must_use]
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}
