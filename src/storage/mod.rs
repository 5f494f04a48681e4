//! Persistent storage
//!
//! Worker settings live as JSON under the platform data directory.

pub mod settings;

use std::path::PathBuf;

use directories::ProjectDirs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not determine a data directory for this platform")]
    NoDataDir,
}

/// Application data directory, e.g. `~/.local/share/worker-runner` on Linux
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    ProjectDirs::from("dev", "worker-runner", "worker-runner")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StorageError::NoDataDir)
}
