//! Storage service data types
//!
//! Everything here is handed to the transport layer as-is, so all of it
//! serializes with serde.

use serde::{Deserialize, Serialize};

/// One filesystem object as seen through a storage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// Path relative to the storage root, `/`-separated, no leading slash
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified: i64, // Unix timestamp ms
    /// Lowercase, without the dot
    pub extension: String,
    /// Immediate children (directories only)
    pub item_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub name: String,
    pub path: String,
    pub total_size: u64,
    pub used_size: u64,
    pub free_size: u64,
    pub is_mounted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchPage {
    pub files: Vec<FileEntry>,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexPhase {
    Stale,
    Indexing,
    Fresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStatus {
    pub storage: String,
    pub phase: IndexPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_indexed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageError {
    #[error("storage '{storage}' not found")]
    StorageNotFound { storage: String },
    #[error("invalid path: '{attempted_path}' escapes storage '{storage}'")]
    PathEscape {
        storage: String,
        attempted_path: String,
    },
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("not a directory: {path}")]
    NotADirectory { path: String },
    #[error("io error: {message}")]
    IoError { message: String },
    #[error("index unavailable: {message}")]
    IndexUnavailable { message: String },
    #[error("invalid input: {message}")]
    ValidationError { message: String },
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    /// Map an I/O failure on `path`, keeping "not found" distinguishable
    pub fn from_io(err: std::io::Error, path: &std::path::Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound {
                path: path.display().to_string(),
            },
            _ => StorageError::IoError {
                message: format!("{}: {}", path.display(), err),
            },
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        StorageError::ValidationError {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::IoError {
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::IndexUnavailable {
            message: err.to_string(),
        }
    }
}
