use std::path::PathBuf;
use std::time::Duration;

use super::cache::DEFAULT_CAPACITY;
use super::filter::FilterPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} is not a number: {value}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{key} must be greater than zero")]
    NotPositive { key: &'static str },
    #[error("failed to read filter policy {}: {source}", .path.display())]
    ReadPolicy {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid filter policy: {0}")]
    InvalidPolicy(#[from] serde_json::Error),
}

/// A named root directory exposed as a storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub name: String,
    pub root: PathBuf,
}

/// Configuration for the storage service
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Storage mounts, in declaration order
    pub mounts: Vec<Mount>,

    /// SQLite file backing the search index
    pub index_path: PathBuf,

    /// How long a cached listing stays valid
    pub cache_ttl: Duration,

    /// Most listings held in the cache at once
    pub cache_capacity: u64,

    /// Period of the full reindex pass
    pub reindex_interval: Duration,

    /// Width of the stat worker pool used for interactive listings
    pub list_workers: usize,

    /// Hidden and junk classification rules
    pub filter: FilterPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mounts: parse_storage_mounts(DEFAULT_MOUNTS),
            index_path: PathBuf::from("storage_index.db"),
            cache_ttl: Duration::from_secs(60),
            cache_capacity: DEFAULT_CAPACITY,
            reindex_interval: Duration::from_secs(30 * 60),
            list_workers: 16,
            filter: FilterPolicy::default(),
        }
    }
}

const DEFAULT_MOUNTS: &str = "default:/tmp";

impl StorageConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(mounts) = lookup("STORAGE_MOUNTS") {
            config.mounts = parse_storage_mounts(&mounts);
        }
        if let Some(path) = lookup("STORAGE_INDEX_PATH") {
            config.index_path = PathBuf::from(path);
        }
        if let Some(minutes) = lookup("STORAGE_REINDEX_MINUTES") {
            let parsed: u64 = minutes.trim().parse().map_err(|_| ConfigError::InvalidNumber {
                key: "STORAGE_REINDEX_MINUTES",
                value: minutes.clone(),
            })?;
            if parsed == 0 {
                return Err(ConfigError::NotPositive {
                    key: "STORAGE_REINDEX_MINUTES",
                });
            }
            config.reindex_interval = Duration::from_secs(parsed * 60);
        }
        if let Some(path) = lookup("STORAGE_FILTER_PATH") {
            config.filter = FilterPolicy::load(&PathBuf::from(path))?;
        }

        Ok(config)
    }
}

/// Parse `"name1:/path1,name2:/path2"` into mounts.
///
/// Malformed pairs are skipped. A name that repeats (ignoring case) keeps
/// its first definition, since lookups are case-insensitive.
pub fn parse_storage_mounts(raw: &str) -> Vec<Mount> {
    let mut mounts: Vec<Mount> = Vec::new();

    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((name, path)) = pair.split_once(':') else {
            tracing::warn!("Ignoring storage mount without ':' separator: {}", pair);
            continue;
        };
        let (name, path) = (name.trim(), path.trim());
        if name.is_empty() || path.is_empty() {
            continue;
        }
        if mounts.iter().any(|m| m.name.to_lowercase() == name.to_lowercase()) {
            tracing::warn!("Duplicate storage name '{}' ignored", name);
            continue;
        }
        mounts.push(Mount {
            name: name.to_string(),
            root: PathBuf::from(path),
        });
    }

    mounts
}
