use std::path::PathBuf;

use crate::protocol::{StorageError, StorageResult};

use super::config::Mount;
use super::path_utils;

/// Maps storage names to mount roots and confines sub paths to them.
///
/// The mount table is fixed at construction; lookups ignore case.
#[derive(Debug)]
pub struct PathResolver {
    mounts: Vec<Mount>,
}

/// A sub path that passed confinement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Canonical storage name as configured
    pub storage: String,
    pub root: PathBuf,
    pub absolute: PathBuf,
    /// `absolute` relative to `root`, empty for the root itself
    pub relative: PathBuf,
}

impl ResolvedPath {
    pub fn is_root(&self) -> bool {
        self.relative.as_os_str().is_empty()
    }

    pub fn protocol_path(&self) -> String {
        path_utils::to_protocol_path(&self.relative)
    }
}

impl PathResolver {
    pub fn new(mounts: Vec<Mount>) -> Self {
        let mounts = mounts
            .into_iter()
            .map(|m| Mount {
                root: path_utils::clean(&m.root),
                name: m.name,
            })
            .collect();
        Self { mounts }
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// Look up a mount by name, ignoring case
    pub fn mount(&self, storage: &str) -> StorageResult<&Mount> {
        let wanted = storage.to_lowercase();
        self.mounts
            .iter()
            .find(|m| m.name.to_lowercase() == wanted)
            .ok_or_else(|| StorageError::StorageNotFound {
                storage: storage.to_string(),
            })
    }

    /// Resolve `sub_path` inside `storage`.
    ///
    /// The path is joined onto the root and cleaned lexically; if the
    /// result is not a descendant of the root (or the root itself) the
    /// call fails with `PathEscape`. Symlinks are not followed here.
    pub fn resolve(&self, storage: &str, sub_path: &str) -> StorageResult<ResolvedPath> {
        let mount = self.mount(storage)?;
        let absolute = path_utils::join_untrusted(&mount.root, sub_path);

        let relative = match absolute.strip_prefix(&mount.root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => {
                tracing::debug!(
                    "Rejected path '{}' for storage {}: resolves to {}",
                    sub_path,
                    mount.name,
                    absolute.display()
                );
                return Err(StorageError::PathEscape {
                    storage: mount.name.clone(),
                    attempted_path: sub_path.to_string(),
                });
            }
        };

        Ok(ResolvedPath {
            storage: mount.name.clone(),
            root: mount.root.clone(),
            absolute,
            relative,
        })
    }

    /// Resolve and return only the absolute path
    pub fn real_path(&self, storage: &str, sub_path: &str) -> StorageResult<PathBuf> {
        self.resolve(storage, sub_path).map(|r| r.absolute)
    }
}
