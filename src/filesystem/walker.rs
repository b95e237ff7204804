//! Full-depth traversal feeding the search index.
//!
//! Hidden directories are pruned as a whole and junk files are left out,
//! so the index stays dense. Interactive listings never go through here.

use std::path::Path;
use std::sync::Arc;

use walkdir::WalkDir;

use crate::protocol::{FileEntry, StorageError, StorageResult};

use super::filter::FilterPolicy;
use super::operations::entry_from_metadata;
use super::path_utils;

#[derive(Clone)]
pub struct RecursiveWalker {
    filter: Arc<FilterPolicy>,
}

impl RecursiveWalker {
    pub fn new(filter: Arc<FilterPolicy>) -> Self {
        Self { filter }
    }

    /// Every indexable entry under `root`, depth-first, root excluded.
    ///
    /// Blocking; run it on a blocking thread. Unreadable entries are logged
    /// and skipped. A missing or non-directory root is an error so callers
    /// never mistake an unmounted disk for an empty one.
    pub fn walk_all(&self, root: &Path, show_hidden: bool) -> StorageResult<Vec<FileEntry>> {
        let root_meta = std::fs::metadata(root).map_err(|e| StorageError::from_io(e, root))?;
        if !root_meta.is_dir() {
            return Err(StorageError::NotADirectory {
                path: root.display().to_string(),
            });
        }

        let filter = self.filter.clone();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                show_hidden || !filter.is_hidden(&entry.file_name().to_string_lossy())
            });

        let mut entries: Vec<FileEntry> = Vec::new();

        for item in walker {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };

            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().is_dir();
            if !is_dir && self.filter.is_project_junk(&name) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };

            let relative = match entry.path().strip_prefix(root) {
                Ok(rel) => path_utils::to_protocol_path(rel),
                Err(_) => continue,
            };

            let item_count = if is_dir { count_children(entry.path()) } else { 0 };
            entries.push(entry_from_metadata(&name, relative, &metadata, item_count));
        }

        Ok(entries)
    }
}

/// Raw immediate children, filtered or not, so counts match single-level listings
fn count_children(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|children| children.count() as u64)
        .unwrap_or(0)
}
