use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::protocol::{FileEntry, StorageError, StorageInfo, StorageResult};

use super::mime;
use super::path_utils;
use super::platform;
use super::security::{PathResolver, ResolvedPath};

/// Raw filesystem operations on storages. Every call resolves its paths
/// through the [`PathResolver`] before touching the disk.
#[derive(Clone)]
pub struct StorageDriver {
    resolver: Arc<PathResolver>,
}

/// A file opened for download or preview
#[derive(Debug)]
pub struct OpenedFile {
    pub real_path: PathBuf,
    pub size: u64,
    pub content_type: String,
    pub file: fs::File,
}

impl StorageDriver {
    pub fn new(resolver: Arc<PathResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Capacity and mount state of every storage
    pub fn list_storages(&self) -> Vec<StorageInfo> {
        self.resolver
            .mounts()
            .iter()
            .map(|mount| {
                let usage = match platform::disk_usage(&mount.root) {
                    Ok(usage) => usage,
                    Err(e) => {
                        tracing::warn!(
                            "Failed to read disk usage for {} ({}): {}",
                            mount.name,
                            mount.root.display(),
                            e
                        );
                        platform::DiskUsage::default()
                    }
                };
                StorageInfo {
                    name: mount.name.clone(),
                    path: mount.root.display().to_string(),
                    total_size: usage.total,
                    used_size: usage.used,
                    free_size: usage.free,
                    is_mounted: platform::is_mount_point(&mount.root),
                }
            })
            .collect()
    }

    /// Create a directory and any missing parents. Existing directories are fine.
    pub async fn create_folder(&self, storage: &str, path: &str) -> StorageResult<()> {
        let target = self.resolver.resolve(storage, path)?;
        path_utils::validate_parent_components(&target.root, &target.absolute)?;
        fs::create_dir_all(&target.absolute)
            .await
            .map_err(|e| StorageError::from_io(e, &target.absolute))
    }

    /// Write `src` to `path`, creating parents and replacing any existing file.
    /// Returns the number of bytes written.
    pub async fn save_file<R>(&self, storage: &str, path: &str, src: &mut R) -> StorageResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let target = self.resolver.resolve(storage, path)?;
        if target.is_root() {
            return Err(StorageError::validation("a file name is required"));
        }
        if fs::metadata(&target.absolute).await.is_ok_and(|m| m.is_dir()) {
            return Err(StorageError::validation(format!(
                "{} is a directory",
                target.protocol_path()
            )));
        }
        path_utils::create_parent_dirs_safe(&target.root, &target.absolute).await?;

        let mut dst = fs::File::create(&target.absolute)
            .await
            .map_err(|e| StorageError::from_io(e, &target.absolute))?;
        let written = tokio::io::copy(src, &mut dst).await?;
        dst.flush().await?;
        Ok(written)
    }

    pub async fn open_file(&self, storage: &str, path: &str) -> StorageResult<OpenedFile> {
        let target = self.resolver.resolve(storage, path)?;
        let mut file = fs::File::open(&target.absolute)
            .await
            .map_err(|e| StorageError::from_io(e, &target.absolute))?;
        let metadata = file.metadata().await?;
        if metadata.is_dir() {
            return Err(StorageError::validation(format!(
                "{} is a directory",
                target.protocol_path()
            )));
        }

        let name = file_name_of(&target.absolute);
        let content_type = if mime::guess_from_extension(&name) == "application/octet-stream" {
            let mut head = [0u8; 512];
            let read = file.read(&mut head).await?;
            // reopen so the caller streams from the first byte
            let content_type = mime::content_type_for(&name, &head[..read]);
            file = fs::File::open(&target.absolute).await?;
            content_type
        } else {
            mime::guess_from_extension(&name).to_string()
        };

        Ok(OpenedFile {
            real_path: target.absolute,
            size: metadata.len(),
            content_type,
            file,
        })
    }

    pub async fn rename(&self, storage: &str, old_path: &str, new_path: &str) -> StorageResult<()> {
        let source = self.resolver.resolve(storage, old_path)?;
        let target = self.resolver.resolve(storage, new_path)?;
        if source.is_root() || target.is_root() {
            return Err(StorageError::validation("the storage root cannot be renamed"));
        }
        fs::rename(&source.absolute, &target.absolute)
            .await
            .map_err(|e| StorageError::from_io(e, &source.absolute))
    }

    /// Copy a file or a whole directory tree
    pub async fn copy(&self, storage: &str, src_path: &str, dst_path: &str) -> StorageResult<()> {
        let source = self.resolver.resolve(storage, src_path)?;
        let target = self.resolver.resolve(storage, dst_path)?;
        if source.absolute == target.absolute {
            return Err(StorageError::validation(format!(
                "cannot copy {} onto itself",
                source.protocol_path()
            )));
        }

        let metadata = fs::metadata(&source.absolute)
            .await
            .map_err(|e| StorageError::from_io(e, &source.absolute))?;
        if let Ok(existing) = fs::metadata(&target.absolute).await {
            if same_inode(&metadata, &existing) {
                return Err(StorageError::validation(format!(
                    "{} and {} are the same file",
                    source.protocol_path(),
                    target.protocol_path()
                )));
            }
        }

        if metadata.is_dir() {
            if target.absolute.starts_with(&source.absolute) {
                return Err(StorageError::validation(format!(
                    "cannot copy {} into itself",
                    source.protocol_path()
                )));
            }
            copy_dir_recursive(&source.absolute, &target.absolute).await
        } else {
            copy_file(&source.absolute, &target.absolute).await
        }
    }

    /// Remove a file or directory tree. Missing paths are not an error.
    pub async fn delete(&self, storage: &str, path: &str) -> StorageResult<()> {
        let target = self.resolver.resolve(storage, path)?;
        if target.is_root() {
            return Err(StorageError::validation("the storage root cannot be deleted"));
        }

        let metadata = match fs::symlink_metadata(&target.absolute).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::from_io(e, &target.absolute)),
        };

        let result = if metadata.is_dir() {
            fs::remove_dir_all(&target.absolute).await
        } else {
            fs::remove_file(&target.absolute).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(e, &target.absolute)),
        }
    }

    /// Metadata for a single path
    pub async fn stat(&self, storage: &str, path: &str) -> StorageResult<FileEntry> {
        let target = self.resolver.resolve(storage, path)?;
        let name = file_name_of(&target.absolute);
        build_file_entry(&target.absolute, &name, target.protocol_path()).await
    }

    pub async fn is_directory(&self, storage: &str, path: &str) -> StorageResult<bool> {
        let target = self.resolver.resolve(storage, path)?;
        let metadata = fs::metadata(&target.absolute)
            .await
            .map_err(|e| StorageError::from_io(e, &target.absolute))?;
        Ok(metadata.is_dir())
    }

    /// Pick a free sibling name for a copy of `path`:
    /// `name_copy.ext`, then `name_copy_1.ext`, `name_copy_2.ext`, ...
    pub async fn duplicate_target(&self, storage: &str, path: &str) -> StorageResult<ResolvedPath> {
        let source = self.resolver.resolve(storage, path)?;
        if source.is_root() {
            return Err(StorageError::validation("the storage root cannot be duplicated"));
        }

        let parent = source
            .relative
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let name = file_name_of(&source.relative);
        let (stem, ext) = path_utils::split_extension(&name);

        let mut counter = 0u64;
        loop {
            let candidate = if counter == 0 {
                format!("{}_copy{}", stem, ext)
            } else {
                format!("{}_copy_{}{}", stem, counter, ext)
            };
            let relative = parent.join(candidate);
            let resolved = self
                .resolver
                .resolve(storage, &path_utils::to_protocol_path(&relative))?;
            if !fs::try_exists(&resolved.absolute).await? {
                return Ok(resolved);
            }
            counter += 1;
        }
    }
}

/// Build a [`FileEntry`] for `path`, counting children for directories.
/// Does not follow a final symlink.
pub async fn build_file_entry(
    path: &Path,
    name: &str,
    relative: String,
) -> StorageResult<FileEntry> {
    let metadata = fs::symlink_metadata(path)
        .await
        .map_err(|e| StorageError::from_io(e, path))?;

    let item_count = if metadata.is_dir() {
        count_children(path).await
    } else {
        0
    };

    Ok(entry_from_metadata(name, relative, &metadata, item_count))
}

pub fn entry_from_metadata(
    name: &str,
    relative: String,
    metadata: &std::fs::Metadata,
    item_count: u64,
) -> FileEntry {
    let is_directory = metadata.is_dir();
    let modified = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    FileEntry {
        name: name.to_string(),
        path: relative,
        is_directory,
        size: metadata.len(),
        modified,
        extension: if is_directory {
            String::new()
        } else {
            path_utils::extension_of(name)
        },
        item_count,
        mode: Some(platform::format_mode(metadata)),
    }
}

/// Immediate children of a directory; unreadable directories count as empty
async fn count_children(path: &Path) -> u64 {
    let Ok(mut read_dir) = fs::read_dir(path).await else {
        return 0;
    };
    let mut count = 0;
    while let Ok(Some(_)) = read_dir.next_entry().await {
        count += 1;
    }
    count
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(unix)]
fn same_inode(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    a.dev() == b.dev() && a.ino() == b.ino()
}

#[cfg(not(unix))]
fn same_inode(_a: &std::fs::Metadata, _b: &std::fs::Metadata) -> bool {
    false
}

/// Streamed byte copy, synced to disk before returning
async fn copy_file(src: &Path, dst: &Path) -> StorageResult<()> {
    let mut input = fs::File::open(src)
        .await
        .map_err(|e| StorageError::from_io(e, src))?;
    let mut output = fs::File::create(dst)
        .await
        .map_err(|e| StorageError::from_io(e, dst))?;
    tokio::io::copy(&mut input, &mut output).await?;
    output.sync_all().await?;
    Ok(())
}

async fn copy_dir_recursive(src: &Path, dst: &Path) -> StorageResult<()> {
    // Explicit stack instead of async recursion
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to)
            .await
            .map_err(|e| StorageError::from_io(e, &to))?;

        let mut read_dir = fs::read_dir(&from)
            .await
            .map_err(|e| StorageError::from_io(e, &from))?;

        while let Some(entry) = read_dir.next_entry().await? {
            let entry_path = entry.path();
            let dest_path = to.join(entry.file_name());
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push((entry_path, dest_path));
            } else {
                copy_file(&entry_path, &dest_path).await?;
            }
        }
    }

    Ok(())
}
