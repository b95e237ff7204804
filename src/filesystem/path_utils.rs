use std::path::{Component, Path, PathBuf};

use crate::protocol::{StorageError, StorageResult};

/// Check that no existing component between `root` and `path` is a file.
/// Catches targets like `notes.txt/new-dir` before the OS reports ENOTDIR.
pub fn validate_parent_components(root: &Path, path: &Path) -> StorageResult<()> {
    let Ok(relative) = path.strip_prefix(root) else {
        return Ok(());
    };
    let mut current = root.to_path_buf();
    for component in relative.components() {
        current.push(component);
        if current.is_file() {
            return Err(StorageError::NotADirectory {
                path: current.display().to_string(),
            });
        }
    }
    Ok(())
}

/// Create the parent directories of `path`, refusing to treat a file as one
pub async fn create_parent_dirs_safe(root: &Path, path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        validate_parent_components(root, parent)?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::from_io(e, parent))?;
    }
    Ok(())
}

/// Lexically normalize a path: drop `.`, fold `..` into its parent and
/// collapse repeated separators. Never touches the filesystem.
///
/// `..` at the top of an absolute path stays at the root; at the top of a
/// relative path it is kept, so the result still points outside.
pub fn clean(path: &Path) -> PathBuf {
    let mut parts: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return PathBuf::from(".");
    }
    parts.iter().collect()
}

/// Join an untrusted sub path onto `root`. Absolute and prefixed
/// components in `sub` are treated as relative, the way `Path::join`
/// would not.
pub fn join_untrusted(root: &Path, sub: &str) -> PathBuf {
    let mut joined = root.to_path_buf();
    for component in Path::new(sub).components() {
        match component {
            Component::RootDir | Component::Prefix(_) => {}
            other => joined.push(other.as_os_str()),
        }
    }
    clean(&joined)
}

/// Render a storage-relative path with `/` separators and no leading slash
pub fn to_protocol_path(relative: &Path) -> String {
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    parts.join("/")
}

/// Lowercase extension without the dot, taken from the last `.` in the
/// name (so `.gitignore` yields `gitignore`)
pub fn extension_of(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) if idx + 1 < name.len() => name[idx + 1..].to_lowercase(),
        _ => String::new(),
    }
}

/// Split a file name into stem and dotted extension, the way the
/// duplicate naming scheme needs it (`report.txt` -> `report`, `.txt`)
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) => name.split_at(idx),
        None => (name, ""),
    }
}
