use std::path::Path;

/// Capacity of the filesystem holding `path`, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[cfg(unix)]
pub fn disk_usage(path: &Path) -> std::io::Result<DiskUsage> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out pointer.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let block_size = stat.f_frsize as u64;
    let total = (stat.f_blocks as u64).saturating_mul(block_size);
    let free = (stat.f_bfree as u64).saturating_mul(block_size);
    Ok(DiskUsage {
        total,
        used: total.saturating_sub(free),
        free,
    })
}

#[cfg(not(unix))]
pub fn disk_usage(_path: &Path) -> std::io::Result<DiskUsage> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "disk usage is only available on unix",
    ))
}

/// Whether `path` sits on a different device than its parent directory.
///
/// A missing path is not mounted. If only the parent cannot be inspected
/// the path is assumed to be a filesystem root.
#[cfg(unix)]
pub fn is_mount_point(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return false;
    };
    let Some(parent) = path.parent() else {
        return true;
    };
    match std::fs::symlink_metadata(parent) {
        Ok(parent_meta) => meta.dev() != parent_meta.dev(),
        Err(_) => true,
    }
}

#[cfg(not(unix))]
pub fn is_mount_point(path: &Path) -> bool {
    path.exists()
}

/// `ls`-style mode string, e.g. `drwxr-xr-x`
#[cfg(unix)]
pub fn format_mode(metadata: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode();
    let kind = if metadata.is_dir() {
        'd'
    } else if metadata.file_type().is_symlink() {
        'L'
    } else {
        '-'
    };
    let user = format_rwx((mode >> 6) & 0o7);
    let group = format_rwx((mode >> 3) & 0o7);
    let other = format_rwx(mode & 0o7);

    format!("{}{}{}{}", kind, user, group, other)
}

#[cfg(not(unix))]
pub fn format_mode(metadata: &std::fs::Metadata) -> String {
    let kind = if metadata.is_dir() { 'd' } else { '-' };
    let rw = if metadata.permissions().readonly() { "r--" } else { "rw-" };
    format!("{}{}{}{}", kind, rw, rw, rw)
}

#[cfg(unix)]
fn format_rwx(bits: u32) -> String {
    format!(
        "{}{}{}",
        if bits & 4 != 0 { "r" } else { "-" },
        if bits & 2 != 0 { "w" } else { "-" },
        if bits & 1 != 0 { "x" } else { "-" },
    )
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_format_mode_for_directory_and_file() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("a.txt");
        std::fs::write(&file, "x").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o640)).unwrap();

        let dir_mode = format_mode(&std::fs::metadata(temp.path()).unwrap());
        assert!(dir_mode.starts_with('d'));
        assert_eq!(format_mode(&std::fs::metadata(&file).unwrap()), "-rw-r-----");
    }

    #[test]
    fn test_disk_usage_reports_consistent_totals() {
        let temp = tempfile::TempDir::new().unwrap();
        let usage = disk_usage(temp.path()).unwrap();
        assert!(usage.total > 0);
        assert_eq!(usage.used + usage.free, usage.total);
    }

    #[test]
    fn test_missing_path_is_not_mounted() {
        let temp = tempfile::TempDir::new().unwrap();
        assert!(!is_mount_point(&temp.path().join("missing")));
    }
}
