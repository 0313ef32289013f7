//! Filesystem helpers shared by the stager roles
//!
//! Directory listings default to excluding dot-prefixed housekeeping files
//! (control/receipt/thank-you records, stop markers) and return entries
//! oldest-modified-first so streams drain in arrival order. Deletions are
//! best-effort: the roles coordinate purely through the filesystem, so a
//! path vanishing underneath us is a benign race, not an error.

use std::os::unix::fs::MetadataExt;

use anyhow::Context;

/// A timestamp suitable for embedding in a filename to ensure uniqueness,
/// e.g. `1712345678.04` (epoch seconds with two decimal places).
pub fn filename_timestamp() -> String {
    let now = chrono::Utc::now();
    format!(
        "{}.{:02}",
        now.timestamp(),
        now.timestamp_subsec_millis() / 10
    )
}

pub fn is_dotfile(name: &str) -> bool {
    name.starts_with('.')
}

/// List a directory's entry names, oldest mtime first.
///
/// Dotfiles are excluded unless `include_dotfiles` is set. Entries that
/// vanish between listing and stat are skipped.
pub async fn list_dir(
    dir: &std::path::Path,
    include_dotfiles: bool,
) -> anyhow::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", dir))?;
    let mut items: Vec<(i64, i64, String)> = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", dir))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if !include_dotfiles && is_dotfile(&name) {
            continue;
        }
        match entry.metadata().await {
            Ok(md) => items.push((md.mtime(), md.mtime_nsec(), name)),
            Err(_) => continue,
        }
    }
    items.sort();
    Ok(items.into_iter().map(|(_, _, name)| name).collect())
}

/// List a directory's entries as full paths, excluding dotfiles.
///
/// Returns an empty list when the directory cannot be read; the disk
/// governor iterates candidate directories that may not exist yet.
pub async fn list_dir_paths(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return vec![];
    };
    let mut paths = vec![];
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if is_dotfile(&name) {
            continue;
        }
        paths.push(entry.path());
    }
    paths
}

/// One size+mtime sample of a path, for the two-sample stability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Snapshot {
    pub size: u64,
    pub mtime: i64,
    pub mtime_nsec: i64,
}

pub async fn snapshot(path: &std::path::Path) -> Option<Snapshot> {
    let md = tokio::fs::symlink_metadata(path).await.ok()?;
    Some(Snapshot {
        size: md.size(),
        mtime: md.mtime(),
        mtime_nsec: md.mtime_nsec(),
    })
}

/// Seconds since the file was last modified, or `None` if it cannot be
/// statted.
pub fn file_age(path: &std::path::Path) -> Option<std::time::Duration> {
    let md = std::fs::metadata(path).ok()?;
    let mtime = md.modified().ok()?;
    std::time::SystemTime::now().duration_since(mtime).ok()
}

/// Inode change time, or `None` on error.
///
/// Eviction ordering uses ctime rather than mtime: mtime may be inherited
/// from a remote system by rsync, ctime reflects when the file really
/// appeared here.
pub fn ctime_or_none(path: &std::path::Path) -> Option<(i64, i64)> {
    let md = std::fs::symlink_metadata(path).ok()?;
    Some((md.ctime(), md.ctime_nsec()))
}

/// Recursively collect the regular files under a directory.
pub async fn walk_files(dir: &std::path::Path) -> anyhow::Result<Vec<std::path::PathBuf>> {
    let mut files = vec![];
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current)
            .await
            .with_context(|| format!("cannot open directory {:?} for reading", current))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {:?}", current))?
        {
            let path = entry.path();
            let md = tokio::fs::symlink_metadata(&path)
                .await
                .with_context(|| format!("failed reading metadata from {:?}", path))?;
            if md.is_dir() {
                pending.push(path);
            } else if md.is_file() {
                files.push(path);
            }
        }
    }
    Ok(files)
}

/// Total size in bytes of the regular files under a directory.
pub async fn dir_size(dir: &std::path::Path) -> anyhow::Result<u64> {
    let mut total = 0u64;
    for file in walk_files(dir).await? {
        let md = tokio::fs::symlink_metadata(&file)
            .await
            .with_context(|| format!("failed reading metadata from {:?}", file))?;
        total += md.size();
    }
    Ok(total)
}

pub async fn ensure_dir_exists(dir: &std::path::Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("cannot create directory {:?}", dir))
}

/// Remove a file or directory tree, logging a warning instead of failing.
///
/// A path that is already gone counts as success; two roles may race to
/// delete the same artifact.
pub async fn delete_or_warn(path: &std::path::Path) {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(md) if md.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return,
        Err(error) => Err(error),
    };
    match result {
        Ok(()) => tracing::debug!("removed {:?}", path),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => tracing::warn!("could not delete {:?}: {}", path, error),
    }
}

/// Remove a directory tree after first renaming it into a dot-prefixed
/// sibling, so a scanner racing with the (possibly slow) recursive delete
/// never sees a half-deleted unit.
pub async fn delete_dir_displaced(path: &std::path::Path) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{:?} has no parent directory", path))?;
    let displaced = parent.join(format!(".del_tmp_{}", filename_timestamp()));
    tokio::fs::rename(path, &displaced)
        .await
        .with_context(|| format!("failed displacing {:?} for deletion", path))?;
    tokio::fs::remove_dir_all(&displaced)
        .await
        .with_context(|| format!("failed removing {:?}", displaced))
}

/// Free/total space on the filesystem hosting `path`.
#[derive(Debug, Clone, Copy)]
pub struct DiskSpace {
    pub total_bytes: u64,
    /// Space available to unprivileged users; blocks reserved for root are
    /// excluded so this reflects what the stream directories can really use.
    pub avail_bytes: u64,
}

pub fn disk_space(path: &std::path::Path) -> anyhow::Result<DiskSpace> {
    let stat = nix::sys::statvfs::statvfs(path)
        .with_context(|| format!("statvfs failed for {:?}", path))?;
    let frag = stat.fragment_size();
    Ok(DiskSpace {
        total_bytes: stat.blocks() * frag,
        avail_bytes: stat.blocks_available() * frag,
    })
}

/// Resolve the mount point hosting a path.
///
/// Non-existent trailing components are stripped first (the filesystem a
/// directory will land on once created), symlinks are resolved, then the
/// path is walked upward until the device id changes.
pub fn mount_point_for_path(path: &std::path::Path) -> anyhow::Result<std::path::PathBuf> {
    anyhow::ensure!(path.is_absolute(), "{:?} must be an absolute path", path);
    let mut current = path.to_path_buf();
    while !current.exists() {
        current = current
            .parent()
            .with_context(|| format!("no existing parent for {:?}", path))?
            .to_path_buf();
    }
    let mut current = std::fs::canonicalize(&current)
        .with_context(|| format!("failed resolving {:?}", current))?;
    let mut dev = std::fs::symlink_metadata(&current)?.dev();
    while let Some(parent) = current.parent() {
        let parent_dev = std::fs::symlink_metadata(parent)?.dev();
        if parent_dev != dev {
            break;
        }
        dev = parent_dev;
        current = parent.to_path_buf();
    }
    Ok(current)
}

/// Move a rejected unit from the stream directory into quarantine,
/// timestamp-suffixing the destination to avoid clobbering an earlier
/// rejection of the same name.
pub async fn quarantine(
    file_name: &str,
    data_dir: &std::path::Path,
    quarantine_dir: &std::path::Path,
) -> anyhow::Result<()> {
    ensure_dir_exists(quarantine_dir).await?;
    let base = std::path::Path::new(file_name)
        .file_name()
        .with_context(|| format!("{file_name} has no basename"))?;
    let src = data_dir.join(base);
    if !src.exists() {
        return Ok(());
    }
    let mut dst = quarantine_dir.join(base);
    if dst.exists() {
        let mut name = dst.into_os_string();
        name.push(format!(".{}", filename_timestamp()));
        dst = std::path::PathBuf::from(name);
    }
    tokio::fs::rename(&src, &dst)
        .await
        .with_context(|| format!("failed moving {:?} to quarantine {:?}", src, dst))?;
    tracing::info!("quarantined {:?} as {:?}", src, dst);
    Ok(())
}
