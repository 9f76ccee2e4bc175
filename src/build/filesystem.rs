//! Filesystem helpers shared by the cache manager and the installers.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Copy `src` on top of `dst`, preserving symlinks.
///
/// Entries present in `src` replace their counterparts in `dst`; everything
/// else already in `dst` is left untouched. Directories are merged, never
/// replaced wholesale.
///
/// # Example
///
/// ```rust,ignore
/// use distro_pkgmgr::build::filesystem::overlay_tree;
/// use std::path::Path;
///
/// overlay_tree(Path::new("/opt/tools"), Path::new("/var/cache/stage3/root"))?;
/// ```
pub fn overlay_tree(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    }

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("{} escaped {}", entry.path().display(), src.display()))?;
        let dst_path = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if dst_path.is_symlink() || (dst_path.exists() && !dst_path.is_dir()) {
                fs::remove_file(&dst_path)
                    .with_context(|| format!("Failed to replace {}", dst_path.display()))?;
            }
            fs::create_dir_all(&dst_path)
                .with_context(|| format!("Failed to create directory: {}", dst_path.display()))?;
            continue;
        }

        remove_existing(&dst_path)?;
        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("Failed to create symlink: {}", dst_path.display()))?;
        } else {
            fs::copy(entry.path(), &dst_path).with_context(|| {
                format!("Failed to copy file: {}", entry.path().display())
            })?;
        }
    }

    Ok(())
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)
            .with_context(|| format!("Failed to replace directory: {}", path.display())),
        Ok(_) => fs::remove_file(path)
            .with_context(|| format!("Failed to replace file: {}", path.display())),
        Err(_) => Ok(()),
    }
}

/// Atomically move a file by renaming, with fallback to copy+delete.
///
/// Used for the "download to a temporary name, then rename" pattern.
pub fn atomic_move(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            // Different filesystem: copy next to the destination, then rename.
            let staged = dst.with_extension("moving");
            fs::copy(src, &staged)
                .with_context(|| format!("Failed to copy {} to {}", src.display(), staged.display()))?;
            fs::rename(&staged, dst)
                .with_context(|| format!("Failed to rename {} to {}", staged.display(), dst.display()))?;
            fs::remove_file(src).with_context(|| format!("Failed to remove {}", src.display()))?;
            Ok(())
        }
    }
}

/// Path to `target` relative to the directory `from_dir`.
///
/// Both paths must be absolute or both relative to the same base.
pub fn relative_path(from_dir: &Path, target: &Path) -> PathBuf {
    let from: Vec<Component> = from_dir.components().collect();
    let to: Vec<Component> = target.components().collect();
    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for component in &to[common..] {
        rel.push(component.as_os_str());
    }
    rel
}

/// True if `dir` is missing or has no entries.
pub fn dir_is_empty(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}
