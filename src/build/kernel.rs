//! Kernel image links for freshly installed kernel sources.
//!
//! Source-based distributions install kernels as `usr/src/linux-<kver>`
//! trees. Boot tooling expects `usr/lib/modules/<kver>/vmlinuz`, so after each
//! package installation we point that path at the built image.
//!
//! # Usage
//!
//! ```rust,ignore
//! use distro_pkgmgr::build::kernel::link_kernel_images;
//!
//! let linked = link_kernel_images(&root, "arch/x86/boot/bzImage")?;
//! ```

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::build::filesystem::relative_path;

/// Where kernel sources live inside the install root.
pub const KERNEL_SOURCE_DIR: &str = "usr/src";

/// Where module directories live inside the install root.
pub const MODULE_INSTALL_PATH: &str = "usr/lib/modules";

/// Kernel filename inside each module directory.
pub const KERNEL_FILENAME: &str = "vmlinuz";

/// Kernel versions with a `usr/src/linux-<kver>` directory, sorted.
pub fn installed_kernel_sources(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let src_dir = root.join(KERNEL_SOURCE_DIR);
    if !src_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut kernels = Vec::new();
    for entry in fs::read_dir(&src_dir)
        .with_context(|| format!("reading kernel sources in '{}'", src_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let Some(kver) = name.to_str().and_then(|n| n.strip_prefix("linux-")) else {
            continue;
        };
        if kver.is_empty() || !entry.file_type()?.is_dir() {
            continue;
        }
        kernels.push((kver.to_string(), entry.path()));
    }
    kernels.sort();
    Ok(kernels)
}

/// Create `usr/lib/modules/<kver>/vmlinuz` for every kernel source tree.
///
/// The link is relative and points at `<source>/<image_rel>`. Existing
/// files or links are never touched. Returns the links created.
pub fn link_kernel_images(root: &Path, image_rel: &str) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();

    for (kver, source) in installed_kernel_sources(root)? {
        let image = source.join(image_rel);
        let module_dir = root.join(MODULE_INSTALL_PATH).join(&kver);
        let vmlinuz = module_dir.join(KERNEL_FILENAME);

        if vmlinuz.exists() || vmlinuz.is_symlink() {
            debug!("{} already present, leaving it alone", vmlinuz.display());
            continue;
        }

        fs::create_dir_all(&module_dir)
            .with_context(|| format!("creating '{}'", module_dir.display()))?;
        let target = relative_path(&module_dir, &image);
        std::os::unix::fs::symlink(&target, &vmlinuz).with_context(|| {
            format!("linking '{}' -> '{}'", vmlinuz.display(), target.display())
        })?;
        info!("linked {} -> {}", vmlinuz.display(), target.display());
        created.push(vmlinuz);
    }

    Ok(created)
}
