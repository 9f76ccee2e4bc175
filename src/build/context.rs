//! Per-build context.
//!
//! Carries the configuration and the workspace paths of one build. It holds
//! no backend state; the backend instance owns that.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::BuildConfig;

/// Path the install root is mounted at inside the sandbox.
pub const SANDBOX_INSTALL_ROOT: &str = "/buildroot";

pub struct BuildContext {
    pub config: BuildConfig,
    /// Scratch directory owned by this build.
    pub workspace: PathBuf,
}

impl BuildContext {
    /// Create a build context rooted at `workspace`.
    ///
    /// The workspace and the sandbox tree directory are created; the install
    /// root is left to the backend's `setup`.
    pub fn new(config: BuildConfig, workspace: &Path) -> Result<Self> {
        let ctx = Self {
            config,
            workspace: workspace.to_path_buf(),
        };
        fs::create_dir_all(ctx.sandbox_tree())
            .with_context(|| format!("creating sandbox tree '{}'", ctx.sandbox_tree().display()))?;
        Ok(ctx)
    }

    /// Host path of the install root.
    pub fn root(&self) -> PathBuf {
        self.workspace.join("root")
    }

    /// Project-level overrides for the sandbox view (e.g. `stage3/etc/portage`).
    pub fn sandbox_tree(&self) -> PathBuf {
        self.workspace.join("sandbox")
    }

    /// Create the install root if it does not exist yet.
    pub fn ensure_root(&self) -> Result<PathBuf> {
        let root = self.root();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating install root '{}'", root.display()))?;
        Ok(root)
    }
}
