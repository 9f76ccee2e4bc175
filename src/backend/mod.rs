//! Package manager backends.
//!
//! A backend owns the lifecycle of one build's package manager: it prepares
//! the bootstrap snapshot in `setup`, then runs every later operation inside
//! a sandbox whose view is recomposed per call.

pub mod emerge;

pub use emerge::Emerge;

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::build::context::BuildContext;
use crate::config::BuildConfig;
use crate::mounts::{MountDirective, RepoAccess};
use crate::net::{HttpTransport, Transport};
use crate::sandbox::{BwrapSandbox, Sandbox};

/// External effects a backend depends on.
#[derive(Clone)]
pub struct Services {
    pub transport: Arc<dyn Transport>,
    pub sandbox: Arc<dyn Sandbox>,
}

impl Services {
    pub fn new(transport: Arc<dyn Transport>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self { transport, sandbox }
    }

    /// HTTPS transport and the configured bubblewrap binary.
    pub fn from_config(config: &BuildConfig) -> Self {
        Self::new(
            Arc::new(HttpTransport::new()),
            Arc::new(BwrapSandbox::from_config(config)),
        )
    }
}

/// Feature flags and the environment every invocation starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub feature_flags: Vec<String>,
    pub environment: BTreeMap<String, String>,
    /// Shared binpkg/distfile/repository cache, if any.
    pub package_cache_dir: Option<PathBuf>,
}

pub trait PackageManagerBackend: Send {
    fn name(&self) -> &'static str;

    /// Path of the package manager executable as seen inside the sandbox.
    fn resolve_executable(&self, config: &BuildConfig, tool_root: Option<&Path>) -> Result<PathBuf>;

    fn feature_flags(&self, config: &BuildConfig) -> Vec<String>;

    fn backend_config(&self, config: &BuildConfig) -> BackendConfig;

    /// Prepare the bootstrap snapshot and the install root. Idempotent.
    fn setup(&mut self, ctx: &BuildContext) -> Result<()>;

    /// Refresh repository metadata. Failures are fatal only when `force` is
    /// set or no metadata exists yet.
    fn sync(&mut self, ctx: &BuildContext, force: bool) -> Result<()>;

    fn install(&mut self, ctx: &BuildContext, packages: &[String]) -> Result<()>;

    /// Update `packages`, or everything installed when empty.
    fn upgrade(&mut self, ctx: &BuildContext, packages: &[String]) -> Result<()>;

    fn remove(&mut self, ctx: &BuildContext, packages: &[String]) -> Result<()>;

    /// Index the binary package cache and register it as a local repository.
    fn createrepo(&mut self, ctx: &BuildContext) -> Result<()>;

    /// Sandbox view for the next invocation.
    fn mounts(&self, ctx: &BuildContext, repos: RepoAccess) -> Result<Vec<MountDirective>>;

    /// Extracted bootstrap root, once `setup` has run.
    fn stage3_root(&self) -> Option<&Path>;
}
