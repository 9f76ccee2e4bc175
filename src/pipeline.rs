//! Sequential build driver: setup, sync, install, createrepo.

use anyhow::{Context, Result};
use tracing::info;

use crate::backend::{PackageManagerBackend, Services};
use crate::build::context::BuildContext;
use crate::distribution::{installer, DistributionInstaller};

/// One build's installer, backend and context, driven step by step.
pub struct Pipeline {
    ctx: BuildContext,
    installer: &'static dyn DistributionInstaller,
    backend: Box<dyn PackageManagerBackend>,
}

impl Pipeline {
    /// Pipeline for the configured distribution, using its default backend.
    pub fn new(ctx: BuildContext, services: Services) -> Self {
        let installer = installer(ctx.config.distribution);
        let backend = installer.backend(services);
        Self {
            ctx,
            installer,
            backend,
        }
    }

    pub fn with_backend(ctx: BuildContext, backend: Box<dyn PackageManagerBackend>) -> Self {
        Self {
            installer: installer(ctx.config.distribution),
            ctx,
            backend,
        }
    }

    pub fn context(&self) -> &BuildContext {
        &self.ctx
    }

    pub fn backend(&self) -> &dyn PackageManagerBackend {
        self.backend.as_ref()
    }

    pub fn setup(&mut self) -> Result<()> {
        info!(
            "setting up {} {} ({}) with {}",
            self.installer.pretty_name(),
            self.installer.release(&self.ctx.config),
            self.ctx.config.architecture,
            self.backend.name()
        );
        self.installer
            .setup(&self.ctx, self.backend.as_mut())
            .context("setup failed")
    }

    pub fn sync(&mut self) -> Result<()> {
        self.installer
            .sync(&self.ctx, self.backend.as_mut())
            .context("repository sync failed")
    }

    /// Install the distribution's base packages.
    pub fn install(&mut self) -> Result<()> {
        self.installer
            .install(&self.ctx, self.backend.as_mut())
            .context("base installation failed")
    }

    pub fn install_packages(&mut self, packages: &[String]) -> Result<()> {
        self.installer
            .install_packages(&self.ctx, self.backend.as_mut(), packages)
            .with_context(|| format!("installing {}", packages.join(" ")))
    }

    pub fn upgrade(&mut self, packages: &[String]) -> Result<()> {
        self.backend
            .upgrade(&self.ctx, packages)
            .context("upgrade failed")
    }

    pub fn remove(&mut self, packages: &[String]) -> Result<()> {
        self.backend
            .remove(&self.ctx, packages)
            .with_context(|| format!("removing {}", packages.join(" ")))
    }

    pub fn createrepo(&mut self) -> Result<()> {
        self.backend
            .createrepo(&self.ctx)
            .context("registering local binary repository failed")
    }

    /// Full run: setup, sync, base packages, `packages`, createrepo.
    pub fn run_all(&mut self, packages: &[String]) -> Result<()> {
        self.setup()?;
        self.sync()?;
        self.install()?;
        if !packages.is_empty() {
            self.install_packages(packages)?;
        }
        self.createrepo()?;
        info!("install root ready at {}", self.ctx.root().display());
        Ok(())
    }
}
