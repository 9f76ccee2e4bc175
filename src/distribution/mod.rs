//! Distribution installers.
//!
//! An installer knows the distribution-level facts (release, architecture
//! names, base packages) and drives a [`PackageManagerBackend`] to populate
//! the install root. Installers are stateless; per-build state lives on the
//! backend they create.

pub mod gentoo;

use anyhow::Result;
use serde::Deserialize;
use std::fmt;

use crate::arch::Architecture;
use crate::backend::{PackageManagerBackend, Services};
use crate::build::context::BuildContext;
use crate::config::BuildConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    Gentoo,
}

impl Distribution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gentoo => "gentoo",
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait DistributionInstaller: Send + Sync {
    fn pretty_name(&self) -> &'static str;

    /// Default root filesystem type for images of this distribution.
    fn filesystem(&self) -> &'static str;

    fn default_release(&self) -> &'static str;

    /// Upstream name of `arch`. Unsupported architectures are a configuration error.
    fn architecture(&self, arch: Architecture) -> Result<&'static str>;

    /// Packages every install root gets.
    fn base_packages(&self) -> &'static [&'static str];

    fn backend(&self, services: Services) -> Box<dyn PackageManagerBackend>;

    fn release(&self, config: &BuildConfig) -> String {
        config
            .release
            .clone()
            .unwrap_or_else(|| self.default_release().to_string())
    }

    fn setup(&self, ctx: &BuildContext, backend: &mut dyn PackageManagerBackend) -> Result<()> {
        backend.setup(ctx)
    }

    fn sync(&self, ctx: &BuildContext, backend: &mut dyn PackageManagerBackend) -> Result<()> {
        backend.sync(ctx, ctx.config.force_sync)
    }

    fn install(&self, ctx: &BuildContext, backend: &mut dyn PackageManagerBackend) -> Result<()> {
        let packages: Vec<String> = self.base_packages().iter().map(|p| p.to_string()).collect();
        self.install_packages(ctx, backend, &packages)
    }

    fn install_packages(
        &self,
        ctx: &BuildContext,
        backend: &mut dyn PackageManagerBackend,
        packages: &[String],
    ) -> Result<()> {
        backend.install(ctx, packages)
    }
}

/// Installer for `distribution`.
pub fn installer(distribution: Distribution) -> &'static dyn DistributionInstaller {
    match distribution {
        Distribution::Gentoo => &gentoo::GentooInstaller,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        let gentoo = installer(Distribution::Gentoo);
        assert_eq!(gentoo.pretty_name(), "Gentoo");
        assert_eq!(gentoo.release(&BuildConfig::default()), "23.0");

        let config = BuildConfig {
            release: Some("17.1".into()),
            ..BuildConfig::default()
        };
        assert_eq!(gentoo.release(&config), "17.1");
    }

    #[test]
    fn test_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            distribution: Distribution,
        }
        let w: Wrapper = toml::from_str("distribution = \"gentoo\"").unwrap();
        assert_eq!(w.distribution, Distribution::Gentoo);
        assert!(toml::from_str::<Wrapper>("distribution = \"arch\"").is_err());
    }
}
