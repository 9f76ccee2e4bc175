//! Build configuration.
//!
//! Loaded from a TOML file by the driver binary; library callers may also
//! construct it directly. Unknown keys are rejected so typos surface early.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::arch::Architecture;
use crate::distribution::Distribution;
use crate::mounts::ConfigPolicy;

/// Directory name used under the user cache dir when no package cache is configured.
pub const DEFAULT_CACHE_SUBDIR: &str = "distro-pkgmgr";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildConfig {
    #[serde(default = "default_distribution")]
    pub distribution: Distribution,
    #[serde(default = "default_architecture")]
    pub architecture: Architecture,
    /// Release override; the installer's default release is used when absent.
    pub release: Option<String>,
    /// Mirror URL. Only the first whitespace-separated token is used for the index.
    pub mirror: Option<String>,
    /// Shared binary package / distfile / repository cache reused across builds.
    pub package_cache_dir: Option<PathBuf>,
    /// Tree copied on top of the extracted stage3 root.
    pub tools_tree: Option<PathBuf>,
    #[serde(default)]
    pub with_docs: bool,
    /// Caller environment; wins over backend defaults.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Diagnostic mode: verbose package manager output plus an `--info` run.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub config_policy: ConfigPolicy,
    /// Force a repository sync even when metadata is already present.
    #[serde(default)]
    pub force_sync: bool,
    /// Sandbox tool used by [`BwrapSandbox`](crate::sandbox::BwrapSandbox).
    pub sandbox_binary: Option<String>,
}

fn default_distribution() -> Distribution {
    Distribution::Gentoo
}

fn default_architecture() -> Architecture {
    Architecture::native().unwrap_or(Architecture::X86_64)
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            distribution: default_distribution(),
            architecture: default_architecture(),
            release: None,
            mirror: None,
            package_cache_dir: None,
            tools_tree: None,
            with_docs: false,
            environment: BTreeMap::new(),
            debug: false,
            config_policy: ConfigPolicy::default(),
            force_sync: false,
            sandbox_binary: None,
        }
    }
}

impl BuildConfig {
    /// Load a config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading build config '{}'", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing build config '{}'", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Cache root for stage3 snapshots.
    ///
    /// Falls back to `<user cache dir>/distro-pkgmgr` (or `/var/tmp` when the
    /// user has no cache dir) if no shared package cache is configured.
    pub fn package_cache_dir_or_default(&self) -> PathBuf {
        self.package_cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("/var/tmp"))
                .join(DEFAULT_CACHE_SUBDIR)
        })
    }

    /// Look up a variable in the caller environment, then the process environment.
    pub fn env_var(&self, key: &str) -> Option<String> {
        self.environment
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
    }
}
