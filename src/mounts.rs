//! Namespace composition for sandboxed package-manager runs.
//!
//! [`compose`] builds the ordered list of [`MountDirective`]s that make an
//! unmodified `emerge` from the stage3 snapshot operate on the install root:
//!
//! ```text
//! /buildroot            <- host install root (rw)
//! /opt /usr /etc        <- stage3 root
//! /etc/{passwd,..}      <- stage3 root (rw, never the host)
//! /var/cache/edb ..     <- stage3 root (rw)
//! /var/cache/binpkgs    <- shared package cache or stage3 root (rw)
//! /var/db/repos         <- shared package cache or stage3 root (ro)
//! /etc/portage          <- overlay: override or stage3 defaults + tmpfs
//! make.profile          <- symlink recreated inside the install root
//! ```
//!
//! Order matters: consumers must apply directives exactly as listed.

use anyhow::Result;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::build::context::SANDBOX_INSTALL_ROOT;
use crate::error::BackendError;
use crate::stage3::cache::{BINPKGS_SUBDIR, DISTFILES_SUBDIR, REPOS_SUBDIR};

/// Package manager configuration directory, as seen inside the sandbox.
pub const PORTAGE_CONFIG_DIR: &str = "etc/portage";

/// Identity files always taken from the stage3 root, read-write.
pub const IDENTITY_FILES: &[&str] = &["etc/passwd", "etc/group", "etc/shadow", "etc/gshadow"];

const RUNTIME_SUBTREES: &[&str] = &["opt", "usr", "etc"];
const STATE_DIRS: &[&str] = &["var/cache/edb", "var/lib/portage", "var/db/pkg"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpperLayer {
    /// Ephemeral, memory-backed upper layer.
    Tmpfs,
    /// Persistent upper layer with its overlayfs work directory.
    Dir { upper: PathBuf, work: PathBuf },
}

/// One step of the sandbox view. Sources are host paths, targets are
/// sandbox paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountDirective {
    Bind { source: PathBuf, target: PathBuf },
    RoBind { source: PathBuf, target: PathBuf },
    /// Lower layers of one overlay are listed bottom-most first.
    OverlayLower { source: PathBuf, target: PathBuf },
    OverlayUpper { layer: UpperLayer, target: PathBuf },
    Overlay { target: PathBuf },
    Symlink { link_target: PathBuf, target: PathBuf },
    TmpfsDir { target: PathBuf },
}

impl MountDirective {
    pub fn target(&self) -> &Path {
        match self {
            Self::Bind { target, .. }
            | Self::RoBind { target, .. }
            | Self::OverlayLower { target, .. }
            | Self::OverlayUpper { target, .. }
            | Self::Overlay { target }
            | Self::Symlink { target, .. }
            | Self::TmpfsDir { target } => target,
        }
    }

    /// Host path this directive reads from, if any.
    pub fn source(&self) -> Option<&Path> {
        match self {
            Self::Bind { source, .. }
            | Self::RoBind { source, .. }
            | Self::OverlayLower { source, .. } => Some(source),
            Self::OverlayUpper {
                layer: UpperLayer::Dir { upper, .. },
                ..
            } => Some(upper),
            _ => None,
        }
    }
}

impl fmt::Display for MountDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { source, target } => {
                write!(f, "bind {} -> {}", source.display(), target.display())
            }
            Self::RoBind { source, target } => {
                write!(f, "ro-bind {} -> {}", source.display(), target.display())
            }
            Self::OverlayLower { source, target } => {
                write!(f, "overlay-lower {} for {}", source.display(), target.display())
            }
            Self::OverlayUpper { layer, target } => match layer {
                UpperLayer::Tmpfs => write!(f, "overlay-upper tmpfs for {}", target.display()),
                UpperLayer::Dir { upper, .. } => {
                    write!(f, "overlay-upper {} for {}", upper.display(), target.display())
                }
            },
            Self::Overlay { target } => write!(f, "overlay {}", target.display()),
            Self::Symlink {
                link_target,
                target,
            } => write!(f, "symlink {} -> {}", target.display(), link_target.display()),
            Self::TmpfsDir { target } => write!(f, "tmpfs {}", target.display()),
        }
    }
}

/// How a project-level `etc/portage` override combines with the stage3 defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigPolicy {
    /// The override replaces the stage3 configuration entirely when present.
    #[default]
    Override,
    /// The override is layered on top of the stage3 configuration.
    Layered,
}

/// Whether repository metadata is mounted writable (only for syncing).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RepoAccess {
    #[default]
    ReadOnly,
    Writable,
}

/// Inputs of [`compose`].
#[derive(Debug, Clone)]
pub struct MountContext<'a> {
    /// Extracted stage3 root on the host.
    pub stage3_root: &'a Path,
    /// Install root on the host.
    pub install_root: &'a Path,
    /// Project overrides (`stage3/etc/portage`, `installroot/etc/portage`).
    pub sandbox_tree: &'a Path,
    /// Shared package cache, if configured.
    pub package_cache_dir: Option<&'a Path>,
    pub policy: ConfigPolicy,
    pub repos: RepoAccess,
}

impl MountContext<'_> {
    pub fn stage3_override(&self) -> PathBuf {
        self.sandbox_tree.join("stage3").join(PORTAGE_CONFIG_DIR)
    }

    pub fn installroot_override(&self) -> PathBuf {
        self.sandbox_tree.join("installroot").join(PORTAGE_CONFIG_DIR)
    }
}

#[derive(Default)]
struct Composer {
    directives: Vec<MountDirective>,
}

impl Composer {
    fn require(what: &str, path: &Path) -> Result<()> {
        if path.exists() {
            Ok(())
        } else {
            Err(BackendError::missing_path(what, path).into())
        }
    }

    fn bind(&mut self, source: PathBuf, target: impl Into<PathBuf>) -> Result<()> {
        Self::require("bind source", &source)?;
        self.directives.push(MountDirective::Bind {
            source,
            target: target.into(),
        });
        Ok(())
    }

    fn ro_bind(&mut self, source: PathBuf, target: impl Into<PathBuf>) -> Result<()> {
        Self::require("read-only bind source", &source)?;
        self.directives.push(MountDirective::RoBind {
            source,
            target: target.into(),
        });
        Ok(())
    }

    fn repo_bind(&mut self, access: RepoAccess, source: PathBuf, target: PathBuf) -> Result<()> {
        match access {
            RepoAccess::ReadOnly => self.ro_bind(source, target),
            RepoAccess::Writable => self.bind(source, target),
        }
    }

    fn overlay(&mut self, lowers: Vec<PathBuf>, upper: UpperLayer, target: PathBuf) -> Result<()> {
        for source in lowers {
            Self::require("overlay lower layer", &source)?;
            self.directives.push(MountDirective::OverlayLower {
                source,
                target: target.clone(),
            });
        }
        self.directives.push(MountDirective::OverlayUpper {
            layer: upper,
            target: target.clone(),
        });
        self.directives.push(MountDirective::Overlay { target });
        Ok(())
    }

    fn push(&mut self, directive: MountDirective) {
        self.directives.push(directive);
    }
}

/// Absolute sandbox path for a path relative to `/`.
fn sandbox_path(rel: &str) -> PathBuf {
    Path::new("/").join(rel)
}

fn installroot_path(rel: &str) -> PathBuf {
    Path::new(SANDBOX_INSTALL_ROOT).join(rel)
}

/// Build the sandbox view for one package-manager invocation.
///
/// Fails with a configuration error if any required source is missing; no
/// directive is ever silently dropped.
pub fn compose(ctx: &MountContext<'_>) -> Result<Vec<MountDirective>> {
    let stage3 = ctx.stage3_root;
    let mut c = Composer::default();

    c.bind(ctx.install_root.to_path_buf(), SANDBOX_INSTALL_ROOT)?;

    for subtree in RUNTIME_SUBTREES {
        c.bind(stage3.join(subtree), sandbox_path(subtree))?;
    }

    // Post-install scripts add users and groups, so these stay writable.
    for file in IDENTITY_FILES {
        c.bind(stage3.join(file), sandbox_path(file))?;
    }

    for dir in STATE_DIRS {
        c.bind(stage3.join(dir), sandbox_path(dir))?;
    }

    let (binpkgs, distfiles, repos) = match ctx.package_cache_dir {
        Some(cache) => (
            cache.join(BINPKGS_SUBDIR),
            cache.join(DISTFILES_SUBDIR),
            cache.join(REPOS_SUBDIR),
        ),
        None => (
            stage3.join("var/cache/binpkgs"),
            stage3.join("var/cache/distfiles"),
            stage3.join("var/db/repos"),
        ),
    };
    c.bind(binpkgs, "/var/cache/binpkgs")?;
    c.bind(distfiles, "/var/cache/distfiles")?;
    c.repo_bind(ctx.repos, repos.clone(), sandbox_path("var/db/repos"))?;
    c.repo_bind(ctx.repos, repos, installroot_path("var/db/repos"))?;

    let stage3_config = stage3.join(PORTAGE_CONFIG_DIR);
    let project_config = ctx.stage3_override();
    let lowers = match (ctx.policy, project_config.is_dir()) {
        (ConfigPolicy::Override, true) => vec![project_config],
        (ConfigPolicy::Override, false) => vec![stage3_config.clone()],
        (ConfigPolicy::Layered, true) => vec![stage3_config.clone(), project_config],
        (ConfigPolicy::Layered, false) => vec![stage3_config.clone()],
    };
    c.overlay(lowers, UpperLayer::Tmpfs, sandbox_path(PORTAGE_CONFIG_DIR))?;

    let installroot_config = ctx.installroot_override();
    if installroot_config.is_dir() {
        c.bind(installroot_config, installroot_path(PORTAGE_CONFIG_DIR))?;
    }

    // An overlay cannot merge a regular file with a symlink, so the profile
    // marker is recreated as a symlink inside the install root.
    let profile = stage3_config.join("make.profile");
    c.push(MountDirective::Symlink {
        link_target: profile_link_target(stage3, &profile)?,
        target: installroot_path(&format!("{}/make.profile", PORTAGE_CONFIG_DIR)),
    });

    // gpg creates its sockets under /run/user/0.
    c.push(MountDirective::TmpfsDir {
        target: PathBuf::from("/run/user/0"),
    });

    validate_order(&c.directives)?;
    for directive in &c.directives {
        debug!("mount: {}", directive);
    }
    Ok(c.directives)
}

/// Where the install root's `make.profile` symlink should point.
fn profile_link_target(stage3: &Path, profile: &Path) -> Result<PathBuf> {
    let meta = fs::symlink_metadata(profile)
        .map_err(|_| BackendError::missing_path("portage profile", profile))?;
    if meta.file_type().is_symlink() {
        return Ok(fs::read_link(profile)?);
    }

    let resolved = fs::canonicalize(profile)?;
    let stage3 = fs::canonicalize(stage3)?;
    let rel = resolved.strip_prefix(&stage3).map_err(|_| {
        BackendError::configuration(format!(
            "portage profile {} resolves outside the stage3 root",
            profile.display()
        ))
    })?;
    Ok(Path::new("/").join(rel))
}

#[derive(Default)]
struct OverlayState {
    lowers: usize,
    upper: bool,
}

fn misordered(target: &Path, what: &str) -> anyhow::Error {
    BackendError::configuration(format!(
        "overlay for {} is misordered: {}",
        target.display(),
        what
    ))
    .into()
}

/// Check that every overlay is lower layers, then one upper, then the mount.
pub fn validate_order(directives: &[MountDirective]) -> Result<()> {
    let mut pending: BTreeMap<&Path, OverlayState> = BTreeMap::new();

    for directive in directives {
        match directive {
            MountDirective::OverlayLower { target, .. } => {
                let state = pending.entry(target.as_path()).or_default();
                if state.upper {
                    return Err(misordered(target, "lower layer after upper layer"));
                }
                state.lowers += 1;
            }
            MountDirective::OverlayUpper { target, .. } => {
                let state = pending.entry(target.as_path()).or_default();
                if state.lowers == 0 {
                    return Err(misordered(target, "upper layer without lower layers"));
                }
                if state.upper {
                    return Err(misordered(target, "more than one upper layer"));
                }
                state.upper = true;
            }
            MountDirective::Overlay { target } => match pending.remove(target.as_path()) {
                Some(state) if state.lowers > 0 && state.upper => {}
                _ => return Err(misordered(target, "mount before its layers")),
            },
            _ => {}
        }
    }

    if let Some(target) = pending.keys().next() {
        return Err(misordered(target, "layers without an overlay mount"));
    }
    Ok(())
}
