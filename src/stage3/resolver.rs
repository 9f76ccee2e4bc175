//! Snapshot discovery.
//!
//! Each distribution publishes its snapshots differently, so discovery sits
//! behind [`SnapshotResolver`]. Parsing is a pure function of the index
//! content; fetching it is the provided [`SnapshotResolver::resolve_latest`].

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, info};

use super::SnapshotRef;
use crate::error::BackendError;
use crate::net::{join_mirror, Transport};

pub const DEFAULT_GENTOO_MIRROR: &str = "https://distfiles.gentoo.org";

/// Stage3 flavour used when none is specified.
pub const DEFAULT_STAGE3_VARIANT: &str = "nomultilib-systemd";

pub trait SnapshotResolver: Send + Sync {
    /// Mirror used when the build does not configure one.
    fn default_mirror(&self) -> &str;

    /// URL of the index listing candidate snapshots.
    fn index_url(&self, arch: &str, mirror: &str) -> String;

    /// Pick the latest snapshot out of `content`. `source` names the index in errors.
    fn parse_index(&self, content: &str, arch: &str, mirror: &str, source: &str)
        -> Result<SnapshotRef>;

    /// Fetch the index for `arch` and resolve the latest snapshot.
    fn resolve_latest(
        &self,
        arch: &str,
        mirror: Option<&str>,
        transport: &dyn Transport,
    ) -> Result<SnapshotRef> {
        let mirror = mirror.unwrap_or(self.default_mirror());
        let url = self.index_url(arch, mirror);
        let content = transport
            .fetch_text(&url)
            .with_context(|| format!("fetching snapshot index for {}", arch))?;
        let snapshot = self.parse_index(&content, arch, mirror, &url)?;
        info!("latest snapshot for {}: {}", arch, snapshot.relative_path);
        Ok(snapshot)
    }
}

/// Gentoo `latest-stage3.txt` resolver.
#[derive(Debug, Clone)]
pub struct GentooStage3Resolver {
    variant: String,
}

impl GentooStage3Resolver {
    pub fn new() -> Self {
        Self::with_variant(DEFAULT_STAGE3_VARIANT)
    }

    /// Resolve a different stage3 flavour, e.g. `openrc` or `desktop-systemd`.
    pub fn with_variant(variant: &str) -> Self {
        Self {
            variant: variant.to_string(),
        }
    }

    fn pattern(&self, arch: &str) -> String {
        format!(
            r"^([0-9]+T[0-9]+Z)/stage3-{}-{}-[0-9]+T[0-9]+Z\.tar\.xz",
            regex::escape(arch),
            regex::escape(&self.variant)
        )
    }

    fn autobuilds(arch: &str) -> String {
        format!("releases/{}/autobuilds", arch)
    }
}

impl Default for GentooStage3Resolver {
    fn default() -> Self {
        Self::new()
    }
}

/// The index is fetched from the first mirror only.
fn primary_mirror(mirror: &str) -> &str {
    mirror.split_whitespace().next().unwrap_or(mirror)
}

impl SnapshotResolver for GentooStage3Resolver {
    fn default_mirror(&self) -> &str {
        DEFAULT_GENTOO_MIRROR
    }

    fn index_url(&self, arch: &str, mirror: &str) -> String {
        join_mirror(
            primary_mirror(mirror),
            &format!("{}/latest-stage3.txt", Self::autobuilds(arch)),
        )
    }

    fn parse_index(
        &self,
        content: &str,
        arch: &str,
        mirror: &str,
        source: &str,
    ) -> Result<SnapshotRef> {
        let pattern = self.pattern(arch);
        let re = Regex::new(&pattern)
            .with_context(|| format!("compiling snapshot pattern '{}'", pattern))?;

        for line in content.lines() {
            let Some(caps) = re.captures(line.trim_end()) else {
                continue;
            };
            let relative_path = caps[0].to_string();
            debug!("matched index line '{}'", line);
            return Ok(SnapshotRef {
                timestamp_id: caps[1].to_string(),
                download_url: join_mirror(
                    primary_mirror(mirror),
                    &format!("{}/{}", Self::autobuilds(arch), relative_path),
                ),
                relative_path,
            });
        }

        Err(BackendError::UpstreamFormat {
            url: source.to_string(),
            pattern,
        }
        .into())
    }
}
