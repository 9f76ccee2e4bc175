//! Stage3 snapshots: discovery, download cache and extraction.
//!
//! - [`resolver`] - turn an upstream index into a [`SnapshotRef`]
//! - [`cache`] - single-slot, lock-protected on-disk cache of snapshots
//! - [`extract`] - unpack compressed tar archives into a directory

pub mod cache;
pub mod extract;
pub mod resolver;

pub use cache::{CacheLease, Stage3Cache};
pub use resolver::{GentooStage3Resolver, SnapshotResolver};

use std::cmp::Ordering;
use std::path::Path;

/// A concrete, fetchable snapshot.
///
/// Identity and ordering are by `timestamp_id` only; two refs with the same
/// timestamp name the same snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotRef {
    /// e.g. `20250322T105044Z`
    pub timestamp_id: String,
    /// e.g. `20250322T105044Z/stage3-amd64-nomultilib-systemd-20250322T105044Z.tar.xz`
    pub relative_path: String,
    pub download_url: String,
}

impl SnapshotRef {
    /// Directory component of the relative path.
    pub fn directory(&self) -> &str {
        self.relative_path
            .split_once('/')
            .map(|(dir, _)| dir)
            .unwrap_or(&self.timestamp_id)
    }

    /// File name of the archive.
    pub fn archive_name(&self) -> &str {
        Path::new(&self.relative_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.relative_path)
    }
}

impl PartialEq for SnapshotRef {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp_id == other.timestamp_id
    }
}

impl Eq for SnapshotRef {}

impl PartialOrd for SnapshotRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SnapshotRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp_id.cmp(&other.timestamp_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(ts: &str) -> SnapshotRef {
        SnapshotRef {
            timestamp_id: ts.to_string(),
            relative_path: format!("{ts}/stage3-amd64-nomultilib-systemd-{ts}.tar.xz"),
            download_url: format!("https://m/{ts}"),
        }
    }

    #[test]
    fn test_components() {
        let s = snapshot("20250101T000000Z");
        assert_eq!(s.directory(), "20250101T000000Z");
        assert_eq!(
            s.archive_name(),
            "stage3-amd64-nomultilib-systemd-20250101T000000Z.tar.xz"
        );
    }

    #[test]
    fn test_ordering_is_by_timestamp() {
        let older = snapshot("20250101T000000Z");
        let newer = snapshot("20250322T105044Z");
        assert!(older < newer);
        assert_eq!(std::cmp::max(older, newer.clone()), newer);
    }
}
