//! On-disk stage3 cache.
//!
//! Layout under `<cache_root>/stage3`:
//!
//! ```text
//! <timestamp>/<archive_name>   downloaded archive (only one is kept)
//! root/                        extracted base system of that archive
//! root/.snapshot               relative path of the archive `root/` came from
//! .lock                        advisory lock shared by all builds using the cache
//! ```
//!
//! Downloads land in `<archive_name>.partial` and extraction in
//! `.root.partial`; both are renamed into place only once complete, so an
//! interrupted run can never leave something the existence checks accept.
//!
//! Builds hold a shared lock on `.lock` for as long as they use the extracted
//! root. Fetch, eviction and extraction run under the exclusive lock, so one
//! build can never evict files another build is reading.
//!
//! flock treats every open of `.lock` as a separate holder, so two leases on
//! the same cache inside one process would deadlock on the upgrade. That case
//! is detected and reported as a configuration error instead.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use super::extract::extract_archive;
use super::SnapshotRef;
use crate::build::filesystem::{atomic_move, overlay_tree};
use crate::error::BackendError;
use crate::net::Transport;

/// Directory name of the extracted root inside the stage3 cache.
pub const ROOT_DIR: &str = "root";
const ROOT_PARTIAL_DIR: &str = ".root.partial";
const LOCK_FILE: &str = ".lock";
const SNAPSHOT_STAMP: &str = ".snapshot";

/// Leases currently held by this process, per lock file.
static HELD_LEASES: Mutex<BTreeMap<PathBuf, usize>> = Mutex::new(BTreeMap::new());

fn held_leases(path: &Path, delta: isize) -> usize {
    let mut held = HELD_LEASES.lock().unwrap_or_else(|e| e.into_inner());
    let count = held.entry(path.to_path_buf()).or_insert(0);
    *count = count.saturating_add_signed(delta);
    let now = *count;
    if now == 0 {
        held.remove(path);
    }
    now
}

/// Binary packages, relative to a shared package cache directory.
pub const BINPKGS_SUBDIR: &str = "cache/binpkgs";
/// Source tarballs, relative to a shared package cache directory.
pub const DISTFILES_SUBDIR: &str = "cache/distfiles";
/// Repository metadata, relative to a shared package cache directory.
pub const REPOS_SUBDIR: &str = "db/repos";

/// Create the shared package cache layout under `dir`.
pub fn ensure_package_cache_layout(dir: &Path) -> Result<()> {
    for sub in [BINPKGS_SUBDIR, DISTFILES_SUBDIR, REPOS_SUBDIR] {
        let path = dir.join(sub);
        fs::create_dir_all(&path).map_err(|e| {
            BackendError::configuration(format!(
                "cannot create package cache directory {}: {}",
                path.display(),
                e
            ))
        })?;
    }
    Ok(())
}

/// Shared/exclusive advisory lock on the stage3 cache.
///
/// Starts shared. The lock is released when the lease is dropped; the lock
/// file itself is never unlinked, since unlinking a held lock file lets a
/// second process lock a fresh inode at the same path.
#[derive(Debug)]
pub struct CacheLease {
    file: File,
    path: PathBuf,
}

impl CacheLease {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                BackendError::configuration(format!(
                    "cannot open stage3 cache lock {}: {}",
                    path.display(),
                    e
                ))
            })?;

        if file.try_lock_shared().is_err() {
            info!("waiting for another build to finish updating {}", path.display());
            file.lock_shared()
                .with_context(|| format!("locking '{}'", path.display()))?;
        }

        let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        held_leases(&path, 1);
        Ok(Self { file, path })
    }

    fn upgrade(&self) -> Result<()> {
        if self.file.try_lock_exclusive().is_err() {
            if held_leases(&self.path, 0) > 1 {
                return Err(BackendError::configuration(format!(
                    "stage3 cache lock {} is already leased by another backend in this process",
                    self.path.display()
                ))
                .into());
            }
            info!(
                "waiting for other builds to release {} before updating the stage3 cache",
                self.path.display()
            );
            self.file
                .lock_exclusive()
                .with_context(|| format!("exclusively locking '{}'", self.path.display()))?;
        }
        Ok(())
    }

    fn downgrade(&self) -> Result<()> {
        self.file
            .lock_shared()
            .with_context(|| format!("relocking '{}' as shared", self.path.display()))
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        held_leases(&self.path, -1);
    }
}

/// What [`Stage3Cache::prepare`] had to do.
#[derive(Debug)]
pub struct Prepared {
    pub archive: PathBuf,
    pub root: PathBuf,
    pub fetched: bool,
    pub extracted: bool,
    pub lease: CacheLease,
}

#[derive(Debug)]
pub struct Stage3Cache {
    dir: PathBuf,
    retained: Option<SnapshotRef>,
}

impl Stage3Cache {
    /// Open (and create if needed) the cache at `<cache_root>/stage3`.
    pub fn open(cache_root: &Path) -> Result<Self> {
        let dir = cache_root.join("stage3");
        fs::create_dir_all(&dir).map_err(|e| {
            BackendError::configuration(format!(
                "cannot create stage3 cache {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir,
            retained: None,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Extracted base system. Exists iff extraction completed.
    pub fn root(&self) -> PathBuf {
        self.dir.join(ROOT_DIR)
    }

    pub fn archive_path(&self, snapshot: &SnapshotRef) -> PathBuf {
        self.dir
            .join(snapshot.directory())
            .join(snapshot.archive_name())
    }

    pub fn retained(&self) -> Option<&SnapshotRef> {
        self.retained.as_ref()
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Whether [`root`](Self::root) was extracted from `snapshot`'s archive.
    pub fn holds(&self, snapshot: &SnapshotRef) -> bool {
        fs::read_to_string(self.root().join(SNAPSHOT_STAMP))
            .is_ok_and(|stamp| stamp.trim_end() == snapshot.relative_path)
    }

    fn is_complete(&self, snapshot: &SnapshotRef) -> bool {
        self.archive_path(snapshot).is_file() && self.holds(snapshot)
    }

    /// Make `snapshot` available as an extracted root.
    ///
    /// The returned lease keeps a shared lock on the cache; hold it for as
    /// long as the root is in use.
    ///
    /// `tools_tree` is copied on top of the root on every call, under the
    /// exclusive lock. A fresh root gets it before it is published.
    pub fn prepare(
        &mut self,
        snapshot: &SnapshotRef,
        transport: &dyn Transport,
        tools_tree: Option<&Path>,
    ) -> Result<Prepared> {
        if let Some(tree) = tools_tree {
            require_tools_tree(tree)?;
        }
        let lease = CacheLease::acquire(&self.lock_path())?;

        if tools_tree.is_none() && self.is_complete(snapshot) {
            debug!("stage3 {} already cached", snapshot.timestamp_id);
            self.retained = Some(snapshot.clone());
            return Ok(Prepared {
                archive: self.archive_path(snapshot),
                root: self.root(),
                fetched: false,
                extracted: false,
                lease,
            });
        }

        lease.upgrade()?;
        // Another build may have finished the work while we waited.
        let fetched = !self.archive_path(snapshot).is_file();
        let archive = self.ensure_fetched(snapshot, transport)?;
        let extracted = !self.holds(snapshot);
        let root = self.ensure_extracted(snapshot, tools_tree)?;
        lease.downgrade()?;

        Ok(Prepared {
            archive,
            root,
            fetched,
            extracted,
            lease,
        })
    }

    /// Download `snapshot` unless its archive is already cached.
    ///
    /// Every other snapshot directory and every other archive in this
    /// snapshot's directory is evicted. Before a download the extracted root
    /// goes too, since it belongs to the old snapshot. Callers must hold the
    /// exclusive lock; [`prepare`](Self::prepare) does.
    pub fn ensure_fetched(&mut self, snapshot: &SnapshotRef, transport: &dyn Transport) -> Result<PathBuf> {
        let archive = self.archive_path(snapshot);
        if archive.is_file() {
            self.evict_siblings(snapshot)?;
            self.retained = Some(snapshot.clone());
            return Ok(archive);
        }

        for evicted in self.evict_except(snapshot.directory())? {
            info!("evicted stale stage3 cache entry {}", evicted.display());
        }

        let output_dir = self.dir.join(snapshot.directory());
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("creating '{}'", output_dir.display()))?;
        self.evict_siblings(snapshot)?;

        let partial = output_dir.join(format!("{}.partial", snapshot.archive_name()));
        info!(
            "fetching stage3 snapshot {} into {}",
            snapshot.download_url,
            archive.display()
        );

        let downloaded = download_to(&partial, &snapshot.download_url, transport);
        let bytes = match downloaded {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = fs::remove_file(&partial);
                return Err(err.context(format!(
                    "fetching stage3 snapshot into '{}'",
                    archive.display()
                )));
            }
        };

        atomic_move(&partial, &archive)?;
        debug!("fetched {} bytes", bytes);
        self.retained = Some(snapshot.clone());
        Ok(archive)
    }

    /// Extract `snapshot`'s archive into [`root`](Self::root) unless the root
    /// already holds it, then copy `tools_tree` on top.
    ///
    /// A root extracted from any other archive is discarded first.
    pub fn ensure_extracted(&self, snapshot: &SnapshotRef, tools_tree: Option<&Path>) -> Result<PathBuf> {
        let root = self.root();
        if self.holds(snapshot) {
            if let Some(tree) = tools_tree {
                overlay_tools_tree(tree, &root)?;
            }
            return Ok(root);
        }
        for stale in [self.dir.join(ROOT_PARTIAL_DIR), root.clone()] {
            if stale.exists() {
                fs::remove_dir_all(&stale)
                    .with_context(|| format!("removing stale '{}'", stale.display()))?;
            }
        }

        let archive = self.archive_path(snapshot);
        let partial = self.dir.join(ROOT_PARTIAL_DIR);
        info!("extracting {} to {}", snapshot.archive_name(), root.display());
        let populated = extract_archive(&archive, &partial)
            .and_then(|_| match tools_tree {
                Some(tree) => overlay_tools_tree(tree, &partial),
                None => Ok(()),
            })
            .and_then(|_| {
                let stamp = partial.join(SNAPSHOT_STAMP);
                fs::write(&stamp, format!("{}\n", snapshot.relative_path))
                    .with_context(|| format!("writing '{}'", stamp.display()))
            });
        if let Err(err) = populated {
            let _ = fs::remove_dir_all(&partial);
            return Err(err);
        }

        fs::rename(&partial, &root).with_context(|| {
            format!("moving '{}' to '{}'", partial.display(), root.display())
        })?;
        Ok(root)
    }

    /// Remove every directory in the cache except `keep`. Returns what was removed.
    pub fn evict_except(&self, keep: &str) -> Result<Vec<PathBuf>> {
        let mut evicted = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("reading stage3 cache '{}'", self.dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() || entry.file_name() == keep {
                continue;
            }
            let path = entry.path();
            fs::remove_dir_all(&path)
                .with_context(|| format!("evicting '{}'", path.display()))?;
            evicted.push(path);
        }
        evicted.sort();
        Ok(evicted)
    }

    /// Remove every file in `snapshot`'s directory except its archive.
    fn evict_siblings(&self, snapshot: &SnapshotRef) -> Result<()> {
        let dir = self.dir.join(snapshot.directory());
        for entry in fs::read_dir(&dir).with_context(|| format!("reading '{}'", dir.display()))? {
            let entry = entry?;
            if entry.file_name() == snapshot.archive_name() {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            }
            .with_context(|| format!("evicting '{}'", path.display()))?;
            info!("evicted stale stage3 archive {}", path.display());
        }
        Ok(())
    }
}

fn require_tools_tree(tree: &Path) -> Result<()> {
    if tree.is_dir() {
        Ok(())
    } else {
        Err(BackendError::missing_path("tools tree", tree).into())
    }
}

/// Copy a tools tree on top of an extracted root.
fn overlay_tools_tree(tree: &Path, root: &Path) -> Result<()> {
    require_tools_tree(tree)?;
    info!("copying tools tree {} onto {}", tree.display(), root.display());
    overlay_tree(tree, root)
}

fn download_to(partial: &Path, url: &str, transport: &dyn Transport) -> Result<u64> {
    let mut file =
        File::create(partial).with_context(|| format!("creating '{}'", partial.display()))?;
    let bytes = transport.download(url, &mut file)?;
    file.sync_all()
        .with_context(|| format!("syncing '{}'", partial.display()))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage3::extract::write_test_archive;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct ArchiveTransport {
        archive: Vec<u8>,
        fail_after: Option<usize>,
        downloads: AtomicUsize,
    }

    impl ArchiveTransport {
        fn serving(archive: &Path) -> Self {
            Self {
                archive: fs::read(archive).unwrap(),
                fail_after: None,
                downloads: AtomicUsize::new(0),
            }
        }
    }

    impl Transport for ArchiveTransport {
        fn fetch_text(&self, url: &str) -> Result<String> {
            panic!("unexpected index fetch of {}", url)
        }

        fn download(&self, url: &str, dest: &mut dyn Write) -> Result<u64> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            if let Some(n) = self.fail_after {
                dest.write_all(&self.archive[..n])?;
                return Err(BackendError::Network {
                    url: url.to_string(),
                    detail: "connection reset".to_string(),
                }
                .into());
            }
            dest.write_all(&self.archive)?;
            Ok(self.archive.len() as u64)
        }
    }

    fn snapshot(ts: &str) -> SnapshotRef {
        flavoured(ts, "nomultilib-systemd")
    }

    fn flavoured(ts: &str, variant: &str) -> SnapshotRef {
        SnapshotRef {
            timestamp_id: ts.to_string(),
            relative_path: format!("{ts}/stage3-amd64-{variant}-{ts}.tar.xz"),
            download_url: format!("https://mirror.test/{ts}-{variant}.tar.xz"),
        }
    }

    fn serving(temp: &TempDir, name: &str, files: &[(&str, &str)]) -> ArchiveTransport {
        let archive = temp.path().join(name);
        write_test_archive(&archive, files);
        ArchiveTransport::serving(&archive)
    }

    fn fixture(temp: &TempDir) -> ArchiveTransport {
        serving(temp, "fixture.tar.xz", &[("etc/os-release", "ID=gentoo\n")])
    }

    fn tools_tree(temp: &TempDir) -> PathBuf {
        let tools = temp.path().join("tools");
        fs::create_dir_all(tools.join("etc")).unwrap();
        fs::write(tools.join("etc/os-release"), "ID=tools\n").unwrap();
        fs::create_dir_all(tools.join("usr/bin")).unwrap();
        fs::write(tools.join("usr/bin/git"), "").unwrap();
        tools
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let transport = fixture(&temp);
        let mut cache = Stage3Cache::open(&temp.path().join("cache")).unwrap();
        let snap = snapshot("20250101T000000Z");

        let first = cache.prepare(&snap, &transport, None).unwrap();
        assert!(first.fetched && first.extracted);
        assert!(first.root.join("etc/os-release").is_file());
        drop(first);

        let second = cache.prepare(&snap, &transport, None).unwrap();
        assert!(!second.fetched && !second.extracted);
        assert_eq!(transport.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.retained(), Some(&snap));
    }

    #[test]
    fn test_new_snapshot_evicts_old_generation() {
        let temp = TempDir::new().unwrap();
        let transport = fixture(&temp);
        let mut cache = Stage3Cache::open(&temp.path().join("cache")).unwrap();

        cache.prepare(&snapshot("20241224T000000Z"), &transport, None).unwrap();
        let prepared = cache.prepare(&snapshot("20250101T000000Z"), &transport, None).unwrap();
        assert!(prepared.fetched && prepared.extracted);

        let mut snapshot_dirs: Vec<String> = fs::read_dir(cache.dir())
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().unwrap().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name != ROOT_DIR)
            .collect();
        snapshot_dirs.sort();
        assert_eq!(snapshot_dirs, vec!["20250101T000000Z".to_string()]);
        assert!(cache.root().join("etc/os-release").is_file());
    }

    #[test]
    fn test_failed_download_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let mut transport = fixture(&temp);
        transport.fail_after = Some(16);
        let mut cache = Stage3Cache::open(&temp.path().join("cache")).unwrap();
        let snap = snapshot("20250101T000000Z");

        let err = cache.ensure_fetched(&snap, &transport).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<BackendError>(),
            Some(BackendError::Network { .. })
        ));
        assert!(!cache.archive_path(&snap).exists());
        let leftovers: Vec<_> = fs::read_dir(cache.dir().join(snap.directory()))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_stale_partial_extraction_is_discarded() {
        let temp = TempDir::new().unwrap();
        let transport = fixture(&temp);
        let mut cache = Stage3Cache::open(&temp.path().join("cache")).unwrap();
        let snap = snapshot("20250101T000000Z");
        cache.ensure_fetched(&snap, &transport).unwrap();

        fs::create_dir_all(cache.dir().join(ROOT_PARTIAL_DIR).join("junk")).unwrap();
        let root = cache.ensure_extracted(&snap, None).unwrap();

        assert!(!root.join("junk").exists());
        assert!(!cache.dir().join(ROOT_PARTIAL_DIR).exists());
    }

    #[test]
    fn test_missing_tools_tree_fails_before_download() {
        let temp = TempDir::new().unwrap();
        let transport = fixture(&temp);
        let mut cache = Stage3Cache::open(&temp.path().join("cache")).unwrap();

        let err = cache
            .prepare(
                &snapshot("20250101T000000Z"),
                &transport,
                Some(temp.path().join("missing").as_path()),
            )
            .unwrap_err();

        assert!(crate::error::kind_of(&err).is_some_and(BackendError::is_configuration));
        assert_eq!(transport.downloads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tools_tree_is_baked_into_fresh_root() {
        let temp = TempDir::new().unwrap();
        let transport = fixture(&temp);
        let tools = tools_tree(&temp);
        let mut cache = Stage3Cache::open(&temp.path().join("cache")).unwrap();

        let prepared = cache
            .prepare(&snapshot("20250101T000000Z"), &transport, Some(tools.as_path()))
            .unwrap();

        assert_eq!(
            fs::read_to_string(prepared.root.join("etc/os-release")).unwrap(),
            "ID=tools\n"
        );
        assert!(prepared.root.join("usr/bin/git").is_file());
    }

    #[test]
    fn test_tools_tree_reaches_an_already_extracted_root() {
        let temp = TempDir::new().unwrap();
        let transport = fixture(&temp);
        let tools = tools_tree(&temp);
        let mut cache = Stage3Cache::open(&temp.path().join("cache")).unwrap();
        let snap = snapshot("20250101T000000Z");

        drop(cache.prepare(&snap, &transport, None).unwrap());
        let prepared = cache.prepare(&snap, &transport, Some(tools.as_path())).unwrap();

        assert!(!prepared.fetched && !prepared.extracted);
        assert!(prepared.root.join("usr/bin/git").is_file());
        assert_eq!(
            fs::read_to_string(prepared.root.join("etc/os-release")).unwrap(),
            "ID=tools\n"
        );
        assert_eq!(transport.downloads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_root_follows_the_requested_archive() {
        let temp = TempDir::new().unwrap();
        let systemd = serving(&temp, "systemd.tar.xz", &[("etc/init", "systemd\n")]);
        let openrc = serving(&temp, "openrc.tar.xz", &[("etc/init", "openrc\n")]);
        let mut cache = Stage3Cache::open(&temp.path().join("cache")).unwrap();
        let ts = "20250101T000000Z";
        let (first, second) = (snapshot(ts), flavoured(ts, "openrc"));

        drop(cache.prepare(&first, &systemd, None).unwrap());
        drop(cache.prepare(&second, &openrc, None).unwrap());
        assert!(cache.holds(&second) && !cache.holds(&first));

        let prepared = cache.prepare(&first, &systemd, None).unwrap();

        assert!(prepared.fetched && prepared.extracted);
        assert_eq!(
            fs::read_to_string(prepared.root.join("etc/init")).unwrap(),
            "systemd\n"
        );
        let archives: Vec<_> = fs::read_dir(cache.dir().join(ts))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(archives, vec![first.archive_name().to_string()]);
    }

    #[test]
    fn test_second_lease_in_process_fails_instead_of_deadlocking() {
        let temp = TempDir::new().unwrap();
        let transport = fixture(&temp);
        let mut first = Stage3Cache::open(&temp.path().join("cache")).unwrap();
        let mut second = Stage3Cache::open(&temp.path().join("cache")).unwrap();

        let held = first.prepare(&snapshot("20241224T000000Z"), &transport, None).unwrap();
        let err = second
            .prepare(&snapshot("20250101T000000Z"), &transport, None)
            .unwrap_err();

        assert!(crate::error::kind_of(&err).is_some_and(BackendError::is_configuration));
        assert!(held.root.join("etc/os-release").is_file());
        drop(held);

        second
            .prepare(&snapshot("20250101T000000Z"), &transport, None)
            .unwrap();
    }

    #[test]
    fn test_package_cache_layout() {
        let temp = TempDir::new().unwrap();
        ensure_package_cache_layout(temp.path()).unwrap();
        assert!(temp.path().join(BINPKGS_SUBDIR).is_dir());
        assert!(temp.path().join(DISTFILES_SUBDIR).is_dir());
        assert!(temp.path().join(REPOS_SUBDIR).is_dir());
    }
}
