//! Compressed tar extraction.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::Path;
use tar::{Archive, EntryType};
use tracing::debug;

/// Compression formats understood by [`extract_archive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Xz,
    Zstd,
    None,
}

impl Compression {
    /// Pick the decoder from the archive's file name.
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Ok(Self::Xz)
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            Ok(Self::Zstd)
        } else if name.ends_with(".tar") {
            Ok(Self::None)
        } else {
            bail!("unsupported archive format: {}", path.display())
        }
    }
}

/// Extract `archive` into `dest`, creating it if needed. Returns entries unpacked.
///
/// Permissions, mtimes and xattrs are preserved. Device nodes and fifos are
/// skipped: they cannot be created without privileges and the sandbox
/// provides its own `/dev`.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<u64> {
    let compression = Compression::from_path(archive)?;
    let file = File::open(archive)
        .with_context(|| format!("opening archive '{}'", archive.display()))?;
    let reader = BufReader::new(file);

    let decoder: Box<dyn Read> = match compression {
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
        Compression::Zstd => Box::new(
            zstd::stream::read::Decoder::new(reader)
                .with_context(|| format!("initialising zstd for '{}'", archive.display()))?,
        ),
        Compression::None => Box::new(reader),
    };

    unpack(decoder, dest).with_context(|| {
        format!(
            "extracting '{}' into '{}'",
            archive.display(),
            dest.display()
        )
    })
}

fn unpack(reader: impl Read, dest: &Path) -> Result<u64> {
    fs::create_dir_all(dest)?;

    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);

    let mut unpacked = 0u64;
    for entry in archive.entries()? {
        let mut entry = entry?;
        match entry.header().entry_type() {
            EntryType::Char | EntryType::Block | EntryType::Fifo => {
                debug!("skipping special file {}", entry.path()?.display());
                continue;
            }
            _ => {}
        }
        if entry.unpack_in(dest)? {
            unpacked += 1;
        }
    }

    Ok(unpacked)
}

/// Write an xz-compressed tar of regular files, for tests.
#[cfg(test)]
pub(crate) fn write_test_archive(path: &Path, files: &[(&str, &str)]) {
    use std::io::Write;

    let file = File::create(path).unwrap();
    let encoder = xz2::write::XzEncoder::new(file, 1);
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .unwrap();
    }
    let encoder = builder.into_inner().unwrap();
    encoder.finish().unwrap().flush().unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_compression_from_path() {
        assert_eq!(
            Compression::from_path(Path::new("stage3-amd64.tar.xz")).unwrap(),
            Compression::Xz
        );
        assert_eq!(
            Compression::from_path(Path::new("rootfs.tar.zst")).unwrap(),
            Compression::Zstd
        );
        assert!(Compression::from_path(Path::new("stage3.zip")).is_err());
    }

    #[test]
    fn test_extracts_xz_archive() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("stage3.tar.xz");
        write_test_archive(
            &archive,
            &[("etc/passwd", "root:x:0:0::/root:/bin/bash\n"), ("usr/bin/emerge", "#!/bin/sh\n")],
        );

        let dest = temp.path().join("root");
        let count = extract_archive(&archive, &dest).unwrap();

        assert_eq!(count, 2);
        assert!(fs::read_to_string(dest.join("etc/passwd"))
            .unwrap()
            .starts_with("root:"));
        assert!(dest.join("usr/bin/emerge").is_file());
    }

    #[test]
    fn test_extracts_zstd_archive() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("tree.tar.zst");
        {
            let file = File::create(&archive).unwrap();
            let encoder = zstd::stream::write::Encoder::new(file, 3).unwrap();
            let mut builder = tar::Builder::new(encoder);
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "hello", &b"world"[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = temp.path().join("out");
        extract_archive(&archive, &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("hello")).unwrap(), "world");
    }

    #[test]
    fn test_corrupt_archive_fails() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("broken.tar.xz");
        fs::write(&archive, b"not xz at all").unwrap();

        assert!(extract_archive(&archive, &temp.path().join("root")).is_err());
    }
}
