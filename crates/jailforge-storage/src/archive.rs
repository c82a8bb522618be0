//! Layer archives.
//!
//! Archives are tar streams compressed with zstd. Unpacking also accepts
//! gzip and uncompressed tar, so release tarballs can be imported directly.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use jailforge_common::{ForgeError, ForgeResult};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Write `entries` (relative to `root`) into a zstd-compressed tar at `archive`.
///
/// Directories are added recursively and symlinks are stored as links.
/// Entries that no longer exist are skipped with a warning.
///
/// # Errors
///
/// Returns an error if the archive cannot be written.
pub fn pack(root: &Path, entries: &[String], archive: &Path, level: i32) -> ForgeResult<()> {
    if let Some(parent) = archive.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = BufWriter::new(File::create(archive)?);
    let encoder = zstd::stream::write::Encoder::new(file, level)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in entries {
        let relative = entry.trim_start_matches("./");
        let source = root.join(relative);
        let metadata = match std::fs::symlink_metadata(&source) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %source.display(), "Skipping vanished archive entry");
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        if metadata.is_dir() {
            builder.append_dir_all(relative, &source)?;
        } else {
            builder.append_path_with_name(&source, relative)?;
        }
    }

    let mut file = builder.into_inner()?.finish()?;
    file.flush()?;

    tracing::debug!(archive = %archive.display(), entries = entries.len(), "Archive written");
    Ok(())
}

/// Unpack `archive` into `dest`, detecting the compression from its header.
///
/// # Errors
///
/// Returns an error if the archive cannot be read or extracted.
pub fn unpack(archive: &Path, dest: &Path) -> ForgeResult<()> {
    let mut file = File::open(archive)?;
    let mut magic = [0u8; 4];
    let read = read_prefix(&mut file, &mut magic)?;
    drop(file);

    let input = BufReader::new(File::open(archive)?);
    let reader: Box<dyn Read> = if magic[..read].starts_with(&GZIP_MAGIC) {
        Box::new(flate2::read::GzDecoder::new(input))
    } else if magic[..read].starts_with(&ZSTD_MAGIC) {
        Box::new(zstd::stream::read::Decoder::new(input)?)
    } else {
        Box::new(input)
    };

    std::fs::create_dir_all(dest)?;
    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);
    tar.set_unpack_xattrs(true);
    tar.set_overwrite(true);
    tar.unpack(dest).map_err(|e| ForgeError::Internal {
        message: format!("Failed to extract {}: {e}", archive.display()),
    })?;

    tracing::debug!(archive = %archive.display(), dest = %dest.display(), "Archive extracted");
    Ok(())
}

fn read_prefix(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> tempfile::TempDir {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("etc/rc.d")).unwrap();
        std::fs::write(temp.path().join("etc/rc.conf"), "sshd_enable=YES\n").unwrap();
        std::fs::write(temp.path().join("etc/rc.d/app"), "#!/bin/sh\n").unwrap();
        std::fs::write(temp.path().join("untouched"), "x").unwrap();
        std::os::unix::fs::symlink("rc.conf", temp.path().join("etc/rc.link")).unwrap();
        temp
    }

    #[test]
    fn pack_only_listed_entries() {
        let src = tree();
        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("nested/layer.tar.zst");

        pack(
            src.path(),
            &[
                "./etc/rc.conf".to_string(),
                "./etc/rc.d".to_string(),
                "./etc/rc.link".to_string(),
                "./missing".to_string(),
            ],
            &archive,
            3,
        )
        .unwrap();

        let dest = tempfile::tempdir().unwrap();
        unpack(&archive, dest.path()).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.path().join("etc/rc.conf")).unwrap(),
            "sshd_enable=YES\n"
        );
        assert!(dest.path().join("etc/rc.d/app").is_file());
        assert!(!dest.path().join("untouched").exists());
        let link = std::fs::read_link(dest.path().join("etc/rc.link")).unwrap();
        assert_eq!(link, Path::new("rc.conf"));
    }

    #[test]
    fn unpack_gzip_and_plain() {
        let src = tree();
        let out = tempfile::tempdir().unwrap();

        let plain = out.path().join("base.tar");
        {
            let mut builder = tar::Builder::new(File::create(&plain).unwrap());
            builder
                .append_path_with_name(src.path().join("untouched"), "untouched")
                .unwrap();
            builder.finish().unwrap();
        }

        let gz = out.path().join("base.tgz");
        {
            let encoder = flate2::write::GzEncoder::new(
                File::create(&gz).unwrap(),
                flate2::Compression::default(),
            );
            let mut builder = tar::Builder::new(encoder);
            builder
                .append_path_with_name(src.path().join("etc/rc.conf"), "rc.conf")
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = tempfile::tempdir().unwrap();
        unpack(&plain, dest.path()).unwrap();
        unpack(&gz, dest.path()).unwrap();
        assert!(dest.path().join("untouched").is_file());
        assert!(dest.path().join("rc.conf").is_file());
    }
}
