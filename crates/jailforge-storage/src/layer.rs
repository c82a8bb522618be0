//! A single layer: a dataset bracketed by `first` and `last` snapshots.

use std::path::{Path, PathBuf};

use jailforge_common::paths::escapes;
use jailforge_common::{ForgeError, ForgeResult};

use crate::archive;
use crate::diff::{DIFF_FILE, DiffAction, DiffRecord, FolderDiff};
use crate::zfs::{self, Zfs};

/// A layer dataset and its logical metadata.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Logical name, relative to the layer root.
    pub name: String,
    /// Full dataset name.
    pub dataset: String,
    /// Mountpoint.
    pub path: PathBuf,
    /// Dataset this layer was cloned from, if any.
    pub parent: Option<String>,
    zfs: Zfs,
}

impl Layer {
    /// Describe an existing dataset as a layer.
    #[must_use]
    pub fn new(
        zfs: Zfs,
        name: impl Into<String>,
        dataset: impl Into<String>,
        path: impl Into<PathBuf>,
        parent: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            dataset: dataset.into(),
            path: path.into(),
            parent,
            zfs,
        }
    }

    /// Read-only view of a snapshot of this layer.
    #[must_use]
    pub fn snapshot_dir(&self, label: &str) -> PathBuf {
        self.path.join(".zfs").join("snapshot").join(label)
    }

    /// Archive file name used by [`Layer::compress`].
    #[must_use]
    pub fn archive_name(&self) -> String {
        format!("{}.tar.zst", self.name.replace('/', "_"))
    }

    /// Package the changes made since `first` into `<dest_dir>/<name>.tar.zst`.
    ///
    /// Takes the `last` snapshot if it is missing, writes the diff to the
    /// [`DIFF_FILE`] marker inside the layer and archives every added or
    /// changed path together with the marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot, the diff or the archive fails.
    pub async fn compress(&self, dest_dir: &Path, level: i32) -> ForgeResult<PathBuf> {
        tracing::info!(layer = %self.name, "Compressing layer");

        zfs::ignore_exists(self.zfs.snapshot(&self.dataset, zfs::LAST))?;

        let engine = FolderDiff::new(self.zfs.executor().clone());
        let record = engine
            .compute(&self.snapshot_dir(zfs::FIRST), &self.snapshot_dir(zfs::LAST))
            .await?;

        tokio::fs::write(self.path.join(DIFF_FILE), record.to_string()).await?;

        let mut entries = record.files(&[DiffAction::Added, DiffAction::Changed]);
        entries.push(format!("./{DIFF_FILE}"));

        let archive = dest_dir.join(self.archive_name());
        let root = self.path.clone();
        let target = archive.clone();
        tokio::task::spawn_blocking(move || archive::pack(&root, &entries, &target, level))
            .await
            .map_err(|e| ForgeError::Internal {
                message: format!("archive task failed: {e}"),
            })??;

        tracing::info!(
            layer = %self.name,
            archive = %archive.display(),
            changes = record.len(),
            "Layer compressed"
        );
        Ok(archive)
    }

    /// Rebuild this layer from an archive made by [`Layer::compress`].
    ///
    /// Unpacks into the mountpoint, then removes every path the marker lists
    /// as deleted. Paths that are already gone are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if unpacking fails, the marker is missing or invalid,
    /// or a deleted path cannot be removed. A marker naming a path outside
    /// the layer is rejected with [`ForgeError::Serialization`] before
    /// anything is removed.
    pub async fn decompress(&self, archive: &Path) -> ForgeResult<DiffRecord> {
        tracing::info!(layer = %self.name, archive = %archive.display(), "Decompressing layer");

        let source = archive.to_path_buf();
        let dest = self.path.clone();
        tokio::task::spawn_blocking(move || archive::unpack(&source, &dest))
            .await
            .map_err(|e| ForgeError::Internal {
                message: format!("archive task failed: {e}"),
            })??;

        let text = tokio::fs::read_to_string(self.path.join(DIFF_FILE)).await?;
        let record: DiffRecord = text.parse()?;

        let deleted = record
            .files(&[DiffAction::Deleted])
            .into_iter()
            .map(|path| self.inside(&path))
            .collect::<ForgeResult<Vec<_>>>()?;
        for path in deleted {
            remove_path(&path).await?;
        }

        tracing::info!(layer = %self.name, changes = record.len(), "Layer decompressed");
        Ok(record)
    }

    fn inside(&self, entry: &str) -> ForgeResult<PathBuf> {
        let relative = Path::new(entry.trim_start_matches("./"));
        if relative.has_root() || escapes(relative) {
            return Err(ForgeError::Serialization(format!(
                "diff entry outside layer {}: {entry}",
                self.name
            )));
        }
        Ok(self.path.join(relative))
    }

    /// Destroy the dataset and everything depending on it.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::DestroyFailed`] if the dataset could not be removed.
    pub fn destroy(&self) -> ForgeResult<()> {
        if self.zfs.destroy(&self.dataset) {
            tracing::info!(layer = %self.name, "Layer destroyed");
            Ok(())
        } else {
            Err(ForgeError::DestroyFailed {
                name: self.dataset.clone(),
            })
        }
    }
}

async fn remove_path(path: &Path) -> ForgeResult<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}
