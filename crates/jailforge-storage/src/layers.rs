//! Named layers under a common parent dataset.
//!
//! Used for long-lived images and volumes. Each layer is either a fresh root
//! dataset or a clone of another layer's `last` snapshot, and always carries
//! a `first` snapshot taken right after creation.

use std::path::PathBuf;

use jailforge_common::{ForgeError, ForgeResult};

use crate::layer::Layer;
use crate::zfs::{self, ListOptions, Zfs};

/// Layers stored below one parent dataset.
#[derive(Debug, Clone)]
pub struct Layers {
    zfs: Zfs,
    root: String,
}

impl Layers {
    /// Layers below `root` (for example `zroot/jailforge/images`).
    #[must_use]
    pub fn new(zfs: Zfs, root: impl Into<String>) -> Self {
        Self {
            zfs,
            root: root.into().trim_end_matches('/').to_string(),
        }
    }

    /// The parent dataset.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// The adapter layers are managed through.
    #[must_use]
    pub fn zfs(&self) -> &Zfs {
        &self.zfs
    }

    /// Run `f` against these layers on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::Internal`] if the task panics, otherwise the
    /// result of `f`.
    pub async fn unblock<T, F>(&self, f: F) -> ForgeResult<T>
    where
        F: FnOnce(&Layers) -> ForgeResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let layers = self.clone();
        tokio::task::spawn_blocking(move || f(&layers))
            .await
            .map_err(|e| ForgeError::Internal {
                message: format!("layer task failed: {e}"),
            })?
    }

    /// Full dataset name of layer `name`.
    #[must_use]
    pub fn dataset(&self, name: &str) -> String {
        format!("{}/{name}", self.root)
    }

    /// Create the parent dataset if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the dataset cannot be created.
    pub fn ensure_root(&self) -> ForgeResult<()> {
        if self.zfs.has(&self.root) {
            return Ok(());
        }
        zfs::ignore_exists(self.zfs.create(&self.root, &[]))
    }

    /// Create layer `name`, cloned from layer `parent` when given.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the layer exists, `CloneFailed` if the
    /// parent cannot be cloned, or any snapshot error. A dataset created
    /// before the failure is destroyed again.
    pub fn create(&self, name: &str, parent: Option<&str>) -> ForgeResult<Layer> {
        let dataset = self.dataset(name);

        match parent {
            None => self.zfs.create(&dataset, &[])?,
            Some(parent) => {
                let parent_dataset = self.dataset(parent);
                zfs::ignore_exists(self.zfs.snapshot(&parent_dataset, zfs::LAST))?;
                if !self.zfs.clone_snapshot(&parent_dataset, zfs::LAST, &dataset, &[]) {
                    return Err(ForgeError::CloneFailed {
                        snapshot: zfs::snapshot_name(&parent_dataset, zfs::LAST),
                        target: dataset,
                    });
                }
            }
        }

        let stamped = self
            .zfs
            .snapshot(&dataset, zfs::FIRST)
            .and_then(|()| self.mountpoint(&dataset));
        let path = match stamped {
            Ok(path) => path,
            Err(err) => {
                if !self.zfs.destroy(&dataset) {
                    tracing::warn!(dataset = %dataset, "Could not remove partially created layer");
                }
                return Err(err);
            }
        };

        tracing::info!(layer = %name, parent = ?parent, "Layer created");
        Ok(Layer::new(
            self.zfs.clone(),
            name,
            dataset,
            path,
            parent.map(str::to_string),
        ))
    }

    /// Look up layer `name`, recovering its parent from the clone origin.
    ///
    /// # Errors
    ///
    /// Returns `DatasetNotFound` if the layer does not exist.
    pub fn get(&self, name: &str) -> ForgeResult<Layer> {
        let dataset = self.dataset(name);
        if !self.zfs.has(&dataset) {
            return Err(ForgeError::DatasetNotFound { name: dataset });
        }

        let origin = self.zfs.get(&dataset, "origin")?;
        let parent = self.parent_from_origin(&origin);
        let path = self.mountpoint(&dataset)?;

        Ok(Layer::new(self.zfs.clone(), name, dataset, path, parent))
    }

    /// Whether layer `name` exists.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.zfs.has(&self.dataset(name))
    }

    /// Return layer `name`, creating it from `parent` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns any error from [`Layers::get`] or [`Layers::create`].
    pub fn get_or_create(&self, name: &str, parent: Option<&str>) -> ForgeResult<Layer> {
        if self.has(name) {
            self.get(name)
        } else {
            self.create(name, parent)
        }
    }

    /// Names of all layers, relative to the parent dataset.
    ///
    /// # Errors
    ///
    /// Returns an error if listing fails.
    pub fn list(&self) -> ForgeResult<Vec<String>> {
        let rows = self
            .zfs
            .list(&ListOptions::default().prefix(&self.root).sort_asc("name"))?;

        Ok(rows
            .iter()
            .filter_map(|row| self.relative(row.name()))
            .map(str::to_string)
            .collect())
    }

    fn relative<'a>(&self, dataset: &'a str) -> Option<&'a str> {
        dataset
            .strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
    }

    /// `zroot/jf/images/base@last` → `base`; origins outside the root keep
    /// their full dataset name; `-` means not a clone.
    fn parent_from_origin(&self, origin: &str) -> Option<String> {
        let (dataset, _label) = origin.split_once('@')?;
        Some(
            self.relative(dataset)
                .map_or_else(|| dataset.to_string(), str::to_string),
        )
    }

    fn mountpoint(&self, dataset: &str) -> ForgeResult<PathBuf> {
        self.zfs.get(dataset, "mountpoint").map(PathBuf::from)
    }
}
