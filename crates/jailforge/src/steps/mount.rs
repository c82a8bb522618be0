//! Nullfs mounts and named volumes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use jailforge_common::ForgeResult;
use jailforge_storage::Layers;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::manifest::{MountSpec, VolumeSpec};
use crate::recorder::Step;
use crate::runner::{Runner, command};

use super::jail_path;

/// Default volume name: UUIDv5 (DNS namespace) of `"<jail> <path>"`.
#[must_use]
pub fn volume_name(jail: &str, path: &Path) -> String {
    let seed = format!("{jail} {}", path.display());
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, seed.as_bytes()).to_string()
}

/// Nullfs mounts of host directories and named volumes into the jail root.
#[derive(Debug)]
pub struct MountStep {
    runner: Runner,
    volumes: Layers,
    jail: String,
    root: PathBuf,
    workdir: PathBuf,
    mounts: Vec<MountSpec>,
    volume_specs: Vec<VolumeSpec>,
    mounted: Mutex<Vec<PathBuf>>,
}

impl MountStep {
    /// Mount into the root of jail `jail`; named volumes live in `volumes`.
    #[must_use]
    pub fn new(
        runner: Runner,
        volumes: Layers,
        jail: impl Into<String>,
        root: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            volumes,
            jail: jail.into(),
            root: root.into(),
            workdir: workdir.into(),
            mounts: Vec::new(),
            volume_specs: Vec::new(),
            mounted: Mutex::new(Vec::new()),
        }
    }

    /// Host directories to mount.
    #[must_use]
    pub fn with_mounts(mut self, mounts: Vec<MountSpec>) -> Self {
        self.mounts = mounts;
        self
    }

    /// Named volumes to mount.
    #[must_use]
    pub fn with_volumes(mut self, volumes: Vec<VolumeSpec>) -> Self {
        self.volume_specs = volumes;
        self
    }

    /// Host paths currently mounted, in mount order.
    #[must_use]
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.mounted.lock().clone()
    }

    async fn mount_all(&self) -> ForgeResult<()> {
        for mount in &self.mounts {
            let dst = jail_path(&self.root, &mount.dst);
            self.mount(&mount.src, &dst, mount.read_only).await?;
        }

        if !self.volume_specs.is_empty() {
            self.volumes.unblock(|volumes| volumes.ensure_root()).await?;
        }
        for volume in &self.volume_specs {
            let path = self.workdir.join(&volume.path);
            let name = volume
                .name
                .clone()
                .unwrap_or_else(|| volume_name(&self.jail, &volume.path));
            let lookup = name.clone();
            let layer = self
                .volumes
                .unblock(move |volumes| volumes.get_or_create(&lookup, None))
                .await?;
            tracing::debug!(jail = %self.jail, volume = %name, dataset = %layer.dataset, "Using volume");

            let dst = jail_path(&self.root, &path);
            self.mount(&layer.path, &dst, false).await?;
        }
        Ok(())
    }

    async fn mount(&self, src: &Path, dst: &Path, read_only: bool) -> ForgeResult<()> {
        tokio::fs::create_dir_all(dst).await?;

        let mut mount = command("mount", ["-t", "nullfs"]);
        if read_only {
            mount.args(["-o", "ro"]);
        }
        mount.arg(src).arg(dst);
        self.runner.check(mount).await?;

        tracing::info!(src = %src.display(), dst = %dst.display(), read_only, "Mounted");
        self.mounted.lock().push(dst.to_path_buf());
        Ok(())
    }

    async fn unmount_all(&self) -> ForgeResult<()> {
        let mounted = std::mem::take(&mut *self.mounted.lock());
        let mut first_error = None;

        for dst in mounted.iter().rev() {
            let mut umount = command("umount", ["-f"]);
            umount.arg(dst);
            match self.runner.check(umount).await {
                Ok(_) => tracing::info!(dst = %dst.display(), "Unmounted"),
                Err(err) => {
                    tracing::warn!(dst = %dst.display(), error = %err, "Unmount failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Step for MountStep {
    fn name(&self) -> &str {
        "mount"
    }

    async fn execute(&self) -> ForgeResult<()> {
        if let Err(err) = self.mount_all().await {
            if let Err(cleanup) = self.unmount_all().await {
                tracing::warn!(error = %cleanup, "Could not undo partial mounts");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn compensate(&self) -> ForgeResult<()> {
        self.unmount_all().await
    }
}
