//! Jail root materialization.
//!
//! The root dataset is the tip of a layer chain started at the base image.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use jailforge_common::{Digest, ForgeError, ForgeResult};
use jailforge_storage::{LayerChain, LayerKey, LayerStorage, Layers, Zfs};

use crate::recorder::Step;

/// Builds the jail root dataset by chaining layers on top of the base image.
///
/// The chain is `base → [resolv.conf layer] → <jail name>`. The resolv layer is
/// keyed by the file content and reused between jails; the jail layer is
/// always rebuilt.
#[derive(Debug)]
pub struct MaterializeStep {
    zfs: Zfs,
    containers: String,
    base: String,
    jail: String,
    resolv: Option<PathBuf>,
    storage: OnceLock<LayerStorage>,
}

impl MaterializeStep {
    /// Build jail `jail` below `containers`, starting from dataset `base`.
    #[must_use]
    pub fn new(
        zfs: Zfs,
        containers: impl Into<String>,
        base: impl Into<String>,
        jail: impl Into<String>,
    ) -> Self {
        Self {
            zfs,
            containers: containers.into(),
            base: base.into(),
            jail: jail.into(),
            resolv: None,
            storage: OnceLock::new(),
        }
    }

    /// Copy this host file to `etc/resolv.conf` in its own layer.
    #[must_use]
    pub fn with_resolv(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv = Some(path.into());
        self
    }

    /// The jail root layer, once built.
    #[must_use]
    pub fn storage(&self) -> Option<&LayerStorage> {
        self.storage.get()
    }

    /// Mountpoint of the jail root, once built.
    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.storage().map(|s| s.path.as_path())
    }
}

#[async_trait]
impl Step for MaterializeStep {
    fn name(&self) -> &str {
        "materialize"
    }

    async fn execute(&self) -> ForgeResult<()> {
        Layers::new(self.zfs.clone(), self.containers.as_str())
            .unblock(|layers| layers.ensure_root())
            .await?;
        let mut chain = LayerChain::new(self.zfs.clone(), self.containers.as_str(), self.base.as_str());

        if let Some(resolv) = &self.resolv {
            let content = tokio::fs::read(resolv).await?;
            let digest = Digest::sha256_of(&content);
            tracing::info!(jail = %self.jail, "Syncing resolv.conf");
            chain
                .append(
                    LayerKey::Derived(format!("resolv:{}", digest.hash)),
                    |storage| async move {
                        let etc = storage.path.join("etc");
                        tokio::fs::create_dir_all(&etc).await?;
                        tokio::fs::write(etc.join("resolv.conf"), content).await?;
                        Ok(())
                    },
                    true,
                )
                .await?;
        }

        let storage = chain
            .append(LayerKey::Explicit(self.jail.clone()), |_| async { Ok(()) }, false)
            .await?;
        tracing::info!(jail = %self.jail, dataset = %storage.dataset, path = %storage.path.display(), "Jail root ready");

        self.storage.set(storage).map_err(|_| ForgeError::Internal {
            message: format!("jail root of {} built twice", self.jail),
        })
    }

    async fn compensate(&self) -> ForgeResult<()> {
        let Some(storage) = self.storage.get() else {
            return Ok(());
        };
        let dataset = storage.dataset.clone();
        if self.zfs.unblock(move |zfs| zfs.destroy(&dataset)).await? {
            Ok(())
        } else {
            Err(ForgeError::DestroyFailed {
                name: storage.dataset.clone(),
            })
        }
    }
}
