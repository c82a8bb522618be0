//! Content-addressed layer chains.
//!
//! A chain starts at a base dataset. Every [`LayerChain::append`] clones the
//! current tip into a new dataset whose name is derived from the chain
//! position, so replaying the same steps on the same base reuses the layers
//! built last time.

use std::future::Future;
use std::path::PathBuf;

use sha2::{Digest as _, Sha256};

use jailforge_common::{ForgeError, ForgeResult};

use crate::zfs::{self, Zfs};

/// Identity of the next layer in a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerKey {
    /// Hash of the step counter, this name and the current tip.
    Derived(String),
    /// Use this identifier as is.
    Explicit(String),
}

impl LayerKey {
    /// Resolve to the dataset identifier used at this chain position.
    #[must_use]
    pub fn resolve(&self, counter: u64, tip: &str) -> String {
        match self {
            Self::Derived(name) => {
                let digest = Sha256::digest(format!("{counter} {name} {tip}").as_bytes());
                hex::encode(digest)
            }
            Self::Explicit(raw) => raw.clone(),
        }
    }
}

/// Handle to a freshly cloned layer, given to the populate step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerStorage {
    /// Full dataset name.
    pub dataset: String,
    /// Mountpoint.
    pub path: PathBuf,
}

/// An ordered chain of layers cloned from one another.
///
/// Not shared between provisioning runs: each run builds its own chain.
#[derive(Debug)]
pub struct LayerChain {
    zfs: Zfs,
    root: String,
    counter: u64,
    tip: String,
    history: Vec<String>,
}

impl LayerChain {
    /// Start a chain at `base`, placing new layers below `root`.
    #[must_use]
    pub fn new(zfs: Zfs, root: impl Into<String>, base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            zfs,
            root: root.into().trim_end_matches('/').to_string(),
            counter: 1,
            tip: base.clone(),
            history: vec![base],
        }
    }

    /// Dataset the next layer will be cloned from.
    #[must_use]
    pub fn tip(&self) -> &str {
        &self.tip
    }

    /// Every dataset of the chain, base first.
    #[must_use]
    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Append a layer.
    ///
    /// If a dataset already exists at the computed address it is reused,
    /// unless `cacheable` is false, in which case it is destroyed and rebuilt.
    /// Otherwise the tip is snapshotted, cloned and handed to `populate`.
    /// When `populate` fails the clone is destroyed before the error is
    /// returned, and the chain is left unchanged.
    ///
    /// # Errors
    ///
    /// Returns `CloneFailed` if the tip cannot be cloned, `DestroyFailed` if a
    /// stale layer cannot be removed, or the error from `populate`.
    pub async fn append<F, Fut>(
        &mut self,
        key: LayerKey,
        populate: F,
        cacheable: bool,
    ) -> ForgeResult<LayerStorage>
    where
        F: FnOnce(LayerStorage) -> Fut,
        Fut: Future<Output = ForgeResult<()>>,
    {
        let counter = self.counter + 1;
        let dataset = format!("{}/{}", self.root, key.resolve(counter, &self.tip));

        if !cacheable && self.has(&dataset).await? {
            tracing::debug!(dataset = %dataset, "Discarding cached layer");
            let name = dataset.clone();
            if !self.zfs.unblock(move |zfs| zfs.destroy(&name)).await? {
                return Err(ForgeError::DestroyFailed { name: dataset });
            }
        }

        let storage = if self.has(&dataset).await? {
            tracing::info!(step = counter, dataset = %dataset, "Layer cache hit");
            self.storage(&dataset).await?
        } else {
            self.build(&dataset, populate).await?
        };

        self.counter = counter;
        self.tip.clone_from(&dataset);
        self.history.push(dataset);
        Ok(storage)
    }

    async fn build<F, Fut>(&self, dataset: &str, populate: F) -> ForgeResult<LayerStorage>
    where
        F: FnOnce(LayerStorage) -> Fut,
        Fut: Future<Output = ForgeResult<()>>,
    {
        let tip = self.tip.clone();
        let target = dataset.to_string();
        let cloned = self
            .zfs
            .unblock(move |adapter| {
                zfs::ignore_exists(adapter.snapshot(&tip, zfs::SYNC))?;
                Ok::<_, ForgeError>(adapter.clone_snapshot(&tip, zfs::SYNC, &target, &[]))
            })
            .await??;
        if !cloned {
            return Err(ForgeError::CloneFailed {
                snapshot: zfs::snapshot_name(&self.tip, zfs::SYNC),
                target: dataset.to_string(),
            });
        }

        let result = match self.storage(dataset).await {
            Ok(storage) => populate(storage.clone()).await.map(|()| storage),
            Err(err) => Err(err),
        };

        match result {
            Ok(storage) => {
                tracing::info!(dataset = %dataset, "Layer built");
                Ok(storage)
            }
            Err(err) => {
                let name = dataset.to_string();
                if !self.zfs.unblock(move |zfs| zfs.destroy(&name)).await.unwrap_or(false) {
                    tracing::warn!(dataset = %dataset, "Could not remove partially built layer");
                }
                Err(err)
            }
        }
    }

    async fn has(&self, dataset: &str) -> ForgeResult<bool> {
        let name = dataset.to_string();
        self.zfs.unblock(move |zfs| zfs.has(&name)).await
    }

    async fn storage(&self, dataset: &str) -> ForgeResult<LayerStorage> {
        let name = dataset.to_string();
        let path = self.zfs.unblock(move |zfs| zfs.get(&name, "mountpoint")).await??;
        Ok(LayerStorage {
            dataset: dataset.to_string(),
            path: PathBuf::from(path),
        })
    }
}
