//! Base images.
//!
//! A base is a release tarball (`<bases_url>/<name>.tar`) unpacked into a root
//! layer. Downloads are cached, so a destroyed base can be rebuilt offline.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use reqwest::Client;
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use jailforge_common::{Digest, ForgeError, ForgeResult};

use crate::archive;
use crate::layer::Layer;
use crate::layers::Layers;
use crate::zfs;

/// Fetches base tarballs and materializes them as layers.
#[derive(Debug, Clone)]
pub struct BaseImages {
    layers: Layers,
    client: Client,
    bases_url: String,
    cache_dir: PathBuf,
}

impl BaseImages {
    /// Create a fetcher storing base layers in `layers`.
    #[must_use]
    pub fn new(layers: Layers, bases_url: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            layers,
            client: Client::new(),
            bases_url: bases_url.into().trim_end_matches('/').to_string(),
            cache_dir: cache_dir.into(),
        }
    }

    /// The layers bases are stored in.
    #[must_use]
    pub fn layers(&self) -> &Layers {
        &self.layers
    }

    /// URL a base is downloaded from.
    #[must_use]
    pub fn url(&self, name: &str) -> String {
        format!("{}/{name}.tar", self.bases_url)
    }

    /// Cached archive location.
    #[must_use]
    pub fn archive_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(format!("{name}.tar"))
    }

    /// Return base layer `name`, building it if necessary.
    ///
    /// A missing archive is downloaded. When `digest` is given, both a cached
    /// and a freshly downloaded archive are checked against it, and a cached
    /// archive that does not match is fetched again. The layer is destroyed
    /// again if anything fails after it was created.
    ///
    /// # Errors
    ///
    /// Returns `Fetch` or `DigestMismatch` for download problems, or any
    /// layer or extraction error.
    pub async fn ensure(&self, name: &str, digest: Option<&Digest>) -> ForgeResult<Layer> {
        let base = name.to_string();
        let present = self
            .layers
            .unblock(move |layers| Ok(layers.has(&base).then(|| layers.get(&base))))
            .await?;
        if let Some(layer) = present {
            tracing::debug!(base = %name, "Base already present");
            return layer;
        }

        let archive = self.archive_path(name);
        self.fetch_archive(name, &archive, digest).await?;

        let base = name.to_string();
        let layer = self
            .layers
            .unblock(move |layers| {
                layers.ensure_root()?;
                layers.create(&base, None)
            })
            .await?;

        if let Err(err) = self.populate(&layer, &archive).await {
            let incomplete = layer.clone();
            let removed = self
                .layers
                .unblock(move |_| incomplete.destroy())
                .await;
            if let Err(cleanup) = removed {
                tracing::warn!(base = %name, error = %cleanup, "Could not remove incomplete base");
            }
            return Err(err);
        }

        tracing::info!(base = %name, "Base ready");
        Ok(layer)
    }

    async fn fetch_archive(&self, name: &str, archive: &Path, digest: Option<&Digest>) -> ForgeResult<()> {
        if !archive.is_file() {
            return self.download(name, archive, digest).await;
        }

        if let Some(expected) = digest {
            let actual = hash_file(archive).await?;
            match expected.check(&actual) {
                Ok(()) => {}
                Err(ForgeError::DigestMismatch { .. }) => {
                    tracing::warn!(
                        base = %name,
                        expected = %expected,
                        actual = %actual,
                        "Cached base does not match, fetching again"
                    );
                    tokio::fs::remove_file(archive).await?;
                    return self.download(name, archive, digest).await;
                }
                Err(err) => return Err(err),
            }
        }

        tracing::info!(base = %name, archive = %archive.display(), "Using cached base");
        Ok(())
    }

    async fn populate(&self, layer: &Layer, archive: &Path) -> ForgeResult<()> {
        tracing::info!(base = %layer.name, "Extracting base");

        let source = archive.to_path_buf();
        let dest = layer.path.clone();
        tokio::task::spawn_blocking(move || archive::unpack(&source, &dest))
            .await
            .map_err(|e| ForgeError::Internal {
                message: format!("extract task failed: {e}"),
            })??;

        // The creation snapshot is empty; re-stamp it over the extracted tree.
        let dataset = layer.dataset.clone();
        self.layers
            .zfs()
            .unblock(move |adapter| {
                let first = zfs::snapshot_name(&dataset, zfs::FIRST);
                if !adapter.destroy(&first) {
                    return Err(ForgeError::DestroyFailed { name: first });
                }
                adapter.snapshot(&dataset, zfs::FIRST)
            })
            .await?
    }

    async fn download(&self, name: &str, archive: &Path, digest: Option<&Digest>) -> ForgeResult<()> {
        let url = self.url(name);
        tracing::info!(base = %name, url = %url, "Fetching base");

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let partial = archive.with_extension("tar.part");

        let actual = match url.strip_prefix("file://") {
            Some(path) => copy_local(Path::new(path), &partial).await,
            None => self.fetch(&url, &partial).await,
        };
        let actual = match actual {
            Ok(actual) => actual,
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err);
            }
        };

        if let Some(expected) = digest {
            if let Err(err) = expected.check(&actual) {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err);
            }
        }

        tokio::fs::rename(&partial, archive).await?;
        tracing::info!(base = %name, digest = %actual, "Base fetched");
        Ok(())
    }

    async fn fetch(&self, url: &str, dest: &Path) -> ForgeResult<Digest> {
        let fetch_error = |message: String| ForgeError::Fetch {
            url: url.to_string(),
            message,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_error(format!("HTTP {}", response.status())));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| fetch_error(e.to_string()))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(Digest::new("sha256", hex::encode(hasher.finalize())))
    }
}

async fn hash_file(path: &Path) -> ForgeResult<Digest> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(Digest::new("sha256", hex::encode(hasher.finalize())))
}

async fn copy_local(source: &Path, dest: &Path) -> ForgeResult<Digest> {
    let data = tokio::fs::read(source).await.map_err(|e| ForgeError::Fetch {
        url: format!("file://{}", source.display()),
        message: e.to_string(),
    })?;
    tokio::fs::write(dest, &data).await?;
    Ok(Digest::sha256_of(&data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zfs::Zfs;
    use jailforge_common::FakeExecutor;

    fn images(url: &str, cache: &Path) -> BaseImages {
        let zfs = Zfs::new(FakeExecutor::new().as_executor());
        BaseImages::new(Layers::new(zfs, "zroot/jf/images"), url, cache)
    }

    #[test]
    fn urls_and_cache_paths() {
        let images = images("https://example.org/releases/", Path::new("/var/cache/jf"));
        assert_eq!(images.url("14.1-RELEASE"), "https://example.org/releases/14.1-RELEASE.tar");
        assert_eq!(
            images.archive_path("14.1-RELEASE"),
            PathBuf::from("/var/cache/jf/14.1-RELEASE.tar")
        );
    }

    #[tokio::test]
    async fn local_download_checks_digest() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("mirror");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("base.tar"), b"not really a tarball").unwrap();

        let images = images(&format!("file://{}", source.display()), &temp.path().join("cache"));
        let archive = images.archive_path("base");

        let wrong = Digest::sha256_of(b"something else");
        let err = images.download("base", &archive, Some(&wrong)).await.unwrap_err();
        assert!(matches!(err, ForgeError::DigestMismatch { .. }));
        assert!(!archive.exists());

        let right = Digest::sha256_of(b"not really a tarball");
        images.download("base", &archive, Some(&right)).await.unwrap();
        assert_eq!(std::fs::read(&archive).unwrap(), b"not really a tarball");
    }

    #[tokio::test]
    async fn tampered_cache_is_fetched_again() {
        let temp = tempfile::tempdir().unwrap();
        let mirror = temp.path().join("mirror");
        std::fs::create_dir_all(&mirror).unwrap();
        std::fs::write(mirror.join("14.1-RELEASE.tar"), b"the real release tarball").unwrap();

        let images = images(&format!("file://{}", mirror.display()), &temp.path().join("cache"));
        let archive = images.archive_path("14.1-RELEASE");
        std::fs::create_dir_all(archive.parent().unwrap()).unwrap();
        std::fs::write(&archive, b"evil").unwrap();

        let digest = Digest::sha256_of(b"the real release tarball");
        images
            .fetch_archive("14.1-RELEASE", &archive, Some(&digest))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&archive).unwrap(), b"the real release tarball");

        // A matching cache is used as is.
        std::fs::remove_file(mirror.join("14.1-RELEASE.tar")).unwrap();
        images
            .fetch_archive("14.1-RELEASE", &archive, Some(&digest))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tampered_cache_never_reaches_a_layer() {
        let temp = tempfile::tempdir().unwrap();
        let fake = FakeExecutor::new();
        fake.set_handler(Box::new(|_| FakeExecutor::failure(1, "dataset does not exist")));
        let images = BaseImages::new(
            Layers::new(Zfs::new(fake.clone().as_executor()), "zroot/jf/images"),
            "file:///nonexistent/mirror",
            temp.path(),
        );
        std::fs::write(images.archive_path("14.1-RELEASE"), b"evil").unwrap();

        let digest = Digest::sha256_of(b"the real release tarball");
        let err = images.ensure("14.1-RELEASE", Some(&digest)).await.unwrap_err();
        assert!(matches!(err, ForgeError::Fetch { .. }));
        assert!(!images.archive_path("14.1-RELEASE").exists());
        assert!(
            fake.command_strings()
                .iter()
                .all(|c| !c.starts_with("zfs create") && !c.starts_with("zfs clone"))
        );
    }

    #[tokio::test]
    async fn missing_local_source_is_a_fetch_error() {
        let temp = tempfile::tempdir().unwrap();
        let images = images("file:///nonexistent/mirror", temp.path());
        let err = images
            .download("base", &images.archive_path("base"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Fetch { .. }));
    }
}
