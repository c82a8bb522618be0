//! Standard filesystem paths for Jailforge.

use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;

/// Default root directory for Jailforge data.
pub static JAILFORGE_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("JAILFORGE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/db/jailforge"))
});

/// Default runtime directory for Jailforge.
pub static JAILFORGE_RUNTIME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("JAILFORGE_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/run/jailforge"))
});

/// Standard paths used by Jailforge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgePaths {
    /// Root data directory (default: /var/db/jailforge).
    pub root: PathBuf,
    /// Runtime directory (default: /var/run/jailforge).
    pub runtime: PathBuf,
}

impl ForgePaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runtime = root.join("run");
        Self { root, runtime }
    }

    /// Download cache for base images.
    #[must_use]
    pub fn cache(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Cached base image archive.
    #[must_use]
    pub fn base_archive(&self, base: &str) -> PathBuf {
        self.cache().join(format!("{base}.tar"))
    }

    /// Directory for exported layer archives.
    #[must_use]
    pub fn archives(&self) -> PathBuf {
        self.root.join("archives")
    }

    /// Scratch `jail.conf` for a running jail.
    #[must_use]
    pub fn jail_conf(&self, name: &str) -> PathBuf {
        self.runtime.join(format!("{name}-jail.conf"))
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.runtime)?;
        std::fs::create_dir_all(self.cache())?;
        std::fs::create_dir_all(self.archives())?;
        Ok(())
    }
}

/// Whether a path climbs above its root with `..`.
///
/// Components are resolved lexically, so `usr/../var` stays inside while
/// `usr/../../etc` does not. A leading `/` is not treated as an escape.
#[must_use]
pub fn escapes(path: &Path) -> bool {
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if depth == 0 {
                    return true;
                }
                depth -= 1;
            }
            Component::Normal(_) => depth += 1,
            _ => {}
        }
    }
    false
}

impl Default for ForgePaths {
    fn default() -> Self {
        Self {
            root: JAILFORGE_ROOT.clone(),
            runtime: JAILFORGE_RUNTIME_DIR.clone(),
        }
    }
}
