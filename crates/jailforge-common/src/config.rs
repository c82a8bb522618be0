//! Configuration file handling.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, ForgeResult};
use crate::paths::ForgePaths;

/// System-wide configuration file.
pub const SYSTEM_CONFIG: &str = "/usr/local/etc/jailforge.toml";

/// Jailforge configuration.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ForgeConfig {
    /// ZFS pool holding all datasets.
    pub pool: String,
    /// Dataset prefix under the pool.
    pub prefix: String,
    /// Base URL base images are fetched from (`<url>/<base>.tar`).
    pub bases_url: String,
    /// Data directory override.
    pub root: Option<PathBuf>,
    /// Runtime directory override.
    pub runtime_dir: Option<PathBuf>,
    /// Hosts file updated with jail addresses.
    pub hosts_file: PathBuf,
    /// Copy the host `/etc/resolv.conf` into each jail.
    pub resolv_sync: bool,
    /// Timeout for jail, package and hook commands, in seconds. 0 disables.
    pub command_timeout: u64,
    /// zstd level for exported layers.
    pub archive_level: i32,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            pool: "zroot".to_string(),
            prefix: "jailforge".to_string(),
            bases_url: "https://download.freebsd.org/ftp/releases/amd64".to_string(),
            root: None,
            runtime_dir: None,
            hosts_file: PathBuf::from("/etc/hosts"),
            resolv_sync: true,
            command_timeout: 600,
            archive_level: 3,
        }
    }
}

impl ForgeConfig {
    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> ForgeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|e| ForgeError::Config {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Parse configuration text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for this schema.
    pub fn parse(content: &str) -> ForgeResult<Self> {
        toml::from_str(content).map_err(|e| ForgeError::Config {
            message: e.to_string(),
        })
    }

    /// Load the first configuration file found, or the defaults.
    ///
    /// Looks at [`SYSTEM_CONFIG`], then `<user config dir>/jailforge/config.toml`.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be parsed.
    pub fn discover() -> ForgeResult<Self> {
        let user = dirs::config_dir().map(|dir| dir.join("jailforge").join("config.toml"));
        let candidates = std::iter::once(PathBuf::from(SYSTEM_CONFIG)).chain(user);

        for path in candidates {
            if path.is_file() {
                tracing::debug!(path = %path.display(), "Loading configuration");
                return Self::load(&path);
            }
        }

        Ok(Self::default())
    }

    /// Override the pool.
    #[must_use]
    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    /// Override the data directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Dataset everything else lives under.
    #[must_use]
    pub fn base_dataset(&self) -> String {
        if self.prefix.is_empty() {
            self.pool.clone()
        } else {
            format!("{}/{}", self.pool, self.prefix)
        }
    }

    /// Parent dataset of image layers.
    #[must_use]
    pub fn images_dataset(&self) -> String {
        format!("{}/images", self.base_dataset())
    }

    /// Parent dataset of named volumes.
    #[must_use]
    pub fn volumes_dataset(&self) -> String {
        format!("{}/volumes", self.base_dataset())
    }

    /// Parent dataset of per-jail root layers.
    #[must_use]
    pub fn containers_dataset(&self) -> String {
        format!("{}/containers", self.base_dataset())
    }

    /// Filesystem paths derived from this configuration.
    #[must_use]
    pub fn paths(&self) -> ForgePaths {
        let mut paths = self
            .root
            .as_ref()
            .map_or_else(ForgePaths::new, |root| ForgePaths::with_root(root));
        if let Some(runtime) = &self.runtime_dir {
            paths.runtime.clone_from(runtime);
        }
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        let config = ForgeConfig::parse("").unwrap();
        assert_eq!(config, ForgeConfig::default());
        assert_eq!(config.images_dataset(), "zroot/jailforge/images");
        assert_eq!(config.volumes_dataset(), "zroot/jailforge/volumes");
        assert_eq!(config.containers_dataset(), "zroot/jailforge/containers");
    }

    #[test]
    fn parse_overrides() {
        let config = ForgeConfig::parse(
            r#"
pool = "tank"
prefix = ""
hosts-file = "/tmp/hosts"
command-timeout = 0
resolv-sync = false
root = "/srv/jf"
"#,
        )
        .unwrap();

        assert_eq!(config.pool, "tank");
        assert_eq!(config.images_dataset(), "tank/images");
        assert_eq!(config.hosts_file, PathBuf::from("/tmp/hosts"));
        assert_eq!(config.command_timeout, 0);
        assert!(!config.resolv_sync);
        assert_eq!(config.paths().cache(), PathBuf::from("/srv/jf/cache"));
    }

    #[test]
    fn unknown_types_are_rejected() {
        let err = ForgeConfig::parse("command-timeout = \"soon\"").unwrap_err();
        assert!(matches!(err, ForgeError::Config { .. }));
    }

    #[test]
    fn load_from_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("jailforge.toml");
        std::fs::write(&path, "pool = \"data\"\n").unwrap();

        let config = ForgeConfig::load(&path).unwrap().with_root(temp.path());
        assert_eq!(config.pool, "data");
        assert_eq!(config.paths().root, temp.path());
    }
}
