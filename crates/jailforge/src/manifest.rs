//! Provisioning manifest.
//!
//! A manifest is a YAML document describing one jail:
//!
//! ```yaml
//! name: web
//! base: 14.1-RELEASE
//! base-digest: sha256:9f0e...
//! workdir: /srv/app
//! mounts:
//!   - src: /usr/ports
//!     dst: /usr/ports
//!     read-only: true
//! volumes:
//!   - data
//!   - name: logs
//!     path: /var/log
//! rctl:
//!   memoryuse: deny=512M
//! pkg: [nginx]
//! cpus: 2
//! j-poststart:
//!   - service nginx start
//! params:
//!   ip4.addr: 10.0.0.2
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use jailforge_common::paths::escapes;
use jailforge_common::{Digest, ForgeError, ForgeResult, JailName};

use crate::jail::ParamValue;

/// A host directory mounted into the jail with nullfs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "MountForm", rename_all = "kebab-case")]
pub struct MountSpec {
    /// Host directory.
    pub src: PathBuf,
    /// Path inside the jail.
    pub dst: PathBuf,
    /// Mount read-only.
    pub read_only: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MountForm {
    Pair(PathBuf, PathBuf),
    Full {
        src: PathBuf,
        dst: PathBuf,
        #[serde(default, rename = "read-only")]
        read_only: bool,
    },
}

impl From<MountForm> for MountSpec {
    fn from(form: MountForm) -> Self {
        match form {
            MountForm::Pair(src, dst) => Self {
                src,
                dst,
                read_only: false,
            },
            MountForm::Full { src, dst, read_only } => Self { src, dst, read_only },
        }
    }
}

/// A named volume mounted into the jail.
///
/// Written either as a bare path or as `{name, path}`; without a name the
/// volume is named after the jail and path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "VolumeForm")]
pub struct VolumeSpec {
    /// Volume name.
    pub name: Option<String>,
    /// Path inside the jail, relative paths resolve against `workdir`.
    pub path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VolumeForm {
    Path(PathBuf),
    Named {
        #[serde(default)]
        name: Option<String>,
        path: PathBuf,
    },
}

impl From<VolumeForm> for VolumeSpec {
    fn from(form: VolumeForm) -> Self {
        match form {
            VolumeForm::Path(path) => Self { name: None, path },
            VolumeForm::Named { name, path } => Self { name, path },
        }
    }
}

/// Everything needed to provision one jail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Manifest {
    /// Jail name.
    pub name: JailName,
    /// Base image name, fetched as `<bases_url>/<base>.tar`.
    pub base: String,
    /// Expected digest of the base archive.
    #[serde(default)]
    pub base_digest: Option<String>,
    /// Directory relative volume paths resolve against.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
    /// Host directories to mount.
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    /// Named volumes.
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    /// Resource limits, `resource: action=amount`.
    #[serde(default)]
    pub rctl: BTreeMap<String, String>,
    /// Packages to install.
    #[serde(default)]
    pub pkg: Vec<String>,
    /// Packages to install by regular expression.
    #[serde(default)]
    pub pkg_regex: Vec<String>,
    /// Number of CPUs, starting at CPU 0.
    #[serde(default)]
    pub cpus: Option<usize>,
    /// Explicit `cpuset -l` list, used when `cpus` is absent.
    #[serde(default)]
    pub cpuset: Option<String>,
    /// Commands run inside the jail once it is up.
    #[serde(default)]
    pub j_poststart: Vec<String>,
    /// Commands run on the host once the jail is up.
    #[serde(default)]
    pub h_poststart: Vec<String>,
    /// Extra `jail.conf` parameters.
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

fn default_workdir() -> PathBuf {
    PathBuf::from("/")
}

impl Manifest {
    /// Parse and validate a YAML manifest.
    ///
    /// # Errors
    ///
    /// Returns `Manifest` if the document is malformed or fails validation.
    pub fn from_yaml(text: &str) -> ForgeResult<Self> {
        let manifest: Self = serde_yaml::from_str(text).map_err(|e| ForgeError::Manifest {
            message: e.to_string(),
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read a manifest file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read, `Manifest` if it is invalid.
    pub fn from_file(path: &Path) -> ForgeResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text).map_err(|err| match err {
            ForgeError::Manifest { message } => ForgeError::Manifest {
                message: format!("{}: {message}", path.display()),
            },
            other => other,
        })
    }

    /// Check field values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns `Manifest` describing the first problem found.
    pub fn validate(&self) -> ForgeResult<()> {
        let invalid = |message: String| Err(ForgeError::Manifest { message });

        if self.base.is_empty() || self.base.contains('/') || self.base.starts_with('.') {
            return invalid(format!("invalid base: {:?}", self.base));
        }
        if self.workdir.is_relative() {
            return invalid(format!("workdir must be absolute: {}", self.workdir.display()));
        }
        if let Some(digest) = &self.base_digest {
            digest.parse::<Digest>().map_err(|_| ForgeError::Manifest {
                message: format!("invalid base-digest: {digest}"),
            })?;
        }
        for mount in &self.mounts {
            if !mount.src.is_absolute() || !mount.dst.is_absolute() {
                return invalid(format!(
                    "mount paths must be absolute: {} -> {}",
                    mount.src.display(),
                    mount.dst.display()
                ));
            }
            if escapes(&mount.dst) {
                return invalid(format!("mount leaves the jail: {}", mount.dst.display()));
            }
        }
        for volume in &self.volumes {
            if escapes(&volume.path) {
                return invalid(format!("volume leaves the jail: {}", volume.path.display()));
            }
            if let Some(name) = &volume.name {
                if name.is_empty() || name.contains(['/', '@']) {
                    return invalid(format!("invalid volume name: {name:?}"));
                }
            }
        }
        for (resource, rule) in &self.rctl {
            if resource.is_empty() || !rule.contains('=') {
                return invalid(format!("rctl rule must be `action=amount`: {resource}: {rule}"));
            }
        }
        if self.cpus == Some(0) {
            return invalid("cpus must be at least 1".to_string());
        }
        Ok(())
    }

    /// Parsed base digest.
    #[must_use]
    pub fn digest(&self) -> Option<Digest> {
        self.base_digest.as_deref().and_then(|d| d.parse().ok())
    }
}
