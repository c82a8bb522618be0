//! Concrete provisioning steps.
//!
//! Each step implements [`Step`](crate::recorder::Step) and is run through a
//! [`Recorder`](crate::recorder::Recorder), which undoes the steps that
//! already ran when a later one fails.

mod cpuset;
mod hook;
mod hosts;
mod materialize;
mod mount;
mod pkg;
mod rctl;
mod register;

pub use cpuset::{CpusetStep, cpu_list};
pub use hook::{HookStep, HookTarget};
pub use hosts::HostsStep;
pub use materialize::MaterializeStep;
pub use mount::{MountStep, volume_name};
pub use pkg::PackageInstallStep;
pub use rctl::ResourceLimitStep;
pub use register::RegisterStep;

use std::path::{Component, Path, PathBuf};

/// Map an absolute in-jail path to the host path below `root`.
///
/// `..` components are resolved lexically and never climb above `root`.
#[must_use]
pub fn jail_path(root: &Path, path: &Path) -> PathBuf {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    parts.iter().fold(root.to_path_buf(), |acc, part| acc.join(part))
}
