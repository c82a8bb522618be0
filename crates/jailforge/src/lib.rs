//! # Jailforge
//!
//! Transactional provisioning of FreeBSD jails on layered ZFS storage.
//!
//! A provisioning run is a sequence of [`Step`](recorder::Step)s executed by a
//! [`Recorder`](recorder::Recorder). When any step fails, every step that
//! already succeeded is compensated in reverse order, so a failed run leaves
//! no datasets, mounts, resource limits or running jails behind.
//!
//! ## Usage
//!
//! ```no_run
//! use jailforge::manifest::Manifest;
//! use jailforge::provision::Provisioner;
//! use jailforge::registry::JailRegistry;
//! use jailforge_common::{ForgeConfig, HostExecutor};
//!
//! # async fn example() -> jailforge_common::ForgeResult<()> {
//! let manifest = Manifest::from_yaml("name: web\nbase: 14.1-RELEASE\n")?;
//! let provisioner = Provisioner::new(
//!     ForgeConfig::default(),
//!     HostExecutor::new().as_executor(),
//!     JailRegistry::new(),
//! );
//!
//! let jail = provisioner.provision(&manifest).await?;
//! println!("{} running as jid {:?}", jail.name(), jail.info().map(|i| i.jid));
//!
//! provisioner.stop(jail.name()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod jail;
pub mod manifest;
pub mod provision;
pub mod recorder;
pub mod registry;
pub mod runner;
pub mod steps;

pub use jail::Jail;
pub use provision::Provisioner;
pub use recorder::{Recorder, Step};
