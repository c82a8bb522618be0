//! # jailforge-storage
//!
//! Copy-on-write layered storage for Jailforge.
//!
//! This crate provides:
//! - A thin adapter over the `zfs` and `zpool` commands
//! - File-level diffs between two directory trees
//! - Layer export/import as self-describing archives
//! - Named layers and content-addressed layer chains with cache reuse
//! - Base image download and materialization

#![warn(missing_docs)]

pub mod archive;
pub mod base;
pub mod chain;
pub mod diff;
pub mod layer;
pub mod layers;
pub mod zfs;

pub use base::BaseImages;
pub use chain::{LayerChain, LayerKey, LayerStorage};
pub use diff::{DiffAction, DiffRecord, FolderDiff};
pub use layer::Layer;
pub use layers::Layers;
pub use zfs::{ListOptions, ListRow, Zfs};
