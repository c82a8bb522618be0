//! # jailforge-common
//!
//! Shared utilities and types for the Jailforge provisioning tools.
//!
//! This crate provides common functionality used across all Jailforge crates:
//! - The error taxonomy shared by storage and runtime code
//! - The command executor seam every external tool call goes through
//! - Configuration loading and standard filesystem paths
//! - Jail name validation and content digests

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod exec;
pub mod id;
pub mod paths;

pub use config::ForgeConfig;
pub use error::{ForgeError, ForgeResult};
pub use exec::{BoxedExecutor, CommandLine, ExitOutcome, Executor, FakeExecutor, HostExecutor};
pub use id::{Digest, JailName};
pub use paths::ForgePaths;
