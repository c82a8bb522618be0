//! Common error types for Jailforge.

use std::borrow::Borrow;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`ForgeError`].
pub type ForgeResult<T> = Result<T, ForgeError>;

/// Common errors across Jailforge.
#[derive(Error, Diagnostic, Debug)]
pub enum ForgeError {
    /// The dataset or snapshot already exists.
    #[error("Already exists: {target}")]
    #[diagnostic(code(jailforge::zfs::already_exists))]
    AlreadyExists {
        /// Dataset or snapshot name.
        target: String,
    },

    /// The volume manager rejected the command line.
    #[error("Invalid command line options were specified: {command}")]
    #[diagnostic(
        code(jailforge::zfs::invalid_arguments),
        help("This is a caller error, check dataset and property names")
    )]
    InvalidArguments {
        /// The rejected command line.
        command: String,
    },

    /// An external command exited with a fatal status.
    #[error("Command failed ({code}): {command}: {stderr}", code = display_status(.status))]
    #[diagnostic(code(jailforge::command_failed))]
    CommandFailed {
        /// The command line that failed.
        command: String,
        /// Exit status, `None` when killed by a signal.
        status: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The configured pool does not exist.
    #[error("Pool \"{pool}\" not found. Available pools: {available}")]
    #[diagnostic(
        code(jailforge::zfs::pool_not_found),
        help("Set `pool` in the configuration file or pass --pool")
    )]
    PoolNotFound {
        /// The requested pool.
        pool: String,
        /// Comma separated list of pools that do exist.
        available: String,
    },

    /// The directory diff probe failed.
    #[error("Diff failed ({code}): {stderr}", code = display_status(.status))]
    #[diagnostic(code(jailforge::diff_failed))]
    DiffFailed {
        /// Exit status of the probe.
        status: Option<i32>,
        /// Captured diagnostic text.
        stderr: String,
    },

    /// The jail could not be created.
    #[error("Error execution jail {name} ({code}): {stderr}", code = display_status(.status))]
    #[diagnostic(code(jailforge::jail::start_failed))]
    JailStartFailed {
        /// Jail name.
        name: String,
        /// Exit status of `jail -c`.
        status: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// A snapshot could not be cloned.
    #[error("Could not clone {snapshot} into {target}")]
    #[diagnostic(code(jailforge::zfs::clone_failed))]
    CloneFailed {
        /// Source snapshot.
        snapshot: String,
        /// Target dataset.
        target: String,
    },

    /// A dataset could not be destroyed.
    #[error("Could not destroy dataset {name}")]
    #[diagnostic(
        code(jailforge::zfs::destroy_failed),
        help("The dataset may be busy, check for mounted clones or running jails")
    )]
    DestroyFailed {
        /// Dataset name.
        name: String,
    },

    /// A dataset that was expected to exist does not.
    #[error("Dataset not found: {name}")]
    #[diagnostic(code(jailforge::zfs::not_found))]
    DatasetNotFound {
        /// Dataset name.
        name: String,
    },

    /// No active jail has this name.
    #[error("Jail not found: {name}")]
    #[diagnostic(code(jailforge::jail::not_found))]
    JailNotFound {
        /// Jail name.
        name: String,
    },

    /// Invalid jail or layer name.
    #[error("Invalid name: {name}")]
    #[diagnostic(
        code(jailforge::invalid_name),
        help("Names must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// An external command did not finish in time.
    #[error("Command timed out after {seconds}s: {command}")]
    #[diagnostic(
        code(jailforge::timeout),
        help("Raise `command_timeout` in the configuration file, 0 disables it")
    )]
    Timeout {
        /// The command line.
        command: String,
        /// Configured timeout.
        seconds: u64,
    },

    /// Base image download failed.
    #[error("Error fetching {url}: {message}")]
    #[diagnostic(code(jailforge::fetch))]
    Fetch {
        /// Requested URL.
        url: String,
        /// Failure description.
        message: String,
    },

    /// Downloaded content does not match the expected digest.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    #[diagnostic(code(jailforge::digest_mismatch))]
    DigestMismatch {
        /// Expected digest.
        expected: String,
        /// Computed digest.
        actual: String,
    },

    /// Invalid provisioning manifest.
    #[error("Manifest error: {message}")]
    #[diagnostic(code(jailforge::manifest))]
    Manifest {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(jailforge::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(jailforge::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(jailforge::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(jailforge::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl ForgeError {
    /// Whether this is the recoverable "already exists" condition.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

fn display_status(status: impl Borrow<Option<i32>>) -> String {
    status
        .borrow()
        .map_or_else(|| "signal".to_string(), |code| format!("exit {code}"))
}
