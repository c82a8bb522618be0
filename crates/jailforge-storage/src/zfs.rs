//! Utilities for poking at ZFS.
//!
//! Every method runs exactly one `zfs` or `zpool` command and maps its exit
//! status. Existence is never cached: ask [`Zfs::has`] each time.
//!
//! The methods block until the command exits. Async code calls them through
//! [`Zfs::unblock`].

use std::process::{Command, Output};

use jailforge_common::exec::{CommandLine, ExitOutcome, stderr_of, stdout_of};
use jailforge_common::{BoxedExecutor, ForgeError, ForgeResult};

/// The `zfs` binary.
pub const ZFS: &str = "zfs";
/// The `zpool` binary.
pub const ZPOOL: &str = "zpool";

/// Snapshot taken when a layer is created.
pub const FIRST: &str = "first";
/// Snapshot taken before a layer is diffed or cloned from.
pub const LAST: &str = "last";
/// Snapshot a layer chain clones the next layer from.
pub const SYNC: &str = "jmaker";

/// `<dataset>@<label>`.
#[must_use]
pub fn snapshot_name(dataset: &str, label: &str) -> String {
    format!("{dataset}@{label}")
}

/// Treat [`ForgeError::AlreadyExists`] as success.
///
/// Used when re-synchronizing a checkpoint that may already be there.
///
/// # Errors
///
/// Returns any other error unchanged.
pub fn ignore_exists(result: ForgeResult<()>) -> ForgeResult<()> {
    match result {
        Err(err) if err.is_already_exists() => Ok(()),
        other => other,
    }
}

/// Options for [`Zfs::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOptions {
    /// Only names equal to, or nested under, this prefix.
    pub prefix: String,
    /// Ascending sort properties (`-s`).
    pub sort_asc: Vec<String>,
    /// Descending sort properties (`-S`).
    pub sort_desc: Vec<String>,
    /// Dataset types (`-t`).
    pub types: Vec<String>,
    /// Columns to print (`-o`).
    pub columns: Vec<String>,
    /// Print exact numbers (`-p`).
    pub parsable: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            sort_asc: Vec::new(),
            sort_desc: Vec::new(),
            types: vec!["filesystem".to_string()],
            columns: vec!["name".to_string()],
            parsable: true,
        }
    }
}

impl ListOptions {
    /// Filter by name prefix.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sort ascending by `property`.
    #[must_use]
    pub fn sort_asc(mut self, property: impl Into<String>) -> Self {
        self.sort_asc.push(property.into());
        self
    }

    /// Sort descending by `property`.
    #[must_use]
    pub fn sort_desc(mut self, property: impl Into<String>) -> Self {
        self.sort_desc.push(property.into());
        self
    }

    /// Replace the dataset types.
    #[must_use]
    pub fn types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the printed columns.
    #[must_use]
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec!["list".to_string(), "-H".to_string()];
        if self.parsable {
            args.push("-p".to_string());
        }
        for property in &self.sort_asc {
            args.extend(["-s".to_string(), property.clone()]);
        }
        for property in &self.sort_desc {
            args.extend(["-S".to_string(), property.clone()]);
        }
        if !self.types.is_empty() {
            args.extend(["-t".to_string(), self.types.join(",")]);
        }
        if !self.columns.is_empty() {
            args.extend(["-o".to_string(), self.columns.join(",")]);
        }
        args
    }

    fn matches(&self, name: &str) -> bool {
        let prefix = self.prefix.trim_end_matches('/');
        prefix.is_empty()
            || name == prefix
            || name
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('@'))
    }
}

/// One row of `zfs list` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListRow {
    /// A single selected column.
    Single(String),
    /// Several columns, in the requested order.
    Columns(Vec<String>),
}

impl ListRow {
    /// The first column, normally the dataset name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Single(name) => name,
            Self::Columns(columns) => columns.first().map_or("", String::as_str),
        }
    }
}

/// Wraps commands for interacting with ZFS.
#[derive(Clone)]
pub struct Zfs {
    executor: BoxedExecutor,
}

impl std::fmt::Debug for Zfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zfs").finish_non_exhaustive()
    }
}

impl Zfs {
    /// Create an adapter running commands through `executor`.
    #[must_use]
    pub fn new(executor: BoxedExecutor) -> Self {
        Self { executor }
    }

    /// The executor commands run through.
    #[must_use]
    pub fn executor(&self) -> &BoxedExecutor {
        &self.executor
    }

    /// Run `f` against this adapter on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::Internal`] if the task panics.
    pub async fn unblock<T, F>(&self, f: F) -> ForgeResult<T>
    where
        F: FnOnce(&Zfs) -> T + Send + 'static,
        T: Send + 'static,
    {
        let zfs = self.clone();
        tokio::task::spawn_blocking(move || f(&zfs))
            .await
            .map_err(|e| ForgeError::Internal {
                message: format!("zfs task failed: {e}"),
            })
    }

    fn run<I, S>(&self, program: &str, args: I) -> ForgeResult<(CommandLine, Output)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = Command::new(program);
        command.args(args);
        let line = CommandLine::from(&command);
        let output = self.executor.execute(&mut command)?;
        Ok((line, output))
    }

    /// Names of all imported pools.
    ///
    /// # Errors
    ///
    /// Returns an error if `zpool list` cannot be run or fails.
    pub fn pools(&self) -> ForgeResult<Vec<String>> {
        let (line, output) = self.run(ZPOOL, ["list", "-o", "name", "-H"])?;
        if !output.status.success() {
            return Err(command_failed(&line, &output));
        }
        Ok(stdout_of(&output)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Make sure `pool` is imported.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::PoolNotFound`] listing the pools that exist.
    pub fn check_pool(&self, pool: &str) -> ForgeResult<()> {
        let pools = self.pools()?;
        if pools.iter().any(|p| p == pool) {
            Ok(())
        } else {
            Err(ForgeError::PoolNotFound {
                pool: pool.to_string(),
                available: pools.join(", "),
            })
        }
    }

    /// Create a dataset, including missing parents.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` on status 1 and `InvalidArguments` on status 2.
    pub fn create(&self, name: &str, options: &[(&str, &str)]) -> ForgeResult<()> {
        let mut args = vec!["create".to_string(), "-p".to_string()];
        args.extend(option_args(options));
        args.push(name.to_string());

        let (line, output) = self.run(ZFS, &args)?;
        exists_or_invalid(&line, &output, name)?;
        tracing::debug!(dataset = %name, "Dataset created");
        Ok(())
    }

    /// Recursively and forcibly destroy a dataset or snapshot.
    ///
    /// Never fails; returns whether the command succeeded.
    pub fn destroy(&self, name: &str) -> bool {
        match self.run(ZFS, ["destroy", "-R", "-f", name]) {
            Ok((_, output)) if output.status.success() => {
                tracing::debug!(dataset = %name, "Dataset destroyed");
                true
            }
            Ok((_, output)) => {
                tracing::debug!(dataset = %name, stderr = %stderr_of(&output), "Destroy failed");
                false
            }
            Err(err) => {
                tracing::debug!(dataset = %name, error = %err, "Destroy failed");
                false
            }
        }
    }

    /// Take the snapshot `<dataset>@<label>`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` on status 1 and `InvalidArguments` on status 2.
    pub fn snapshot(&self, dataset: &str, label: &str) -> ForgeResult<()> {
        let snapshot = snapshot_name(dataset, label);
        let (line, output) = self.run(ZFS, ["snapshot", snapshot.as_str()])?;
        exists_or_invalid(&line, &output, &snapshot)
    }

    /// Roll `dataset` back to `<dataset>@<label>`, destroying later state.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` carrying the exit status on any failure.
    pub fn rollback(&self, dataset: &str, label: &str) -> ForgeResult<()> {
        let snapshot = snapshot_name(dataset, label);
        let (line, output) = self.run(ZFS, ["rollback", "-Rf", snapshot.as_str()])?;
        if output.status.success() {
            Ok(())
        } else {
            Err(command_failed(&line, &output))
        }
    }

    /// Clone `<dataset>@<label>` into `new`.
    ///
    /// Returns whether the clone succeeded rather than failing, so callers can
    /// branch on it.
    pub fn clone_snapshot(
        &self,
        dataset: &str,
        label: &str,
        new: &str,
        options: &[(&str, &str)],
    ) -> bool {
        let mut args = vec!["clone".to_string()];
        args.extend(option_args(options));
        args.push(snapshot_name(dataset, label));
        args.push(new.to_string());

        match self.run(ZFS, &args) {
            Ok((_, output)) if output.status.success() => true,
            Ok((line, output)) => {
                tracing::warn!(command = %line, stderr = %stderr_of(&output), "Clone failed");
                false
            }
            Err(err) => {
                tracing::warn!(dataset = %new, error = %err, "Clone failed");
                false
            }
        }
    }

    /// Promote a clone so it no longer depends on its origin.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` on status 1 and `InvalidArguments` on status 2.
    pub fn promote(&self, clone: &str) -> ForgeResult<()> {
        let (line, output) = self.run(ZFS, ["promote", clone])?;
        exists_or_invalid(&line, &output, clone)
    }

    /// Read a property value.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` if the dataset or property does not exist.
    pub fn get(&self, name: &str, property: &str) -> ForgeResult<String> {
        let (line, output) = self.run(ZFS, ["get", "-o", "value", "-H", property, name])?;
        if output.status.success() {
            Ok(stdout_of(&output))
        } else {
            Err(command_failed(&line, &output))
        }
    }

    /// Write a property value, returning whether it succeeded.
    pub fn set(&self, name: &str, property: &str, value: &str) -> bool {
        let assignment = format!("{property}={value}");
        self.run(ZFS, ["set", assignment.as_str(), name])
            .is_ok_and(|(_, output)| output.status.success())
    }

    /// Whether a dataset or snapshot exists right now.
    pub fn has(&self, name: &str) -> bool {
        self.run(ZFS, ["list", "-o", "name", "-H", name])
            .is_ok_and(|(_, output)| output.status.success())
    }

    /// List datasets.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` if `zfs list` fails.
    pub fn list(&self, options: &ListOptions) -> ForgeResult<Vec<ListRow>> {
        let (line, output) = self.run(ZFS, options.args())?;
        if !output.status.success() {
            return Err(command_failed(&line, &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                let columns: Vec<String> = l.split('\t').map(str::to_string).collect();
                if columns.len() > 1 {
                    ListRow::Columns(columns)
                } else {
                    ListRow::Single(l.to_string())
                }
            })
            .filter(|row| options.matches(row.name()))
            .collect())
    }

    /// Native changed-path report between a snapshot and a dataset.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` on any non-zero exit.
    pub fn diff(&self, snapshot: &str, dataset: &str) -> ForgeResult<String> {
        let (line, output) = self.run(ZFS, ["diff", "-F", snapshot, dataset])?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(command_failed(&line, &output))
        }
    }
}

fn option_args(options: &[(&str, &str)]) -> Vec<String> {
    if options.is_empty() {
        return Vec::new();
    }
    let mut args = vec!["-o".to_string()];
    args.extend(options.iter().map(|(k, v)| format!("{k}={v}")));
    args
}

fn exists_or_invalid(line: &CommandLine, output: &Output, target: &str) -> ForgeResult<()> {
    match ExitOutcome::strict(output.status) {
        ExitOutcome::Success => Ok(()),
        ExitOutcome::Fatal(Some(1)) => Err(ForgeError::AlreadyExists {
            target: target.to_string(),
        }),
        ExitOutcome::Fatal(Some(2)) => Err(ForgeError::InvalidArguments {
            command: line.to_string(),
        }),
        _ => Err(command_failed(line, output)),
    }
}

fn command_failed(line: &CommandLine, output: &Output) -> ForgeError {
    ForgeError::CommandFailed {
        command: line.to_string(),
        status: output.status.code(),
        stderr: stderr_of(output),
    }
}
