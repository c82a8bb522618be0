//! File-level diffs between two directory trees.
//!
//! The diff is computed with a dry-run `rsync --delete`, so nothing is copied.
//! The resulting [`DiffRecord`] has a line-oriented text form (`<code> <path>`)
//! that is stored inside exported layers as the [`DIFF_FILE`] marker.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use jailforge_common::exec::{CommandLine, ExitOutcome, stderr_of};
use jailforge_common::{BoxedExecutor, ForgeError, ForgeResult};

/// Name of the marker file written at the root of an exported layer.
pub const DIFF_FILE: &str = ".diff";

/// The rsync binary.
pub const RSYNC: &str = "rsync";

/// Highest rsync exit status still treated as success.
const TOLERATED_STATUS: i32 = 1;

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiffAction {
    /// New in the target, or a symlink created in the target.
    Added,
    /// Present only in the base.
    Deleted,
    /// Modified in place.
    Changed,
}

impl DiffAction {
    /// Single-character code used in the text form.
    #[must_use]
    pub const fn code(self) -> char {
        match self {
            Self::Added => 'A',
            Self::Deleted => 'D',
            Self::Changed => 'C',
        }
    }

    /// Parse a single-character code.
    #[must_use]
    pub const fn from_code(code: char) -> Option<Self> {
        match code {
            'A' => Some(Self::Added),
            'D' => Some(Self::Deleted),
            'C' => Some(Self::Changed),
            _ => None,
        }
    }
}

impl fmt::Display for DiffAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Mapping from relative path (`./etc/rc.conf`) to what happened to it.
///
/// Each path carries exactly one action. Iteration and the text form are
/// sorted by path, so the same diff always renders the same way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffRecord {
    entries: BTreeMap<String, DiffAction>,
}

impl DiffRecord {
    /// Actions listed by [`DiffRecord::files`] when the caller has no preference.
    pub const DEFAULT_ACTIONS: [DiffAction; 3] =
        [DiffAction::Added, DiffAction::Deleted, DiffAction::Changed];

    /// An empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an action, replacing any earlier one for the same path.
    pub fn insert(&mut self, path: impl Into<String>, action: DiffAction) {
        self.entries.insert(normalize(&path.into()), action);
    }

    /// Action recorded for `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<DiffAction> {
        self.entries.get(&normalize(path)).copied()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, DiffAction)> {
        self.entries.iter().map(|(path, action)| (path.as_str(), *action))
    }

    /// Paths whose action is one of `actions`.
    #[must_use]
    pub fn files(&self, actions: &[DiffAction]) -> Vec<String> {
        self.iter()
            .filter(|(_, action)| actions.contains(action))
            .map(|(path, _)| path.to_string())
            .collect()
    }

    /// Parse an `rsync -nav --delete` report.
    #[must_use]
    pub fn parse_report(report: &str) -> Self {
        let mut record = Self::new();

        for line in report.lines() {
            let line = line.trim_end();
            if is_framing(line) || line.ends_with('/') {
                continue;
            }

            if let Some(path) = line.strip_prefix("deleting ") {
                record.insert(path, DiffAction::Deleted);
            } else if let Some((link, _target)) = line.split_once(" -> ") {
                record.insert(link, DiffAction::Added);
            } else {
                record.insert(line, DiffAction::Added);
            }
        }

        record
    }
}

impl fmt::Display for DiffRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (path, action)) in self.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{action} {path}")?;
        }
        Ok(())
    }
}

impl FromStr for DiffRecord {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut record = Self::new();

        for (number, line) in s.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut chars = line.chars();
            let action = chars.next().and_then(DiffAction::from_code);
            let rest = chars.as_str().strip_prefix(' ');

            match (action, rest) {
                (Some(action), Some(path)) if !path.is_empty() => record.insert(path, action),
                _ => {
                    return Err(ForgeError::Serialization(format!(
                        "invalid diff line {}: {line:?}",
                        number + 1
                    )));
                }
            }
        }

        Ok(record)
    }
}

impl<'a> IntoIterator for &'a DiffRecord {
    type Item = (&'a String, &'a DiffAction);
    type IntoIter = std::collections::btree_map::Iter<'a, String, DiffAction>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

fn normalize(path: &str) -> String {
    let relative = path.trim_start_matches("./").trim_start_matches('/');
    format!("./{relative}")
}

fn is_framing(line: &str) -> bool {
    line.is_empty()
        || line == "sending incremental file list"
        || line.starts_with("created directory ")
        || (line.starts_with("sent ") && line.contains(" bytes"))
        || line.starts_with("total size is ")
}

/// Computes [`DiffRecord`]s between directory trees.
#[derive(Clone)]
pub struct FolderDiff {
    executor: BoxedExecutor,
}

impl fmt::Debug for FolderDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FolderDiff").finish_non_exhaustive()
    }
}

impl FolderDiff {
    /// Create a diff engine running rsync through `executor`.
    #[must_use]
    pub fn new(executor: BoxedExecutor) -> Self {
        Self { executor }
    }

    /// Diff describing how to turn `base` into `target`.
    ///
    /// # Errors
    ///
    /// Returns [`ForgeError::DiffFailed`] if rsync exits above 1 or is killed.
    pub async fn compute(&self, base: &Path, target: &Path) -> ForgeResult<DiffRecord> {
        let mut command = tokio::process::Command::new(RSYNC);
        command
            .arg("-nav")
            .arg("--delete")
            .arg(dir_arg(target))
            .arg(dir_arg(base));
        let line = CommandLine::from(command.as_std());

        let output = self.executor.execute_async(&mut command).await?;
        match ExitOutcome::classify(output.status, TOLERATED_STATUS) {
            ExitOutcome::Success => {}
            ExitOutcome::Tolerated(code) => {
                tracing::warn!(command = %line, status = code, stderr = %stderr_of(&output), "rsync reported warnings");
            }
            ExitOutcome::Fatal(status) => {
                return Err(ForgeError::DiffFailed {
                    status,
                    stderr: stderr_of(&output),
                });
            }
        }

        let record = DiffRecord::parse_report(&String::from_utf8_lossy(&output.stdout));
        tracing::debug!(
            base = %base.display(),
            target = %target.display(),
            entries = record.len(),
            "Computed directory diff"
        );
        Ok(record)
    }
}

/// rsync needs a trailing slash to compare directory contents.
fn dir_arg(path: &Path) -> String {
    let mut arg = path.to_string_lossy().into_owned();
    if !arg.ends_with('/') {
        arg.push('/');
    }
    arg
}
