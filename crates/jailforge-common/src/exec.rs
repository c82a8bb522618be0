//! External command execution.
//!
//! Every call to `zfs`, `rsync`, `jail`, `rctl` and friends goes through an
//! [`Executor`]. Production code uses [`HostExecutor`]; tests swap in a
//! [`FakeExecutor`] that records command lines and answers from a handler.
//!
//! A non-zero exit status is not an error at this layer. Each caller decides
//! what a status means through [`ExitOutcome::classify`].

use std::fmt;
use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Output};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ForgeError, ForgeResult};

/// Shared executor handle.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Runs external commands and returns their output.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs a command to completion, blocking the current thread.
    ///
    /// # Errors
    ///
    /// Returns an error only if the process could not be started.
    fn execute(&self, command: &mut Command) -> ForgeResult<Output>;

    /// Runs a command to completion without blocking the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error only if the process could not be started.
    async fn execute_async(&self, command: &mut tokio::process::Command) -> ForgeResult<Output>;
}

/// A printable command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Program name as given to the command.
    pub program: String,
    /// Arguments in order.
    pub args: Vec<String>,
}

impl CommandLine {
    /// Build a command line from whitespace separated words.
    #[must_use]
    pub fn shell(line: impl AsRef<str>) -> Self {
        let mut words = line.as_ref().split_whitespace().map(str::to_string);
        Self {
            program: words.next().unwrap_or_default(),
            args: words.collect(),
        }
    }

    /// Whether the program is `program` and the arguments start with `prefix`.
    #[must_use]
    pub fn starts_with(&self, program: &str, prefix: &[&str]) -> bool {
        self.program == program
            && self.args.len() >= prefix.len()
            && self.args.iter().zip(prefix).all(|(a, p)| a == p)
    }
}

impl From<&Command> for CommandLine {
    fn from(command: &Command) -> Self {
        Self {
            program: command.get_program().to_string_lossy().into_owned(),
            args: command
                .get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect(),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// How an exit status should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit status zero.
    Success,
    /// Non-zero, but at or below the caller's tolerance.
    Tolerated(i32),
    /// Above tolerance, or terminated by a signal (`None`).
    Fatal(Option<i32>),
}

impl ExitOutcome {
    /// Classify a status, tolerating codes `1..=tolerated_max`.
    #[must_use]
    pub fn classify(status: ExitStatus, tolerated_max: i32) -> Self {
        match status.code() {
            Some(0) => Self::Success,
            Some(code) if code > 0 && code <= tolerated_max => Self::Tolerated(code),
            code => Self::Fatal(code),
        }
    }

    /// Classify a status with no tolerated codes.
    #[must_use]
    pub fn strict(status: ExitStatus) -> Self {
        Self::classify(status, 0)
    }

    /// Whether the caller should carry on.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        !matches!(self, Self::Fatal(_))
    }
}

/// Lossy, trimmed standard output.
#[must_use]
pub fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Lossy, trimmed standard error.
#[must_use]
pub fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Turn a fatal exit into [`ForgeError::CommandFailed`].
///
/// # Errors
///
/// Returns `CommandFailed` unless the command exited with status zero.
pub fn check_success(command: &CommandLine, output: &Output) -> ForgeResult<()> {
    match ExitOutcome::strict(output.status) {
        ExitOutcome::Success => Ok(()),
        ExitOutcome::Tolerated(code) => Err(command_failed(command, Some(code), output)),
        ExitOutcome::Fatal(code) => Err(command_failed(command, code, output)),
    }
}

fn command_failed(command: &CommandLine, status: Option<i32>, output: &Output) -> ForgeError {
    ForgeError::CommandFailed {
        command: command.to_string(),
        status,
        stderr: stderr_of(output),
    }
}

/// Await `fut`, failing with [`ForgeError::Timeout`] after `seconds`.
///
/// A timeout of zero waits indefinitely.
///
/// # Errors
///
/// Returns `Timeout` if the deadline passes, otherwise whatever `fut` returns.
pub async fn with_timeout<T, F>(seconds: u64, command: &CommandLine, fut: F) -> ForgeResult<T>
where
    F: Future<Output = ForgeResult<T>>,
{
    if seconds == 0 {
        return fut.await;
    }
    tokio::time::timeout(Duration::from_secs(seconds), fut)
        .await
        .map_err(|_| ForgeError::Timeout {
            command: command.to_string(),
            seconds,
        })?
}

fn log_input(id: u64, command: &CommandLine) {
    tracing::debug!(id, command = %command, "running command");
}

fn log_output(id: u64, output: &Output) {
    tracing::debug!(
        id,
        result = if output.status.success() { "OK" } else { "ERROR" },
        status = ?output.status.code(),
        "finished command"
    );
    if !output.stdout.is_empty() {
        tracing::trace!(id, stdout = %String::from_utf8_lossy(&output.stdout), "command stdout");
    }
    if !output.stderr.is_empty() {
        tracing::debug!(id, stderr = %String::from_utf8_lossy(&output.stderr), "command stderr");
    }
}

/// Executor that runs real processes on the host.
#[derive(Debug, Default)]
pub struct HostExecutor {
    counter: AtomicU64,
}

impl HostExecutor {
    /// Create a new host executor.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Coerce into the shared trait object.
    #[must_use]
    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }

    fn prepare(&self, command: &Command) -> (u64, CommandLine) {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let line = CommandLine::from(command);
        log_input(id, &line);
        (id, line)
    }
}

#[async_trait]
impl Executor for HostExecutor {
    fn execute(&self, command: &mut Command) -> ForgeResult<Output> {
        let (id, line) = self.prepare(command);
        let output = command.output().map_err(|err| {
            tracing::error!(id, command = %line, error = %err, "could not start program");
            err
        })?;
        log_output(id, &output);
        Ok(output)
    }

    async fn execute_async(&self, command: &mut tokio::process::Command) -> ForgeResult<Output> {
        let (id, line) = self.prepare(command.as_std());
        let output = command.kill_on_drop(true).output().await.map_err(|err| {
            tracing::error!(id, command = %line, error = %err, "could not start program");
            err
        })?;
        log_output(id, &output);
        Ok(output)
    }
}

/// Handler answering commands seen by a [`FakeExecutor`].
pub type FakeHandler = Box<dyn FnMut(&CommandLine) -> Output + Send>;

/// Executor that never spawns anything.
///
/// Every command line is recorded and answered by the current handler. The
/// default handler succeeds with empty output.
pub struct FakeExecutor {
    counter: AtomicU64,
    handler: Mutex<FakeHandler>,
    seen: Mutex<Vec<CommandLine>>,
}

impl FakeExecutor {
    /// Create a fake executor that answers every command with success.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            counter: AtomicU64::new(0),
            handler: Mutex::new(Box::new(|_: &CommandLine| Self::success(""))),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Replace the handler.
    pub fn set_handler(&self, handler: FakeHandler) {
        *self.handler.lock() = handler;
    }

    /// Coerce into the shared trait object.
    #[must_use]
    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }

    /// All command lines seen so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<CommandLine> {
        self.seen.lock().clone()
    }

    /// Rendered command lines seen so far, in order.
    #[must_use]
    pub fn command_strings(&self) -> Vec<String> {
        self.seen.lock().iter().map(ToString::to_string).collect()
    }

    /// Build an output with the given exit code.
    #[must_use]
    pub fn output(code: i32, stdout: &str, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    /// Successful output with the given stdout.
    #[must_use]
    pub fn success(stdout: &str) -> Output {
        Self::output(0, stdout, "")
    }

    /// Failed output with the given code and stderr.
    #[must_use]
    pub fn failure(code: i32, stderr: &str) -> Output {
        Self::output(code, "", stderr)
    }

    fn execute_internal(&self, command: &Command) -> Output {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let line = CommandLine::from(command);
        log_input(id, &line);
        self.seen.lock().push(line.clone());
        let output = (self.handler.lock())(&line);
        log_output(id, &output);
        output
    }
}

impl fmt::Debug for FakeExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeExecutor")
            .field("seen", &self.seen.lock().len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn execute(&self, command: &mut Command) -> ForgeResult<Output> {
        Ok(self.execute_internal(command))
    }

    async fn execute_async(&self, command: &mut tokio::process::Command) -> ForgeResult<Output> {
        Ok(self.execute_internal(command.as_std()))
    }
}
