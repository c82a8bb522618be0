//! Runs jail, package and hook commands with the configured timeout.

use std::process::Output;

use jailforge_common::exec::{CommandLine, check_success, with_timeout};
use jailforge_common::{BoxedExecutor, ForgeResult};
use tokio::process::Command;

/// Executor plus timeout, shared by every step of a run.
#[derive(Clone)]
pub struct Runner {
    executor: BoxedExecutor,
    timeout: u64,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Run through `executor`, giving up after `timeout` seconds (0 waits forever).
    #[must_use]
    pub fn new(executor: BoxedExecutor, timeout: u64) -> Self {
        Self { executor, timeout }
    }

    /// The underlying executor.
    #[must_use]
    pub fn executor(&self) -> &BoxedExecutor {
        &self.executor
    }

    /// Run `command` and return its output whatever the exit status.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be started or times out.
    pub async fn output(&self, mut command: Command) -> ForgeResult<Output> {
        let line = CommandLine::from(command.as_std());
        with_timeout(self.timeout, &line, self.executor.execute_async(&mut command)).await
    }

    /// Run `command` and require exit status zero.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` on a non-zero exit, or any error from
    /// [`Runner::output`].
    pub async fn check(&self, command: Command) -> ForgeResult<Output> {
        let line = CommandLine::from(command.as_std());
        let output = self.output(command).await?;
        check_success(&line, &output)?;
        Ok(output)
    }
}

/// Build a command from a program and arguments.
pub fn command<I, S>(program: &str, args: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut command = Command::new(program);
    command.args(args);
    command
}
