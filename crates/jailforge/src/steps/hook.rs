//! Post-start hooks.
//!
//! Commands run concurrently, either on the host or inside the jail through
//! `jexec`. The first failure is reported once all of them have finished.

use async_trait::async_trait;
use futures::future::join_all;
use jailforge_common::ForgeResult;

use crate::recorder::Step;
use crate::runner::{Runner, command};

/// Where hook commands run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookTarget {
    /// Inside the named jail, through `jexec`.
    Jail(String),
    /// On the host.
    Host,
}

/// Post-start commands, run concurrently.
#[derive(Debug)]
pub struct HookStep {
    runner: Runner,
    target: HookTarget,
    commands: Vec<String>,
}

impl HookStep {
    /// Run `commands` on `target`.
    #[must_use]
    pub fn new(runner: Runner, target: HookTarget, commands: Vec<String>) -> Self {
        Self {
            runner,
            target,
            commands,
        }
    }

    fn command(&self, line: &str) -> tokio::process::Command {
        match &self.target {
            HookTarget::Jail(name) => command("jexec", [name.as_str(), "sh", "-c", line]),
            HookTarget::Host => command("sh", ["-c", line]),
        }
    }
}

#[async_trait]
impl Step for HookStep {
    fn name(&self) -> &str {
        match self.target {
            HookTarget::Jail(_) => "j-poststart",
            HookTarget::Host => "h-poststart",
        }
    }

    /// Every command runs to completion; the first failure is returned.
    async fn execute(&self) -> ForgeResult<()> {
        let runs = self.commands.iter().map(|line| async move {
            tracing::info!(hook = ?self.target, command = %line, "Running hook");
            self.runner.check(self.command(line)).await
        });

        join_all(runs)
            .await
            .into_iter()
            .find_map(Result::err)
            .map_or(Ok(()), Err)
    }

    async fn compensate(&self) -> ForgeResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jailforge_common::FakeExecutor;
    use std::sync::Arc;

    #[tokio::test]
    async fn all_commands_run_even_when_one_fails() {
        let fake = FakeExecutor::new();
        fake.set_handler(Box::new(|line| {
            if line.args.iter().any(|a| a == "false") {
                FakeExecutor::failure(1, "")
            } else {
                FakeExecutor::success("")
            }
        }));
        let step = HookStep::new(
            Runner::new(Arc::clone(&fake).as_executor(), 0),
            HookTarget::Jail("web".to_string()),
            vec!["true".to_string(), "false".to_string(), "echo hi".to_string()],
        );

        assert!(step.execute().await.is_err());
        let mut seen = fake.command_strings();
        seen.sort();
        assert_eq!(seen, vec![
            "jexec web sh -c echo hi",
            "jexec web sh -c false",
            "jexec web sh -c true",
        ]);
    }

    #[tokio::test]
    async fn host_hooks_use_sh() {
        let fake = FakeExecutor::new();
        let step = HookStep::new(
            Runner::new(Arc::clone(&fake).as_executor(), 0),
            HookTarget::Host,
            vec!["pfctl -f /etc/pf.conf".to_string()],
        );
        step.execute().await.unwrap();
        assert_eq!(step.name(), "h-poststart");
        assert_eq!(fake.command_strings(), vec!["sh -c pfctl -f /etc/pf.conf"]);
    }
}
