//! Resource limits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use jailforge_common::ForgeResult;
use parking_lot::Mutex;

use crate::recorder::Step;
use crate::runner::{Runner, command};

/// Resource limits applied with `rctl`.
#[derive(Debug)]
pub struct ResourceLimitStep {
    runner: Runner,
    jail: String,
    rules: BTreeMap<String, String>,
    applied: Mutex<bool>,
}

impl ResourceLimitStep {
    /// Apply `rules` (`resource → action=amount`) to jail `jail`.
    #[must_use]
    pub fn new(runner: Runner, jail: impl Into<String>, rules: BTreeMap<String, String>) -> Self {
        Self {
            runner,
            jail: jail.into(),
            rules,
            applied: Mutex::new(false),
        }
    }

    /// `rctl` rule strings, e.g. `jail:web:memoryuse:deny=512M`.
    #[must_use]
    pub fn rules(&self) -> Vec<String> {
        self.rules
            .iter()
            .map(|(resource, action)| format!("jail:{}:{resource}:{action}", self.jail))
            .collect()
    }

    async fn remove(&self) -> ForgeResult<()> {
        let subject = format!("jail:{}", self.jail);
        self.runner.check(command("rctl", ["-r", subject.as_str()])).await?;
        *self.applied.lock() = false;
        Ok(())
    }
}

#[async_trait]
impl Step for ResourceLimitStep {
    fn name(&self) -> &str {
        "rctl"
    }

    async fn execute(&self) -> ForgeResult<()> {
        for rule in self.rules() {
            *self.applied.lock() = true;
            if let Err(err) = self.runner.check(command("rctl", ["-a", rule.as_str()])).await {
                if let Err(cleanup) = self.remove().await {
                    tracing::warn!(jail = %self.jail, error = %cleanup, "Could not remove partial limits");
                }
                return Err(err);
            }
            tracing::debug!(rule = %rule, "Limit applied");
        }
        Ok(())
    }

    async fn compensate(&self) -> ForgeResult<()> {
        if !*self.applied.lock() {
            return Ok(());
        }
        self.remove().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jailforge_common::FakeExecutor;

    #[test]
    fn rule_strings() {
        let rules = BTreeMap::from([
            ("memoryuse".to_string(), "deny=512M".to_string()),
            ("maxproc".to_string(), "deny=100".to_string()),
        ]);
        let step = ResourceLimitStep::new(Runner::new(FakeExecutor::new().as_executor(), 0), "web", rules);
        assert_eq!(step.rules(), vec!["jail:web:maxproc:deny=100", "jail:web:memoryuse:deny=512M"]);
    }

    #[tokio::test]
    async fn failed_rule_removes_earlier_ones() {
        let fake = FakeExecutor::new();
        fake.set_handler(Box::new(|line| {
            if line.args.iter().any(|a| a.contains("memoryuse")) {
                FakeExecutor::failure(1, "rctl: unknown resource")
            } else {
                FakeExecutor::success("")
            }
        }));
        let rules = BTreeMap::from([
            ("maxproc".to_string(), "deny=100".to_string()),
            ("memoryuse".to_string(), "bogus=1".to_string()),
        ]);
        let step = ResourceLimitStep::new(Runner::new(std::sync::Arc::clone(&fake).as_executor(), 0), "web", rules);

        assert!(step.execute().await.is_err());
        assert_eq!(fake.command_strings(), vec![
            "rctl -a jail:web:maxproc:deny=100",
            "rctl -a jail:web:memoryuse:bogus=1",
            "rctl -r jail:web",
        ]);
        step.compensate().await.unwrap();
        assert_eq!(fake.commands().len(), 3);
    }
}
