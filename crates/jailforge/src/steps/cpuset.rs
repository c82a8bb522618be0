//! CPU pinning with `cpuset`.

use std::sync::Arc;

use async_trait::async_trait;
use jailforge_common::{ForgeError, ForgeResult};

use crate::jail::Jail;
use crate::recorder::Step;
use crate::runner::{Runner, command};

/// `cpuset -l` list for the first `cpus` CPUs of a host with `host_cpus`.
#[must_use]
pub fn cpu_list(cpus: usize, host_cpus: usize) -> String {
    match cpus.min(host_cpus).max(1) {
        1 => "0".to_string(),
        n => format!("0-{}", n - 1),
    }
}

/// Pins a running jail to a CPU list.
#[derive(Debug)]
pub struct CpusetStep {
    runner: Runner,
    jail: Arc<Jail>,
    list: String,
}

impl CpusetStep {
    /// Pin `jail` to `list` once it runs.
    #[must_use]
    pub fn new(runner: Runner, jail: Arc<Jail>, list: impl Into<String>) -> Self {
        Self {
            runner,
            jail,
            list: list.into(),
        }
    }
}

#[async_trait]
impl Step for CpusetStep {
    fn name(&self) -> &str {
        "cpuset"
    }

    async fn execute(&self) -> ForgeResult<()> {
        let jid = self
            .jail
            .info()
            .map(|info| info.jid)
            .ok_or_else(|| ForgeError::JailNotFound {
                name: self.jail.name().to_string(),
            })?;

        let jid = jid.to_string();
        self.runner
            .check(command("cpuset", ["-l", self.list.as_str(), "-j", jid.as_str()]))
            .await?;
        tracing::info!(jail = %self.jail.name(), cpus = %self.list, "CPU set applied");
        Ok(())
    }

    // The cpuset goes away with the jail.
    async fn compensate(&self) -> ForgeResult<()> {
        Ok(())
    }
}
