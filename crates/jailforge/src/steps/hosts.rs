//! Hosts file entries for running jails.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use jailforge_common::ForgeResult;

use crate::jail::Jail;
use crate::recorder::Step;

/// Publishes the jail address in the hosts file.
///
/// Entries carry a `# jailforge:<name>` marker so they can be removed again.
#[derive(Debug)]
pub struct HostsStep {
    hosts_file: PathBuf,
    jail: Arc<Jail>,
}

impl HostsStep {
    /// Add `jail` to `hosts_file`.
    #[must_use]
    pub fn new(hosts_file: impl Into<PathBuf>, jail: Arc<Jail>) -> Self {
        Self {
            hosts_file: hosts_file.into(),
            jail,
        }
    }

    fn marker(&self) -> String {
        format!("# jailforge:{}", self.jail.name())
    }

    async fn read(&self) -> ForgeResult<String> {
        match tokio::fs::read_to_string(&self.hosts_file).await {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn strip(&self) -> ForgeResult<()> {
        let marker = self.marker();
        let text = self.read().await?;
        let kept: String = text
            .lines()
            .filter(|line| !line.ends_with(&marker))
            .map(|line| format!("{line}\n"))
            .collect();
        if kept != text {
            tokio::fs::write(&self.hosts_file, kept).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Step for HostsStep {
    fn name(&self) -> &str {
        "hosts"
    }

    async fn execute(&self) -> ForgeResult<()> {
        let Some(info) = self.jail.info() else {
            return Ok(());
        };
        let Some(ip) = info.primary_ip4() else {
            tracing::debug!(jail = %self.jail.name(), "No address to publish");
            return Ok(());
        };
        let hostname = if info.hostname.is_empty() {
            self.jail.name()
        } else {
            info.hostname.as_str()
        };

        self.strip().await?;
        let mut text = self.read().await?;
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("{ip} {hostname} {}\n", self.marker()));
        tokio::fs::write(&self.hosts_file, text).await?;

        tracing::info!(jail = %self.jail.name(), ip, hostname, "Hosts entry added");
        Ok(())
    }

    async fn compensate(&self) -> ForgeResult<()> {
        self.strip().await
    }
}
