//! Package installation.

use std::path::PathBuf;

use async_trait::async_trait;
use jailforge_common::ForgeResult;

use crate::recorder::Step;
use crate::runner::{Runner, command};

/// Installs packages into the jail root with `pkg -c`.
///
/// Nothing to undo: the jail root dataset is destroyed on rollback.
#[derive(Debug)]
pub struct PackageInstallStep {
    runner: Runner,
    root: PathBuf,
    packages: Vec<String>,
    regex: bool,
}

impl PackageInstallStep {
    /// Install `packages` by name.
    #[must_use]
    pub fn new(runner: Runner, root: impl Into<PathBuf>, packages: Vec<String>) -> Self {
        Self {
            runner,
            root: root.into(),
            packages,
            regex: false,
        }
    }

    /// Treat the package list as regular expressions (`pkg install -x`).
    #[must_use]
    pub fn regex(mut self, regex: bool) -> Self {
        self.regex = regex;
        self
    }
}

#[async_trait]
impl Step for PackageInstallStep {
    fn name(&self) -> &str {
        if self.regex { "pkg-regex" } else { "pkg" }
    }

    async fn execute(&self) -> ForgeResult<()> {
        if self.packages.is_empty() {
            return Ok(());
        }

        let mut pkg = command("pkg", ["-c"]);
        pkg.arg(&self.root).args(["install", "-y"]);
        if self.regex {
            pkg.arg("-x");
        }
        pkg.args(&self.packages);

        tracing::info!(packages = ?self.packages, regex = self.regex, "Installing packages");
        self.runner.check(pkg).await?;
        Ok(())
    }

    async fn compensate(&self) -> ForgeResult<()> {
        Ok(())
    }
}
