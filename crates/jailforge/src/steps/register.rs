//! Registry bookkeeping.

use std::sync::Arc;

use async_trait::async_trait;
use jailforge_common::ForgeResult;

use crate::jail::Jail;
use crate::recorder::Step;
use crate::registry::JailRegistry;

/// Adds the jail to the registry of active jails.
#[derive(Debug)]
pub struct RegisterStep {
    registry: Arc<JailRegistry>,
    jail: Arc<Jail>,
}

impl RegisterStep {
    /// Register `jail` in `registry`.
    #[must_use]
    pub fn new(registry: Arc<JailRegistry>, jail: Arc<Jail>) -> Self {
        Self { registry, jail }
    }
}

#[async_trait]
impl Step for RegisterStep {
    fn name(&self) -> &str {
        "register"
    }

    async fn execute(&self) -> ForgeResult<()> {
        self.registry.insert(Arc::clone(&self.jail))
    }

    async fn compensate(&self) -> ForgeResult<()> {
        self.registry.remove(self.jail.name());
        Ok(())
    }
}
