//! The provisioning pipeline.
//!
//! ```text
//! base image ─► materialize ─► mount ─► rctl ─► pkg ─► register ─► jail
//!                                          ─► cpuset ─► j-poststart ─► h-poststart ─► hosts
//! ```
//!
//! Every stage after the base image runs through one [`Recorder`] session, so
//! a failure anywhere unwinds all completed stages in reverse order. The
//! session is kept in the registry until [`Provisioner::stop`].

use std::path::PathBuf;
use std::sync::Arc;

use jailforge_common::{BoxedExecutor, ForgeConfig, ForgeError, ForgePaths, ForgeResult};
use jailforge_storage::{BaseImages, Layers, Zfs};

use crate::jail::{EventBus, Jail, JailConfig};
use crate::manifest::Manifest;
use crate::recorder::{Recorder, Step};
use crate::registry::JailRegistry;
use crate::runner::Runner;
use crate::steps::{
    CpusetStep, HookStep, HookTarget, HostsStep, MaterializeStep, MountStep, PackageInstallStep,
    RegisterStep, ResourceLimitStep, cpu_list,
};

/// Host file copied into every jail when `resolv_sync` is on.
pub const HOST_RESOLV: &str = "/etc/resolv.conf";

/// Provisions and tears down jails.
#[derive(Debug)]
pub struct Provisioner {
    config: ForgeConfig,
    paths: ForgePaths,
    zfs: Zfs,
    runner: Runner,
    registry: Arc<JailRegistry>,
    events: EventBus,
    host_cpus: usize,
    resolv: Option<PathBuf>,
}

impl Provisioner {
    /// A provisioner running every command through `executor`.
    #[must_use]
    pub fn new(config: ForgeConfig, executor: BoxedExecutor, registry: Arc<JailRegistry>) -> Self {
        let paths = config.paths();
        let runner = Runner::new(Arc::clone(&executor), config.command_timeout);
        let resolv = config.resolv_sync.then(|| PathBuf::from(HOST_RESOLV));
        let host_cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);

        Self {
            config,
            paths,
            zfs: Zfs::new(executor),
            runner,
            registry,
            events: EventBus::new(),
            host_cpus,
            resolv,
        }
    }

    /// Override the host CPU count used to clamp `cpus`.
    #[must_use]
    pub fn with_host_cpus(mut self, cpus: usize) -> Self {
        self.host_cpus = cpus.max(1);
        self
    }

    /// Override the resolv.conf copied into jails (`None` disables the copy).
    #[must_use]
    pub fn with_resolv(mut self, path: Option<PathBuf>) -> Self {
        self.resolv = path;
        self
    }

    /// Override the filesystem paths.
    #[must_use]
    pub fn with_paths(mut self, paths: ForgePaths) -> Self {
        self.paths = paths;
        self
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    /// Jail lifecycle events.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Registry of active jails.
    #[must_use]
    pub fn registry(&self) -> &Arc<JailRegistry> {
        &self.registry
    }

    /// Image layers.
    #[must_use]
    pub fn images(&self) -> Layers {
        Layers::new(self.zfs.clone(), self.config.images_dataset())
    }

    /// Named volumes.
    #[must_use]
    pub fn volumes(&self) -> Layers {
        Layers::new(self.zfs.clone(), self.config.volumes_dataset())
    }

    /// Check that the configured pool exists.
    ///
    /// # Errors
    ///
    /// Returns `PoolNotFound` listing the pools that do exist.
    pub fn check(&self) -> ForgeResult<()> {
        self.zfs.check_pool(&self.config.pool)
    }

    /// Provision and start the jail described by `manifest`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the jail is already active, or the error of
    /// the first stage that failed after everything before it was undone.
    pub async fn provision(&self, manifest: &Manifest) -> ForgeResult<Arc<Jail>> {
        manifest.validate()?;
        let name = manifest.name.as_str();
        if self.registry.contains(name) {
            return Err(ForgeError::AlreadyExists {
                target: name.to_string(),
            });
        }
        tracing::info!(jail = %name, base = %manifest.base, "Provisioning jail");

        self.check()?;
        let bases = BaseImages::new(self.images(), &self.config.bases_url, self.paths.cache());
        let base = bases.ensure(&manifest.base, manifest.digest().as_ref()).await?;

        let mut recorder = Recorder::new();

        let mut materialize = MaterializeStep::new(
            self.zfs.clone(),
            self.config.containers_dataset(),
            base.dataset.as_str(),
            name,
        );
        if let Some(resolv) = &self.resolv {
            materialize = materialize.with_resolv(resolv);
        }
        let materialize = Arc::new(materialize);
        recorder.run(Arc::clone(&materialize) as Arc<dyn Step>).await?;
        let root = match materialize.root() {
            Some(root) => root.to_path_buf(),
            None => {
                recorder.rollback().await;
                return Err(ForgeError::Internal {
                    message: format!("jail root of {name} missing after materialize"),
                });
            }
        };

        if !manifest.mounts.is_empty() || !manifest.volumes.is_empty() {
            let mounts = MountStep::new(
                self.runner.clone(),
                self.volumes(),
                name,
                &root,
                &manifest.workdir,
            )
            .with_mounts(manifest.mounts.clone())
            .with_volumes(manifest.volumes.clone());
            recorder.run(Arc::new(mounts)).await?;
        }

        if !manifest.rctl.is_empty() {
            let rctl = ResourceLimitStep::new(self.runner.clone(), name, manifest.rctl.clone());
            recorder.run(Arc::new(rctl)).await?;
        }

        if !manifest.pkg.is_empty() {
            let pkg = PackageInstallStep::new(self.runner.clone(), &root, manifest.pkg.clone());
            recorder.run(Arc::new(pkg)).await?;
        }
        if !manifest.pkg_regex.is_empty() {
            let pkg = PackageInstallStep::new(self.runner.clone(), &root, manifest.pkg_regex.clone())
                .regex(true);
            recorder.run(Arc::new(pkg)).await?;
        }

        let jail = Arc::new(Jail::new(
            manifest.name.clone(),
            self.jail_config(manifest, &root),
            self.paths.jail_conf(name),
            self.runner.clone(),
            self.events.clone(),
        ));
        tracing::debug!(jail = %name, config = %jail.config(), "Generated jail.conf");

        recorder
            .run(Arc::new(RegisterStep::new(Arc::clone(&self.registry), Arc::clone(&jail))))
            .await?;
        recorder.run(Arc::clone(&jail) as Arc<dyn Step>).await?;

        let cpus = manifest
            .cpus
            .map(|n| cpu_list(n, self.host_cpus))
            .or_else(|| manifest.cpuset.clone());
        if let Some(list) = cpus {
            let cpuset = CpusetStep::new(self.runner.clone(), Arc::clone(&jail), list);
            recorder.run(Arc::new(cpuset)).await?;
        }

        if !manifest.j_poststart.is_empty() {
            let hook = HookStep::new(
                self.runner.clone(),
                HookTarget::Jail(name.to_string()),
                manifest.j_poststart.clone(),
            );
            recorder.run(Arc::new(hook)).await?;
        }
        if !manifest.h_poststart.is_empty() {
            let hook = HookStep::new(self.runner.clone(), HookTarget::Host, manifest.h_poststart.clone());
            recorder.run(Arc::new(hook)).await?;
        }

        let hosts = HostsStep::new(&self.config.hosts_file, Arc::clone(&jail));
        recorder.run(Arc::new(hosts)).await?;

        tracing::info!(jail = %name, steps = ?recorder.steps(), "Jail provisioned");
        self.registry.store_session(name, recorder);
        Ok(jail)
    }

    /// Tear down jail `name` by unwinding its provisioning session.
    ///
    /// # Errors
    ///
    /// Returns `JailNotFound` if no session is stored for `name`.
    pub async fn stop(&self, name: &str) -> ForgeResult<()> {
        let Some(mut session) = self.registry.take_session(name) else {
            return Err(ForgeError::JailNotFound {
                name: name.to_string(),
            });
        };
        tracing::info!(jail = %name, steps = session.len(), "Tearing down jail");
        session.rollback().await;
        Ok(())
    }

    /// Tear down every provisioned jail.
    pub async fn stop_all(&self) {
        for name in self.registry.names() {
            if let Err(err) = self.stop(&name).await {
                tracing::warn!(jail = %name, error = %err, "Could not tear down jail");
            }
        }
    }

    fn jail_config(&self, manifest: &Manifest, root: &std::path::Path) -> JailConfig {
        let mut config = JailConfig::with_defaults(manifest.name.as_str(), &root.to_string_lossy());
        for (key, value) in &manifest.params {
            config.set(key.as_str(), value.clone());
        }
        config
    }
}
