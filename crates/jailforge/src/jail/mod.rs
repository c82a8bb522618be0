//! Jail lifecycle controller.
//!
//! A [`Jail`] goes Created → Started → Stopped. Starting writes a scratch
//! `jail.conf`, runs `jail -c` and loads the runtime facts with `jls`;
//! stopping runs `jail -r` and deletes the scratch file.

pub mod config;
pub mod events;
pub mod info;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use jailforge_common::exec::{stderr_of, stdout_of};
use jailforge_common::{ForgeError, ForgeResult, JailName};
use parking_lot::RwLock;

pub use config::{JailConfig, ParamValue};
pub use events::{EventBus, JailEvent};
pub use info::JailInfo;

use crate::recorder::Step;
use crate::runner::{Runner, command};

/// Jail management utility.
pub const JAIL: &str = "jail";
/// Jail listing utility.
pub const JLS: &str = "jls";

/// Lifecycle state of a jail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JailStatus {
    /// Configuration built, not running.
    Created,
    /// Running, facts loaded.
    Started,
    /// Removed.
    Stopped,
}

#[derive(Debug)]
struct JailState {
    status: JailStatus,
    info: Option<JailInfo>,
}

/// A FreeBSD jail.
#[derive(Debug)]
pub struct Jail {
    name: JailName,
    config: JailConfig,
    conf_path: PathBuf,
    runner: Runner,
    events: EventBus,
    state: RwLock<JailState>,
}

impl Jail {
    /// A jail in the Created state.
    ///
    /// `conf_path` is where the generated `jail.conf` is written while the
    /// jail runs.
    #[must_use]
    pub fn new(
        name: JailName,
        config: JailConfig,
        conf_path: impl Into<PathBuf>,
        runner: Runner,
        events: EventBus,
    ) -> Self {
        Self {
            name,
            config,
            conf_path: conf_path.into(),
            runner,
            events,
            state: RwLock::new(JailState {
                status: JailStatus::Created,
                info: None,
            }),
        }
    }

    /// Jail name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Generated configuration.
    #[must_use]
    pub fn config(&self) -> &JailConfig {
        &self.config
    }

    /// Scratch configuration path.
    #[must_use]
    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    /// Current state.
    #[must_use]
    pub fn status(&self) -> JailStatus {
        self.state.read().status
    }

    /// Whether the jail is running.
    #[must_use]
    pub fn is_working(&self) -> bool {
        self.status() == JailStatus::Started
    }

    /// Runtime facts, available once started.
    #[must_use]
    pub fn info(&self) -> Option<JailInfo> {
        self.state.read().info.clone()
    }

    /// Create the jail.
    ///
    /// # Errors
    ///
    /// Returns `JailStartFailed` if `jail -c` exits non-zero. If the jail was
    /// created but its facts cannot be read, it is removed again and that
    /// error is returned.
    pub async fn start(&self) -> ForgeResult<()> {
        let name = self.name().to_string();
        tracing::info!(jail = %name, "Starting jail");
        self.events.publish(JailEvent::BeforeStart {
            name: name.clone(),
            timestamp: events::now(),
        });

        if let Some(dir) = self.conf_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&self.conf_path, self.config.to_string()).await?;

        let mut create = command(JAIL, ["-c", "-f"]);
        create.arg(&self.conf_path).arg(&name);
        let output = self.runner.output(create).await;
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                self.remove_conf().await;
                return Err(err);
            }
        };
        if !output.status.success() {
            self.remove_conf().await;
            return Err(ForgeError::JailStartFailed {
                name,
                status: output.status.code(),
                stderr: stderr_of(&output),
            });
        }

        let info = match self.load_info().await {
            Ok(info) => info,
            Err(err) => {
                tracing::error!(jail = %name, error = %err, "Could not read jail facts, removing jail");
                if let Err(remove_err) = self.remove().await {
                    tracing::warn!(jail = %name, error = %remove_err, "Could not remove jail");
                }
                self.remove_conf().await;
                return Err(err);
            }
        };

        let jid = info.jid;
        {
            let mut state = self.state.write();
            state.status = JailStatus::Started;
            state.info = Some(info);
        }
        tracing::info!(jail = %name, jid, "Jail started");
        self.events.publish(JailEvent::Started {
            name,
            jid,
            timestamp: events::now(),
        });
        Ok(())
    }

    /// Remove the jail.
    ///
    /// The scratch configuration is deleted and the state flips to Stopped
    /// even when `jail -r` fails; the failure is returned afterwards.
    ///
    /// # Errors
    ///
    /// Returns `CommandFailed` if `jail -r` exits non-zero.
    pub async fn stop(&self) -> ForgeResult<()> {
        let name = self.name().to_string();
        tracing::info!(jail = %name, "Stopping jail");
        self.events.publish(JailEvent::BeforeStop {
            name: name.clone(),
            timestamp: events::now(),
        });

        let result = self.remove().await;
        self.remove_conf().await;
        {
            let mut state = self.state.write();
            state.status = JailStatus::Stopped;
        }

        self.events.publish(JailEvent::Stopped {
            name: name.clone(),
            timestamp: events::now(),
        });
        match &result {
            Ok(()) => tracing::info!(jail = %name, "Jail stopped"),
            Err(err) => tracing::error!(jail = %name, error = %err, "Jail removal failed"),
        }
        result
    }

    async fn remove(&self) -> ForgeResult<()> {
        let mut remove = command(JAIL, ["-r", "-f"]);
        remove.arg(&self.conf_path).arg(self.name());
        self.runner.check(remove).await.map(|_| ())
    }

    async fn load_info(&self) -> ForgeResult<JailInfo> {
        let output = self
            .runner
            .check(command(JLS, ["-j", self.name(), "-n", "--libxo=json"]))
            .await?;
        JailInfo::from_jls(&stdout_of(&output), self.name())
    }

    async fn remove_conf(&self) {
        match tokio::fs::remove_file(&self.conf_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %self.conf_path.display(), error = %err, "Could not delete jail.conf");
            }
        }
    }
}

#[async_trait]
impl Step for Jail {
    fn name(&self) -> &str {
        "jail"
    }

    async fn execute(&self) -> ForgeResult<()> {
        self.start().await
    }

    async fn compensate(&self) -> ForgeResult<()> {
        self.stop().await
    }
}
