//! CLI command definitions and handlers.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};

use jailforge_common::{ForgeConfig, ForgeResult, HostExecutor};

use crate::manifest::Manifest;
use crate::provision::Provisioner;
use crate::registry::JailRegistry;

/// Jailforge - transactional FreeBSD jail provisioning
#[derive(Parser)]
#[command(name = "jailforge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (default: /usr/local/etc/jailforge.toml)
    #[arg(long, global = true, env = "JAILFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// ZFS pool, overrides the configuration file
    #[arg(long, global = true, env = "JAILFORGE_POOL")]
    pub pool: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Provision a jail from a manifest, run it until interrupted, then tear it down
    Start {
        /// Path to the YAML manifest
        manifest: PathBuf,
    },

    /// Manage image layers
    Layers {
        /// Layer action
        #[command(subcommand)]
        action: LayerCommands,
    },

    /// Manage named volumes
    Volumes {
        /// Volume action
        #[command(subcommand)]
        action: VolumeCommands,
    },

    /// Check that the configured pool exists
    Check,
}

/// Layer commands.
#[derive(Subcommand)]
pub enum LayerCommands {
    /// List image layers
    List,

    /// Export the changes of a layer as an archive
    Compress {
        /// Layer name
        name: String,

        /// Output directory (default: the archives directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Create a layer from an exported archive
    Import {
        /// Name of the new layer
        name: String,

        /// Archive produced by `layers compress`
        archive: PathBuf,

        /// Layer the archive was taken on top of
        #[arg(short, long)]
        parent: Option<String>,
    },
}

/// Volume commands.
#[derive(Subcommand)]
pub enum VolumeCommands {
    /// List named volumes
    List,
}

impl Cli {
    /// Configuration file plus command line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be read.
    pub fn load_config(&self) -> Result<ForgeConfig> {
        let config = match &self.config {
            Some(path) => ForgeConfig::load(path)
                .wrap_err_with(|| format!("Failed to load {}", path.display()))?,
            None => ForgeConfig::discover().wrap_err("Failed to load configuration")?,
        };
        Ok(match &self.pool {
            Some(pool) => config.with_pool(pool),
            None => config,
        })
    }

    /// Run the selected command.
    ///
    /// # Errors
    ///
    /// Returns the error of the failed command.
    pub async fn execute(self) -> Result<()> {
        let config = self.load_config()?;
        let provisioner = Provisioner::new(config, HostExecutor::new().as_executor(), JailRegistry::new());

        match self.command {
            Commands::Start { manifest } => {
                let manifest = Manifest::from_file(&manifest)?;
                let jail = provisioner
                    .provision(&manifest)
                    .await
                    .wrap_err_with(|| format!("Failed to provision jail {}", manifest.name))?;

                match jail.info() {
                    Some(info) => println!("Jail {} running (jid {})", jail.name(), info.jid),
                    None => println!("Jail {} running", jail.name()),
                }

                run_until_shutdown(tokio::signal::ctrl_c(), async {
                    println!("Stopping jail {}", jail.name());
                    provisioner.stop(jail.name()).await
                })
                .await
            }

            Commands::Layers { action } => {
                let layers = provisioner.images();
                match action {
                    LayerCommands::List => {
                        for name in layers.list()? {
                            println!("{name}");
                        }
                        Ok(())
                    }
                    LayerCommands::Compress { name, output } => {
                        let layer = layers.get(&name)?;
                        let dest = output.unwrap_or_else(|| provisioner.config().paths().archives());
                        tokio::fs::create_dir_all(&dest).await?;
                        let archive = layer
                            .compress(&dest, provisioner.config().archive_level)
                            .await
                            .wrap_err_with(|| format!("Failed to compress layer {name}"))?;
                        println!("{}", archive.display());
                        Ok(())
                    }
                    LayerCommands::Import {
                        name,
                        archive,
                        parent,
                    } => {
                        layers.ensure_root()?;
                        let layer = layers.create(&name, parent.as_deref())?;
                        match layer.decompress(&archive).await {
                            Ok(diff) => {
                                println!("Layer {name} imported ({} entries)", diff.len());
                                Ok(())
                            }
                            Err(err) => {
                                if let Err(cleanup) = layer.destroy() {
                                    tracing::warn!(layer = %name, error = %cleanup, "Could not remove incomplete layer");
                                }
                                Err(err).wrap_err_with(|| format!("Failed to import layer {name}"))
                            }
                        }
                    }
                }
            }

            Commands::Volumes {
                action: VolumeCommands::List,
            } => {
                for name in provisioner.volumes().list()? {
                    println!("{name}");
                }
                Ok(())
            }

            Commands::Check => {
                provisioner.check()?;
                println!("Pool {} is available", provisioner.config().pool);
                Ok(())
            }
        }
    }
}

/// Wait for `shutdown`, then run `teardown` whether or not waiting worked.
async fn run_until_shutdown<S, T>(shutdown: S, teardown: T) -> Result<()>
where
    S: Future<Output = std::io::Result<()>>,
    T: Future<Output = ForgeResult<()>>,
{
    let signal = shutdown.await;
    if let Err(err) = &signal {
        tracing::warn!(error = %err, "Could not wait for Ctrl-C, stopping now");
    }
    teardown.await?;
    signal.wrap_err("Failed to listen for Ctrl-C")
}

#[cfg(test)]
mod tests {
    use super::*;
    use jailforge_common::ForgeError;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn teardown_runs_when_signal_handler_fails() {
        let stopped = AtomicBool::new(false);
        let result = run_until_shutdown(
            std::future::ready(Err(std::io::Error::other("no signal handler"))),
            async {
                stopped.store(true, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert!(result.is_err());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn teardown_error_is_reported() {
        let result = run_until_shutdown(std::future::ready(Ok(())), async {
            Err(ForgeError::JailNotFound {
                name: "web".to_string(),
            })
        })
        .await;
        assert!(result.unwrap_err().to_string().contains("web"));
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn pool_flag_overrides_config() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("jailforge.toml");
        std::fs::write(&path, "pool = \"data\"\n").unwrap();

        let cli = Cli::parse_from(["jailforge", "--config", path.to_str().unwrap(), "check"]);
        assert_eq!(cli.load_config().unwrap().pool, "data");

        let cli = Cli::parse_from([
            "jailforge",
            "--config",
            path.to_str().unwrap(),
            "--pool",
            "tank",
            "layers",
            "list",
        ]);
        assert_eq!(cli.load_config().unwrap().pool, "tank");
        assert!(matches!(
            cli.command,
            Commands::Layers {
                action: LayerCommands::List
            }
        ));
    }
}
