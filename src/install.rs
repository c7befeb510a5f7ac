use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

use crate::{InstallConfig, SupervisorError};

/// Ensures the tunnel CLI is present before the first spawn attempt.
#[async_trait]
pub trait Installer: Send + Sync {
    /// Check-then-install. Runs at most once per supervisor invocation;
    /// returns immediately when the dependency is already available.
    async fn ensure_available(&mut self) -> Result<(), SupervisorError>;
}

/// Real installer: probes PATH for the relay binary and, when absent, runs
/// the configured package-fetch command synchronously with inherited stdio.
pub struct CliInstaller {
    config: InstallConfig,
    ran: bool,
}

impl CliInstaller {
    pub fn new(config: InstallConfig) -> Self {
        Self { config, ran: false }
    }
}

#[async_trait]
impl Installer for CliInstaller {
    async fn ensure_available(&mut self) -> Result<(), SupervisorError> {
        if self.ran {
            return Ok(());
        }
        self.ran = true;

        if self.config.skip {
            info!("dependency check skipped by configuration");
            return Ok(());
        }

        if which::which(&self.config.probe).is_ok() {
            info!("'{}' already available on PATH", self.config.probe);
            return Ok(());
        }

        let fetch = &self.config.fetch;
        info!(
            "'{}' not found, installing via '{} {}'",
            self.config.probe,
            fetch.command,
            fetch.args.join(" ")
        );

        let mut cmd = Command::new(&fetch.command);
        cmd.args(&fetch.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = &fetch.working_directory {
            cmd.current_dir(dir);
        }

        let status = cmd
            .status()
            .await
            .map_err(|source| SupervisorError::InstallSpawn {
                command: fetch.command.clone(),
                source,
            })?;

        if status.success() {
            info!("dependency installed successfully");
            Ok(())
        } else {
            warn!("dependency install failed: {}", status);
            Err(SupervisorError::InstallFailed {
                code: status.code(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommandSpec;

    #[tokio::test]
    async fn skip_short_circuits_probe_and_fetch() {
        let mut installer = CliInstaller::new(InstallConfig {
            probe: "definitely-not-a-real-binary".to_string(),
            fetch: CommandSpec::new("false", Vec::<&str>::new()),
            skip: true,
        });
        assert!(installer.ensure_available().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn present_probe_skips_fetch() {
        let mut installer = CliInstaller::new(InstallConfig {
            probe: "sh".to_string(),
            // Would fail if ever run.
            fetch: CommandSpec::new("false", Vec::<&str>::new()),
            skip: false,
        });
        assert!(installer.ensure_available().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_fetch_surfaces_exit_code() {
        let mut installer = CliInstaller::new(InstallConfig {
            probe: "portlift-no-such-binary".to_string(),
            fetch: CommandSpec::new("sh", ["-c", "exit 4"]),
            skip: false,
        });
        match installer.ensure_available().await {
            Err(SupervisorError::InstallFailed { code }) => assert_eq!(code, Some(4)),
            other => panic!("expected InstallFailed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_at_most_once() {
        let mut installer = CliInstaller::new(InstallConfig {
            probe: "portlift-no-such-binary".to_string(),
            fetch: CommandSpec::new("sh", ["-c", "exit 4"]),
            skip: false,
        });
        assert!(installer.ensure_available().await.is_err());
        // Second call is a no-op even after failure: the run is already
        // fatal at the supervisor level.
        assert!(installer.ensure_available().await.is_ok());
    }
}
