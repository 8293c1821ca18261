//! Tap package installation into isolated virtual environments.

use crate::runner::exec_cmd;
use anyhow::{Context, Result};
use async_trait::async_trait;
use intake::config::SingerConfig;
use tracing::info;

/// Installs and upgrades tap packages.
///
/// [`TapBridge`](super::bridge::TapBridge) calls `install` at most once at a
/// time per tap.
#[async_trait]
pub trait TapInstaller: Send + Sync {
    /// Creates the tap's isolated runtime and installs the tap package into it.
    async fn install(&self, tap: &str) -> Result<()>;

    /// Upgrades an installed tap package in place.
    async fn upgrade(&self, tap: &str) -> Result<()>;
}

/// Installs every tap into `<venv_dir>/<tap>` with `python -m venv` and pip.
pub struct VenvInstaller {
    config: SingerConfig,
}

impl VenvInstaller {
    pub fn new(config: SingerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TapInstaller for VenvInstaller {
    async fn install(&self, tap: &str) -> Result<()> {
        let tap_dir = self.config.tap_dir(tap);
        let tap_dir_arg = tap_dir.to_string_lossy().into_owned();
        info!(tap = %tap, path = %tap_dir.display(), "Installing singer tap");

        exec_cmd(
            "venv",
            &self.config.python_exec_path,
            &["-m", "venv", tap_dir_arg.as_str()],
            self.config.venv_timeout(),
        )
        .await
        .with_context(|| format!("error creating singer python venv for [{}]", tap_dir.display()))?;

        exec_cmd(
            "pip upgrade",
            tap_dir.join("bin").join("python3"),
            &["-m", "pip", "install", "--upgrade", "pip"],
            self.config.pip_upgrade_timeout(),
        )
        .await
        .with_context(|| format!("error updating pip for [{}] env", tap_dir.display()))?;

        exec_cmd(
            "tap install",
            tap_dir.join("bin").join("pip3"),
            &["install", tap],
            self.config.install_timeout(),
        )
        .await
        .with_context(|| format!("error installing singer tap [{}]", tap))?;

        info!(tap = %tap, "Singer tap installed");
        Ok(())
    }

    async fn upgrade(&self, tap: &str) -> Result<()> {
        exec_cmd(
            "tap upgrade",
            self.config.tap_dir(tap).join("bin").join("pip3"),
            &["install", tap, "--upgrade"],
            self.config.install_timeout(),
        )
        .await
        .with_context(|| format!("error updating singer tap [{}]", tap))?;
        Ok(())
    }
}
