use crate::SyncError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Complete extraction configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IntakeConfig {
    #[serde(default)]
    pub singer: SingerConfig,
    #[serde(default)]
    pub firebase: FirebaseSettings,
}

/// Tap runtime configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SingerConfig {
    /// Interpreter used to create per-tap virtual environments
    #[serde(default = "default_python_exec_path")]
    pub python_exec_path: String,
    /// Root directory holding one virtual environment per tap
    #[serde(default = "default_venv_dir")]
    pub venv_dir: PathBuf,
    /// Install missing taps on first use. When false every tap counts as installed.
    #[serde(default = "default_true")]
    pub install_taps: bool,
    /// Upgrade the tap package before each sync
    #[serde(default)]
    pub update_taps: bool,
    #[serde(default = "default_venv_timeout")]
    pub venv_timeout_secs: u64,
    #[serde(default = "default_venv_timeout")]
    pub pip_upgrade_timeout_secs: u64,
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_discover_timeout")]
    pub discover_timeout_secs: u64,
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,
}

fn default_python_exec_path() -> String {
    "python3".to_string()
}

fn default_venv_dir() -> PathBuf {
    PathBuf::from("/var/lib/intake/venv")
}

fn default_true() -> bool {
    true
}

fn default_venv_timeout() -> u64 {
    600
}

fn default_install_timeout() -> u64 {
    1200
}

fn default_discover_timeout() -> u64 {
    120
}

fn default_sync_timeout() -> u64 {
    3600
}

impl Default for SingerConfig {
    fn default() -> Self {
        Self {
            python_exec_path: default_python_exec_path(),
            venv_dir: default_venv_dir(),
            install_taps: true,
            update_taps: false,
            venv_timeout_secs: default_venv_timeout(),
            pip_upgrade_timeout_secs: default_venv_timeout(),
            install_timeout_secs: default_install_timeout(),
            discover_timeout_secs: default_discover_timeout(),
            sync_timeout_secs: default_sync_timeout(),
        }
    }
}

impl SingerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.python_exec_path.trim().is_empty() {
            return Err(SyncError::Configuration(
                "singer python exec path can't be empty".to_string(),
            )
            .into());
        }
        if self.venv_dir.as_os_str().is_empty() {
            return Err(
                SyncError::Configuration("singer venv dir can't be empty".to_string()).into(),
            );
        }
        Ok(())
    }

    /// Directory for per-invocation generated files.
    pub fn tmp_dir(&self) -> PathBuf {
        self.venv_dir.join("tmp")
    }

    pub fn tap_dir(&self, tap: &str) -> PathBuf {
        self.venv_dir.join(tap)
    }

    /// Tap entrypoint inside its virtual environment.
    pub fn tap_executable(&self, tap: &str) -> PathBuf {
        self.tap_dir(tap).join("bin").join(tap)
    }

    pub fn venv_timeout(&self) -> Duration {
        Duration::from_secs(self.venv_timeout_secs)
    }

    pub fn pip_upgrade_timeout(&self) -> Duration {
        Duration::from_secs(self.pip_upgrade_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn discover_timeout(&self) -> Duration {
        Duration::from_secs(self.discover_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

/// Document-store driver tuning
#[derive(Debug, Clone, Deserialize)]
pub struct FirebaseSettings {
    /// Documents fetched per page at each traversal level
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Deadline for paginating one traversal level
    #[serde(default = "default_page_timeout")]
    pub page_timeout_secs: u64,
    /// Deadline for listing all principals
    #[serde(default = "default_users_timeout")]
    pub users_timeout_secs: u64,
}

fn default_page_size() -> usize {
    100
}

fn default_page_timeout() -> u64 {
    3600
}

fn default_users_timeout() -> u64 {
    300
}

impl Default for FirebaseSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            page_timeout_secs: default_page_timeout(),
            users_timeout_secs: default_users_timeout(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<IntakeConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: IntakeConfig = toml::from_str(&contents)
        .map_err(|e| SyncError::Configuration(format!("{}: {}", path.display(), e)))?;
    config.singer.validate()?;
    Ok(config)
}

/// Like [`load_config`], but a missing file yields the defaults.
pub fn load_config_or_default(path: impl AsRef<Path>) -> Result<IntakeConfig> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(IntakeConfig::default());
    }
    load_config(path)
}
