//! Tap lifecycle manager.
//!
//! Tracks which taps are installed under the venv root, installs missing taps
//! in the background (at most one installer per tap at any time) and keeps the
//! last install error per tap so readiness checks can report it.
//!
//! The bridge is built once at startup and shared by reference (usually in an
//! `Arc`) with every driver that needs taps.

use super::discovery::{self, Catalog, TapConfigSource};
use super::installer::{TapInstaller, VenvInstaller};
use anyhow::Result;
use dashmap::DashSet;
use futures::FutureExt;
use intake::config::SingerConfig;
use intake::SyncError;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

/// Directory prefix identifying tap environments under the venv root.
const TAP_DIR_PREFIX: &str = "tap-";

/// Shared install bookkeeping, owned jointly by the bridge and its install tasks.
#[derive(Default)]
struct InstallState {
    installed: DashSet<String>,
    /// Claim tokens: a tap is present while exactly one installer runs for it.
    in_progress: DashSet<String>,
    errors: RwLock<HashMap<String, SyncError>>,
}

impl InstallState {
    fn last_error(&self, tap: &str) -> Option<SyncError> {
        self.errors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(tap)
            .cloned()
    }

    fn record_error(&self, tap: &str, err: SyncError) {
        self.errors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tap.to_string(), err);
    }

    fn mark_installed(&self, tap: &str) {
        self.errors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(tap);
        self.installed.insert(tap.to_string());
    }
}

/// Exclusive right to install one tap. Released on drop, on every exit path.
struct InstallClaim {
    state: Arc<InstallState>,
    tap: String,
}

impl InstallClaim {
    /// Claims `tap`, or returns `None` if another installer already holds it.
    fn acquire(state: &Arc<InstallState>, tap: &str) -> Option<Self> {
        if state.in_progress.insert(tap.to_string()) {
            Some(Self {
                state: Arc::clone(state),
                tap: tap.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for InstallClaim {
    fn drop(&mut self) {
        self.state.in_progress.remove(&self.tap);
    }
}

/// Tap lifecycle manager: installation, readiness, upgrades and discovery.
pub struct TapBridge {
    config: SingerConfig,
    installer: Arc<dyn TapInstaller>,
    state: Arc<InstallState>,
}

impl TapBridge {
    /// Creates a bridge that installs taps with [`VenvInstaller`].
    pub fn new(config: SingerConfig) -> Result<Self> {
        let installer = Arc::new(VenvInstaller::new(config.clone()));
        Self::with_installer(config, installer)
    }

    /// Creates a bridge with a custom installer.
    ///
    /// Taps already present under `venv_dir` are considered installed.
    pub fn with_installer(config: SingerConfig, installer: Arc<dyn TapInstaller>) -> Result<Self> {
        config.validate()?;

        let state = Arc::new(InstallState::default());
        for tap in scan_installed_taps(&config.venv_dir) {
            state.installed.insert(tap);
        }
        info!(
            venv_dir = %config.venv_dir.display(),
            installed = state.installed.len(),
            "Singer bridge initialized"
        );

        Ok(Self {
            config,
            installer,
            state,
        })
    }

    pub fn config(&self) -> &SingerConfig {
        &self.config
    }

    /// Returns `Ok(true)` if `tap` can be run now.
    ///
    /// Otherwise starts a background install (unless one is already running)
    /// and returns `Ok(false)`, or the last install error if the previous
    /// attempt failed. Callers poll until ready.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn is_tap_ready(&self, tap: &str) -> std::result::Result<bool, SyncError> {
        if self.state.installed.contains(tap) {
            return Ok(true);
        }

        self.ensure_tap(tap);

        if self.state.installed.contains(tap) {
            return Ok(true);
        }
        match self.state.last_error(tap) {
            Some(err) => Err(err),
            None => Ok(false),
        }
    }

    /// Polls [`is_tap_ready`](Self::is_tap_ready) until the tap is installed
    /// or `timeout` passes. On timeout the last install error, if any, is
    /// returned with the timeout as context.
    pub async fn wait_tap_ready(&self, tap: &str, poll: Duration, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let last_error = match self.is_tap_ready(tap) {
                Ok(true) => return Ok(()),
                Ok(false) => None,
                Err(err) => Some(err),
            };
            if tokio::time::Instant::now() >= deadline {
                let timed_out = SyncError::Timeout {
                    operation: format!("waiting for tap [{}] install", tap),
                    timeout,
                };
                return Err(match last_error {
                    Some(err) => anyhow::Error::from(err).context(timed_out.to_string()),
                    None => timed_out.into(),
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub fn is_installing(&self, tap: &str) -> bool {
        self.state.in_progress.contains(tap)
    }

    /// Last recorded install error for `tap`, if any.
    pub fn install_error(&self, tap: &str) -> Option<SyncError> {
        self.state.last_error(tap)
    }

    pub fn installed_taps(&self) -> Vec<String> {
        let mut taps: Vec<String> = self.state.installed.iter().map(|t| t.clone()).collect();
        taps.sort();
        taps
    }

    /// Upgrades the tap package synchronously. No-op unless `update_taps` is set.
    ///
    /// The error is returned directly and not cached.
    pub async fn update_tap(&self, tap: &str) -> Result<()> {
        if !self.config.update_taps {
            return Ok(());
        }
        info!(tap = %tap, "Updating singer tap");
        self.installer.upgrade(tap).await
    }

    /// Runs the tap in discovery mode and returns its catalog with every
    /// stream and metadata entry selected.
    pub async fn discover(&self, tap: &str, source: &TapConfigSource) -> Result<Catalog> {
        discovery::discover(&self.config, tap, source).await
    }

    /// Starts a background install for `tap` unless it is installed or being installed.
    fn ensure_tap(&self, tap: &str) {
        if !self.config.install_taps {
            self.state.installed.insert(tap.to_string());
            return;
        }
        if self.state.installed.contains(tap) {
            return;
        }

        let Some(claim) = InstallClaim::acquire(&self.state, tap) else {
            return;
        };
        // A previous installer may have finished between the check and the claim.
        if self.state.installed.contains(tap) {
            return;
        }

        let installer = Arc::clone(&self.installer);
        let state = Arc::clone(&self.state);
        let tap = tap.to_string();
        tokio::spawn(async move {
            let _claim = claim;

            let result = AssertUnwindSafe(installer.install(&tap))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("installer panicked")));

            match result {
                Ok(()) => state.mark_installed(&tap),
                Err(e) => {
                    error!(tap = %tap, error = %format!("{:#}", e), "Singer tap install failed");
                    let message = match e.downcast_ref::<SyncError>() {
                        Some(SyncError::Install { message, .. }) => message.clone(),
                        _ => format!("{:#}", e),
                    };
                    state.record_error(&tap, SyncError::Install { tap: tap.clone(), message });
                }
            }
        });
    }
}

fn scan_installed_taps(venv_dir: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(venv_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(venv_dir = %venv_dir.display(), error = %e, "Singer venv dir not readable, no taps preinstalled");
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| entry.file_name().to_str().map(|n| n.trim().to_string()))
        .filter(|name| name.starts_with(TAP_DIR_PREFIX))
        .collect()
}
