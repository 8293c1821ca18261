use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::error;

/// A uniquely named JSON file in the tap temp dir, removed when dropped.
#[derive(Debug)]
pub struct GeneratedFile {
    path: PathBuf,
}

impl GeneratedFile {
    /// Serializes `value` into `<tmp_dir>/<uuid>.json`, creating `tmp_dir` if needed.
    pub fn write_json<T: Serialize + ?Sized>(tmp_dir: &Path, value: &T) -> Result<Self> {
        std::fs::create_dir_all(tmp_dir)
            .with_context(|| format!("Error creating singer tmp dir {}", tmp_dir.display()))?;

        let path = tmp_dir.join(format!("{}.json", uuid::Uuid::new_v4().simple()));
        let body = serde_json::to_vec(value).context("Error serializing generated singer file")?;
        std::fs::write(&path, body)
            .with_context(|| format!("Error writing generated singer file {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for GeneratedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!(path = %self.path.display(), error = %e, "Error deleting generated singer file");
            }
        }
    }
}
