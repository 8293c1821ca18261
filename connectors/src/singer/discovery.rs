//! Catalog discovery: runs `<tap> -c <config> --discover` and force-selects
//! every stream in the returned catalog.

use super::files::GeneratedFile;
use crate::runner::{exec_cmd, tail};
use anyhow::{Context, Result};
use intake::config::SingerConfig;
use intake::SyncError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::info;

const OUTPUT_PREVIEW_BYTES: usize = 2 * 1024;

/// Tap configuration: either a file on disk or an inline JSON blob that is
/// written to a generated file for the duration of the call.
#[derive(Clone, Debug)]
pub enum TapConfigSource {
    Path(PathBuf),
    Inline(Value),
}

/// Discovery-time description of a tap's streams.
///
/// Unknown keys are preserved so the catalog can be handed back to the tap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<CatalogStream>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogStream {
    /// JSON-schema of the stream; carries the stream-level `selected` flag.
    pub schema: Map<String, Value>,
    /// Breadcrumb metadata entries, each `{"breadcrumb": [...], "metadata": {...}}`.
    pub metadata: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CatalogStream {
    /// `tap_stream_id`, falling back to `stream`.
    pub fn stream_id(&self) -> Option<&str> {
        self.extra
            .get("tap_stream_id")
            .or_else(|| self.extra.get("stream"))
            .and_then(Value::as_str)
    }

    pub fn is_selected(&self) -> bool {
        self.schema.get("selected").and_then(Value::as_bool) == Some(true)
    }

    /// Sets `selected: true` on the schema and inside every metadata entry.
    pub fn select(&mut self) {
        self.schema.insert("selected".to_string(), Value::Bool(true));
        for entry in self.metadata.iter_mut() {
            if let Some(inner) = entry.get_mut("metadata").and_then(Value::as_object_mut) {
                inner.insert("selected".to_string(), Value::Bool(true));
            }
        }
    }
}

impl Catalog {
    /// Parses and validates catalog JSON. Every stream needs `schema` and `metadata`.
    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Overrides whatever the tap proposed: everything discovered is synced.
    pub fn select_all(&mut self) {
        for stream in self.streams.iter_mut() {
            stream.select();
        }
    }

    pub fn stream_ids(&self) -> Vec<&str> {
        self.streams.iter().filter_map(CatalogStream::stream_id).collect()
    }
}

/// Runs discovery for `tap` and returns its catalog with all streams selected.
///
/// A generated config file is removed on every exit path.
pub async fn discover(config: &SingerConfig, tap: &str, source: &TapConfigSource) -> Result<Catalog> {
    let (config_path, _generated) = match source {
        TapConfigSource::Path(path) => (path.clone(), None),
        TapConfigSource::Inline(value) => {
            let file = GeneratedFile::write_json(&config.tmp_dir(), value)?;
            (file.path().to_path_buf(), Some(file))
        }
    };
    let config_arg = config_path.to_string_lossy().into_owned();

    info!(tap = %tap, "Running singer discovery");
    let output = exec_cmd(
        "discover",
        config.tap_executable(tap),
        &["-c", config_arg.as_str(), "--discover"],
        config.discover_timeout(),
    )
    .await
    .with_context(|| format!("Error singer --discover for tap [{}]", tap))?;

    let mut catalog = Catalog::from_slice(&output.stdout).map_err(|e| {
        SyncError::Protocol(format!(
            "malformed discovered catalog of tap [{}] {}: {}. stderr: {}",
            tap,
            tail(&String::from_utf8_lossy(&output.stdout), OUTPUT_PREVIEW_BYTES),
            e,
            tail(&output.stderr, OUTPUT_PREVIEW_BYTES)
        ))
    })?;

    catalog.select_all();
    info!(tap = %tap, streams = catalog.streams.len(), "Singer catalog discovered");
    Ok(catalog)
}
