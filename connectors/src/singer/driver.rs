//! Tap-backed driver: readiness → update → discovery → tap run → parse.

use super::bridge::TapBridge;
use super::discovery::{Catalog, TapConfigSource};
use super::files::GeneratedFile;
use super::parser::{parse_output, OutputRepresentation};
use crate::runner::{check_status, render_command};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use intake::config::SingerConfig;
use intake::driver::collection_meta_key;
use intake::{Collection, Driver, ObjectsLoader, SourceConfig, SyncError, TimeInterval};
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

pub const SINGER_TYPE: &str = "singer";

/// Stderr lines kept for error reporting after a tap exits.
const STDERR_TAIL_LINES: usize = 50;

/// Source blob of a tap-backed source.
#[derive(Clone, Debug, Deserialize)]
pub struct SingerSourceConfig {
    /// Tap package name, e.g. `tap-github`.
    pub tap: String,
    /// Tap configuration passed with `-c`.
    #[serde(default)]
    pub config: Value,
    /// Fixed catalog. Discovered on every sync when absent.
    #[serde(default)]
    pub catalog: Option<Value>,
    /// Initial checkpoint.
    #[serde(default)]
    pub state: Option<Value>,
}

impl SingerSourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tap.trim().is_empty() {
            return Err(SyncError::Configuration("singer 'tap' is required".to_string()).into());
        }
        Ok(())
    }
}

/// Driver for one stream of a tap. The collection name is the stream name.
pub struct SingerDriver {
    bridge: Arc<TapBridge>,
    source: SingerSourceConfig,
    collection: Collection,
    state: Mutex<Option<Value>>,
}

impl SingerDriver {
    pub fn new(bridge: Arc<TapBridge>, source_config: &SourceConfig, collection: Collection) -> Result<Self> {
        let source: SingerSourceConfig = source_config.parse()?;
        source.validate()?;
        let state = Mutex::new(source.state.clone());
        Ok(Self {
            bridge,
            source,
            collection,
            state,
        })
    }

    pub fn tap(&self) -> &str {
        &self.source.tap
    }

    /// Checkpoint the next sync resumes from.
    pub fn state(&self) -> Option<Value> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Runs the tap from `state` and returns all of its parsed output.
    pub async fn sync(&self, state: Option<&Value>) -> Result<OutputRepresentation> {
        let tap = self.tap();
        match self.bridge.is_tap_ready(tap) {
            Ok(true) => {}
            Ok(false) => {
                return Err(SyncError::TapNotReady {
                    tap: tap.to_string(),
                    cause: None,
                }
                .into())
            }
            Err(e) => {
                return Err(SyncError::TapNotReady {
                    tap: tap.to_string(),
                    cause: Some(e.to_string()),
                }
                .into())
            }
        }

        if let Err(e) = self.bridge.update_tap(tap).await {
            warn!(tap = %tap, error = %format!("{:#}", e), "Singer tap update failed, syncing with installed version");
        }

        let catalog = match &self.source.catalog {
            Some(raw) => serde_json::from_value::<Catalog>(raw.clone()).map_err(|e| {
                SyncError::Configuration(format!("invalid catalog for tap [{}]: {}", tap, e))
            })?,
            None => {
                self.bridge
                    .discover(tap, &TapConfigSource::Inline(self.source.config.clone()))
                    .await?
            }
        };

        let singer = self.bridge.config();
        let tmp_dir = singer.tmp_dir();
        let config_file = GeneratedFile::write_json(&tmp_dir, &self.source.config)?;
        let catalog_file = GeneratedFile::write_json(&tmp_dir, &catalog)?;
        let state_file = state
            .map(|s| GeneratedFile::write_json(&tmp_dir, s))
            .transpose()?;

        run_tap(
            singer,
            tap,
            config_file.path(),
            catalog_file.path(),
            state_file.as_ref().map(GeneratedFile::path),
        )
        .await
    }
}

#[async_trait]
impl Driver for SingerDriver {
    fn source_type(&self) -> &str {
        SINGER_TYPE
    }

    fn collection_table(&self) -> String {
        self.collection.table_name()
    }

    fn collection_meta_key(&self) -> String {
        collection_meta_key(&self.collection)
    }

    fn refresh_window(&self) -> Result<Duration> {
        Ok(Duration::from_secs(24 * 60 * 60))
    }

    async fn all_available_intervals(&self) -> Result<Vec<TimeInterval>> {
        Ok(vec![TimeInterval::all()])
    }

    async fn get_objects_for(
        &self,
        _interval: &TimeInterval,
        loader: &mut ObjectsLoader<'_>,
    ) -> Result<()> {
        let state = self.state();
        let mut output = self.sync(state.as_ref()).await?;

        let objects = output
            .streams
            .remove(&self.collection.name)
            .map(|s| s.objects)
            .unwrap_or_default();
        let total = objects.len();
        info!(tap = %self.tap(), stream = %self.collection.name, records = total, "Singer sync finished");

        loader(objects, 0, total, 100)?;

        // committed only after the loader accepted the batch
        if let Some(next) = output.state {
            *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(next);
        }
        Ok(())
    }
}

/// Runs `<tap> -c <config> --catalog <catalog> [--state <state>]` and parses
/// its stdout. The process is killed if parsing fails or `sync_timeout` passes.
pub async fn run_tap(
    config: &SingerConfig,
    tap: &str,
    config_path: &Path,
    catalog_path: &Path,
    state_path: Option<&Path>,
) -> Result<OutputRepresentation> {
    let program = config.tap_executable(tap);
    let mut args = vec![
        "-c".to_string(),
        config_path.to_string_lossy().into_owned(),
        "--catalog".to_string(),
        catalog_path.to_string_lossy().into_owned(),
    ];
    if let Some(state_path) = state_path {
        args.push("--state".to_string());
        args.push(state_path.to_string_lossy().into_owned());
    }
    let command_line = render_command(&program, &args);

    let mut child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SyncError::Connection(format!("failed to start [{}]: {}", command_line, e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout of tap [{}] is not piped", tap))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr of tap [{}] is not piped", tap))?;
    let stderr_task = tokio::spawn(forward_stderr(tap.to_string(), stderr));

    info!(tap = %tap, "Singer sync started");
    let run = async {
        let output = parse_output(BufReader::new(stdout))
            .await
            .with_context(|| format!("Error parsing output of tap [{}]", tap))?;
        let status = child
            .wait()
            .await
            .with_context(|| format!("Error waiting for tap [{}]", tap))?;
        Ok::<_, anyhow::Error>((output, status))
    };

    let finished = tokio::time::timeout(config.sync_timeout(), run).await;
    let (output, status) = match finished {
        Ok(Ok(finished)) => finished,
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(e);
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(SyncError::Timeout {
                operation: format!("sync [{}]", command_line),
                timeout: config.sync_timeout(),
            }
            .into());
        }
    };

    let stderr_tail = stderr_task.await.unwrap_or_default();
    check_status(&command_line, status, &stderr_tail)?;

    info!(
        tap = %tap,
        streams = output.streams.len(),
        records = output.record_count(),
        "Singer tap exited"
    );
    Ok(output)
}

/// Logs tap stderr line by line and returns the last lines.
///
/// Invalid UTF-8 is replaced, not rejected. The pipe is drained until EOF
/// even after a read error so the tap never blocks or dies on a closed pipe.
async fn forward_stderr<R>(tap: String, stderr: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut last = VecDeque::with_capacity(STDERR_TAIL_LINES);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                info!(tap = %tap, "[tap] {}", line);
                if last.len() == STDERR_TAIL_LINES {
                    last.pop_front();
                }
                last.push_back(line);
            }
            Err(e) => {
                warn!(tap = %tap, error = %e, "Failed to read tap stderr, discarding the rest");
                if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    warn!(tap = %tap, error = %e, "Failed to drain tap stderr");
                }
                break;
            }
        }
    }
    Vec::from(last).join("\n")
}
