// End-to-end sync through a fake tap executable

#![cfg(unix)]

use anyhow::Result;
use intake::config::SingerConfig;
use intake::{Collection, Driver, Record, SourceConfig, SyncError, TimeInterval};
use intake_connectors::singer::{SingerDriver, TapBridge, TapConfigSource};
use serde_json::json;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

// Tests here write executables and then spawn them; running them one at a
// time keeps a concurrent fork from holding a script open for writing.
static SERIAL: Mutex<()> = Mutex::const_new(());

const FAKE_TAP: &str = r#"#!/bin/sh
resumed=false
for arg in "$@"; do
  case "$arg" in
    --discover)
      echo '{"streams":[{"tap_stream_id":"items","schema":{"properties":{}},"metadata":[{"breadcrumb":[],"metadata":{}}]}]}'
      exit 0
      ;;
    --state) resumed=true ;;
  esac
done
echo "starting sync" >&2
echo '{"type":"SCHEMA","stream":"items","schema":{"properties":{"id":{"type":"integer"}}},"key_properties":["id"]}'
echo '{"type":"RECORD","stream":"items","record":{"id":1}}'
echo '{"type":"RECORD","stream":"items","record":{"id":2}}'
echo "{\"type\":\"STATE\",\"value\":{\"resumed\":$resumed}}"
"#;

fn install_fake_tap(venv_dir: &Path, tap: &str, script: &str) {
    let bin = venv_dir.join(tap).join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let exe = bin.join(tap);
    std::fs::write(&exe, script).unwrap();
    std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn bridge(dir: &TempDir) -> Arc<TapBridge> {
    let config = SingerConfig {
        venv_dir: dir.path().to_path_buf(),
        ..SingerConfig::default()
    };
    Arc::new(TapBridge::new(config).unwrap())
}

fn fake_driver(dir: &TempDir, state: Option<serde_json::Value>) -> SingerDriver {
    let source = SourceConfig {
        source_id: "fake".to_string(),
        source_type: "singer".to_string(),
        config: json!({"tap": "tap-fake", "config": {"token": "secret"}, "state": state}),
    };
    let collection = Collection {
        name: "items".to_string(),
        kind: "stream".to_string(),
        table_name: Some("fake_items".to_string()),
        parameters: serde_json::Value::Null,
    };
    SingerDriver::new(bridge(dir), &source, collection).unwrap()
}

fn tmp_files(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path().join("tmp"))
        .map(|entries| entries.count())
        .unwrap_or(0)
}

/// Discovery, tap run, parse and checkpoint commit in one driver call; the
/// second call resumes from the committed checkpoint.
#[tokio::test]
async fn test_sync_with_discovered_catalog() {
    let _serial = SERIAL.lock().await;
    let dir = TempDir::new().unwrap();
    install_fake_tap(dir.path(), "tap-fake", FAKE_TAP);
    let driver = fake_driver(&dir, None);

    let mut batches: Vec<(Vec<Record>, usize, usize, usize)> = Vec::new();
    let mut loader = |objects: Vec<Record>, pos: usize, total: usize, percent: usize| -> Result<()> {
        batches.push((objects, pos, total, percent));
        Ok(())
    };
    driver
        .get_objects_for(&TimeInterval::all(), &mut loader)
        .await
        .unwrap();

    assert_eq!(batches.len(), 1);
    let (objects, pos, total, percent) = &batches[0];
    assert_eq!((*pos, *total, *percent), (0, 2, 100));
    assert_eq!(objects[0]["id"], json!(1));
    assert_eq!(objects[1]["id"], json!(2));
    assert_eq!(driver.state(), Some(json!({"resumed": false})));

    let output = driver.sync(driver.state().as_ref()).await.unwrap();
    assert_eq!(output.state, Some(json!({"resumed": true})));

    // generated config files are gone
    assert_eq!(tmp_files(&dir), 0);
}

/// A loader error comes back as-is and the checkpoint is not advanced.
#[tokio::test]
async fn test_loader_error_keeps_previous_checkpoint() {
    let _serial = SERIAL.lock().await;
    let dir = TempDir::new().unwrap();
    install_fake_tap(dir.path(), "tap-fake", FAKE_TAP);
    let driver = fake_driver(&dir, Some(json!({"bookmark": "2020-01-01"})));

    let mut loader = |_: Vec<Record>, _: usize, _: usize, _: usize| -> Result<()> {
        Err(anyhow::anyhow!("sink down"))
    };
    let err = driver
        .get_objects_for(&TimeInterval::all(), &mut loader)
        .await
        .unwrap_err();

    assert_eq!(format!("{:#}", err), "sink down");
    assert_eq!(driver.state(), Some(json!({"bookmark": "2020-01-01"})));
}

const NOISY_TAP: &str = r#"#!/bin/sh
for arg in "$@"; do
  if [ "$arg" = "--discover" ]; then
    echo '{"streams":[{"tap_stream_id":"items","schema":{"properties":{}},"metadata":[]}]}'
    exit 0
  fi
done
printf 'bad \377\376 bytes\n' >&2
i=0
while [ $i -lt 2000 ]; do
  echo "progress line $i with some padding to fill the pipe buffer" >&2
  i=$((i + 1))
done
echo '{"type":"SCHEMA","stream":"items","schema":{"properties":{"id":{"type":"integer"}}},"key_properties":["id"]}'
echo '{"type":"RECORD","stream":"items","record":{"id":7}}'
"#;

/// Non UTF-8 stderr followed by a lot more stderr does not break the sync.
#[tokio::test]
async fn test_sync_survives_invalid_utf8_on_stderr() {
    let _serial = SERIAL.lock().await;
    let dir = TempDir::new().unwrap();
    install_fake_tap(dir.path(), "tap-fake", NOISY_TAP);
    let driver = fake_driver(&dir, None);

    let mut loaded = Vec::new();
    let mut loader = |objects: Vec<Record>, _: usize, _: usize, _: usize| -> Result<()> {
        loaded = objects;
        Ok(())
    };
    driver
        .get_objects_for(&TimeInterval::all(), &mut loader)
        .await
        .unwrap();

    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0]["id"], json!(7));
}

/// A blank line on stdout aborts the sync with a protocol error.
#[tokio::test]
async fn test_blank_output_line_fails_sync() {
    let _serial = SERIAL.lock().await;
    let dir = TempDir::new().unwrap();
    let script = FAKE_TAP.replace("echo \"starting sync\" >&2\n", "echo \"starting sync\" >&2\necho ''\n");
    install_fake_tap(dir.path(), "tap-fake", &script);
    let driver = fake_driver(&dir, None);

    let err = driver.sync(None).await.unwrap_err();
    assert!(matches!(
        intake::error::classify(&err),
        Some(SyncError::Protocol(_))
    ));
    assert_eq!(tmp_files(&dir), 0);
}

const BROKEN_DISCOVERY_TAP: &str = r#"#!/bin/sh
echo boom >&2
echo '{"streams":[{"schema":{}}]}'
"#;

/// A malformed discovered catalog is a protocol error carrying the tap's
/// stderr, and the generated config file is still removed.
#[tokio::test]
async fn test_malformed_discovery_output() {
    let _serial = SERIAL.lock().await;
    let dir = TempDir::new().unwrap();
    install_fake_tap(dir.path(), "tap-fake", BROKEN_DISCOVERY_TAP);

    let err = bridge(&dir)
        .discover("tap-fake", &TapConfigSource::Inline(json!({"token": "secret"})))
        .await
        .unwrap_err();

    match intake::error::classify(&err) {
        Some(SyncError::Protocol(message)) => {
            assert!(message.contains("metadata"), "{}", message);
            assert!(message.contains("boom"), "{}", message);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(tmp_files(&dir), 0);
}
