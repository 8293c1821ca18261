use anyhow::{bail, Context, Result};
use intake::config::load_config_or_default;
use intake::SourceConfig;
use intake_connectors::singer::{SingerDriver, TapBridge, TapConfigSource, SINGER_TYPE};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const USAGE: &str = "usage:
  intake discover <tap> <config.json>
  intake sync <tap> <config.json> [state.json]
  intake ready <tap>";

const READY_POLL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "intake_connectors=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::var("INTAKE_CONFIG").unwrap_or_else(|_| "intake.toml".to_string());
    let config = load_config_or_default(&config_path)?;
    info!(config = %config_path, venv_dir = %config.singer.venv_dir.display(), "Configuration loaded");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let bridge = Arc::new(TapBridge::new(config.singer.clone())?);

    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["discover", tap, config_file] => {
            wait_ready(&bridge, tap).await?;
            let catalog = bridge
                .discover(tap, &TapConfigSource::Path(PathBuf::from(config_file)))
                .await?;
            println!("{}", serde_json::to_string_pretty(&catalog)?);
        }
        ["sync", tap, config_file, rest @ ..] if rest.len() <= 1 => {
            wait_ready(&bridge, tap).await?;
            let state = rest.first().map(|p| read_json(Path::new(p))).transpose()?;
            let source = SourceConfig {
                source_id: tap.to_string(),
                source_type: SINGER_TYPE.to_string(),
                config: json!({
                    "tap": tap,
                    "config": read_json(Path::new(config_file))?,
                }),
            };
            let collection = intake::Collection {
                name: tap.to_string(),
                kind: SINGER_TYPE.to_string(),
                table_name: None,
                parameters: Value::Null,
            };
            let driver = SingerDriver::new(Arc::clone(&bridge), &source, collection)?;
            let output = driver.sync(state.as_ref()).await?;

            let mut streams: Vec<_> = output
                .streams
                .iter()
                .map(|(name, stream)| (name.clone(), stream.objects.len()))
                .collect();
            streams.sort();
            for (name, count) in &streams {
                println!("{}\t{}", name, count);
            }
            println!("{}", serde_json::to_string(&output.state.unwrap_or(Value::Null))?);
        }
        ["ready", tap] => match bridge.is_tap_ready(tap) {
            Ok(true) => println!("{} ready", tap),
            Ok(false) => println!("{} installing", tap),
            Err(e) => println!("{} failed: {}", tap, e),
        },
        _ => bail!("{}", USAGE),
    }

    Ok(())
}

async fn wait_ready(bridge: &TapBridge, tap: &str) -> Result<()> {
    let limit = bridge.config().install_timeout() + bridge.config().venv_timeout();
    bridge.wait_tap_ready(tap, READY_POLL, limit).await
}

fn read_json(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}
