//! Driver registry - maps a source type tag to its driver.

use crate::firebase::{self, FirebaseDriver, FIREBASE_TYPE};
use crate::singer::{SingerDriver, TapBridge, SINGER_TYPE};
use anyhow::Result;
use intake::config::FirebaseSettings;
use intake::{Collection, Driver, SourceConfig, SyncError};
use std::sync::Arc;

/// Source types this build can sync.
pub fn supported_types() -> Vec<&'static str> {
    vec![FIREBASE_TYPE, SINGER_TYPE]
}

/// Constructs the driver for one collection of a source.
///
/// Tap-backed drivers share `bridge`, so installs are tracked once per process.
pub fn create_driver(
    source_config: &SourceConfig,
    collection: Collection,
    bridge: &Arc<TapBridge>,
    firebase_settings: &FirebaseSettings,
) -> Result<Box<dyn Driver>> {
    match source_config.source_type.as_str() {
        FIREBASE_TYPE => Ok(Box::new(FirebaseDriver::new(
            source_config,
            collection,
            firebase_settings.clone(),
        )?)),
        SINGER_TYPE => Ok(Box::new(SingerDriver::new(
            Arc::clone(bridge),
            source_config,
            collection,
        )?)),
        other => Err(unsupported(other).into()),
    }
}

/// Checks a source's credentials without building a driver.
///
/// For tap sources this starts the install if needed and fails with
/// [`SyncError::TapNotReady`] until the tap can run.
pub async fn test_connection(source_config: &SourceConfig, bridge: &TapBridge) -> Result<()> {
    match source_config.source_type.as_str() {
        FIREBASE_TYPE => firebase::test_connection(source_config).await,
        SINGER_TYPE => {
            let source: crate::singer::SingerSourceConfig = source_config.parse()?;
            source.validate()?;
            match bridge.is_tap_ready(&source.tap) {
                Ok(true) => Ok(()),
                Ok(false) => Err(SyncError::TapNotReady {
                    tap: source.tap,
                    cause: None,
                }
                .into()),
                Err(e) => Err(SyncError::TapNotReady {
                    tap: source.tap,
                    cause: Some(e.to_string()),
                }
                .into()),
            }
        }
        other => Err(unsupported(other).into()),
    }
}

fn unsupported(source_type: &str) -> SyncError {
    SyncError::Configuration(format!(
        "unsupported source type [{}], expected one of {:?}",
        source_type,
        supported_types()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use intake::config::SingerConfig;
    use mockito::Server;
    use serde_json::json;
    use tempfile::TempDir;

    fn bridge(dir: &TempDir) -> Arc<TapBridge> {
        let config = SingerConfig {
            venv_dir: dir.path().to_path_buf(),
            install_taps: false,
            ..SingerConfig::default()
        };
        Arc::new(TapBridge::new(config).unwrap())
    }

    fn collection(kind: &str, parameters: serde_json::Value) -> Collection {
        Collection {
            name: "orders".to_string(),
            kind: kind.to_string(),
            table_name: None,
            parameters,
        }
    }

    #[test]
    fn test_create_known_drivers() {
        let dir = TempDir::new().unwrap();
        let bridge = bridge(&dir);

        let firebase_source = SourceConfig {
            source_id: "fb".to_string(),
            source_type: FIREBASE_TYPE.to_string(),
            config: json!({"project_id": "demo", "access_token": "t"}),
        };
        let driver = create_driver(
            &firebase_source,
            collection("firestore", json!({"collection": "orders"})),
            &bridge,
            &FirebaseSettings::default(),
        )
        .unwrap();
        assert_eq!(driver.source_type(), FIREBASE_TYPE);

        let singer_source = SourceConfig {
            source_id: "gh".to_string(),
            source_type: SINGER_TYPE.to_string(),
            config: json!({"tap": "tap-github", "config": {}}),
        };
        let driver = create_driver(
            &singer_source,
            collection("stream", serde_json::Value::Null),
            &bridge,
            &FirebaseSettings::default(),
        )
        .unwrap();
        assert_eq!(driver.source_type(), SINGER_TYPE);
        assert_eq!(driver.collection_meta_key(), "orders_orders");
    }

    #[test]
    fn test_unknown_source_type() {
        let dir = TempDir::new().unwrap();
        let source = SourceConfig {
            source_id: "x".to_string(),
            source_type: "mysql".to_string(),
            config: json!({}),
        };
        let err = create_driver(
            &source,
            collection("table", json!({})),
            &bridge(&dir),
            &FirebaseSettings::default(),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("mysql"));
    }

    struct SlowInstaller;

    #[async_trait::async_trait]
    impl crate::singer::TapInstaller for SlowInstaller {
        async fn install(&self, _tap: &str) -> Result<()> {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            Ok(())
        }

        async fn upgrade(&self, _tap: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_singer_connection_check_while_installing() {
        let dir = TempDir::new().unwrap();
        let config = SingerConfig {
            venv_dir: dir.path().to_path_buf(),
            ..SingerConfig::default()
        };
        let bridge = TapBridge::with_installer(config, Arc::new(SlowInstaller)).unwrap();
        let source = SourceConfig {
            source_id: "gh".to_string(),
            source_type: SINGER_TYPE.to_string(),
            config: json!({"tap": "tap-github"}),
        };

        let err = test_connection(&source, &bridge).await.unwrap_err();
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::TapNotReady { tap, cause }) => {
                assert_eq!(tap, "tap-github");
                assert!(cause.is_none());
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(bridge.is_installing("tap-github"));

        // installs disabled: every tap is ready
        let ready = TapBridge::new(SingerConfig {
            venv_dir: dir.path().to_path_buf(),
            install_taps: false,
            ..SingerConfig::default()
        })
        .unwrap();
        test_connection(&source, &ready).await.unwrap();
    }

    #[tokio::test]
    async fn test_firebase_connection_check() {
        let mut server = Server::new_async().await;
        let _ok = server
            .mock("GET", "/v1/projects/demo/accounts:batchGet")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{}")
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let source = SourceConfig {
            source_id: "fb".to_string(),
            source_type: FIREBASE_TYPE.to_string(),
            config: json!({
                "project_id": "demo",
                "access_token": "t",
                "auth_base_url": server.url(),
            }),
        };
        test_connection(&source, &bridge(&dir)).await.unwrap();
    }
}
