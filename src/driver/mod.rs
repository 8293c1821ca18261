//! Driver contract every source connector implements.
//!
//! The orchestrator picks an interval from [`Driver::all_available_intervals`]
//! and calls [`Driver::get_objects_for`], which hands extracted records to an
//! [`ObjectsLoader`] callback. A loader error aborts the sync and is returned
//! to the caller as-is.

pub mod interval;

pub use interval::{Granularity, TimeInterval};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One extracted object: ordered field name → JSON value.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Progress callback: `(objects, position, total, percent)`.
pub type ObjectsLoader<'a> = dyn FnMut(Vec<Record>, usize, usize, usize) -> Result<()> + Send + 'a;

/// Source configuration: a type tag plus an opaque configuration blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl SourceConfig {
    /// Deserializes the opaque blob into a driver-specific config struct.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        parse_blob(&self.config, &format!("source [{}] config", self.source_id))
    }
}

/// A named feed within a source. `kind` selects the driver variant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl Collection {
    /// Destination table: the explicit table name, or the collection name.
    pub fn table_name(&self) -> String {
        match &self.table_name {
            Some(t) if !t.trim().is_empty() => t.clone(),
            _ => self.name.clone(),
        }
    }

    pub fn parse_parameters<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        parse_blob(
            &self.parameters,
            &format!("collection [{}] parameters", self.name),
        )
    }
}

fn parse_blob<T: serde::de::DeserializeOwned>(blob: &serde_json::Value, what: &str) -> Result<T> {
    serde_json::from_value(blob.clone())
        .map_err(|e| crate::SyncError::Configuration(format!("invalid {}: {}", what, e)).into())
}

/// Capability set of a source connector.
///
/// Concurrent `get_objects_for` calls on one instance are not supported;
/// the orchestrator serializes syncs per source.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Source type tag (e.g. `"firebase"`, `"singer"`).
    fn source_type(&self) -> &str;

    /// Destination table for this collection.
    fn collection_table(&self) -> String;

    /// Stable key under which the orchestrator stores checkpoints.
    fn collection_meta_key(&self) -> String;

    /// How long a synced interval stays fresh before it is re-synced.
    fn refresh_window(&self) -> Result<Duration>;

    /// Intervals the orchestrator may ask for.
    async fn all_available_intervals(&self) -> Result<Vec<TimeInterval>>;

    /// Extracts objects for `interval`, passing them to `loader`.
    async fn get_objects_for(
        &self,
        interval: &TimeInterval,
        loader: &mut ObjectsLoader<'_>,
    ) -> Result<()>;

    /// Releases collaborator connections.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Meta key shared by all drivers: `<collection name>_<table>`.
pub fn collection_meta_key(collection: &Collection) -> String {
    format!("{}_{}", collection.name, collection.table_name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncError;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_table_name_fallback() {
        let mut collection: Collection = serde_json::from_value(json!({
            "name": "orders",
            "type": "firestore",
            "parameters": {"collection": "orders"}
        }))
        .unwrap();
        assert_eq!(collection.table_name(), "orders");
        assert_eq!(collection_meta_key(&collection), "orders_orders");

        collection.table_name = Some("fs_orders".to_string());
        assert_eq!(collection.table_name(), "fs_orders");
        assert_eq!(collection_meta_key(&collection), "orders_fs_orders");
    }

    #[test]
    fn test_parse_invalid_blob_is_configuration_error() {
        #[derive(Debug, Deserialize)]
        struct Params {
            #[allow(dead_code)]
            collection: String,
        }

        let collection = Collection {
            name: "c".to_string(),
            kind: "firestore".to_string(),
            table_name: None,
            parameters: json!({"other": 1}),
        };
        let err = collection.parse_parameters::<Params>().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::Configuration(_))
        ));
        assert!(err.to_string().contains("collection [c] parameters"));
    }
}
