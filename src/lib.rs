// Process configuration
pub mod config;

// Driver contract and interval model
pub mod driver;

// Error taxonomy
pub mod error;

// Canonical column types
pub mod schema;

pub use driver::{Collection, Driver, ObjectsLoader, Record, SourceConfig, TimeInterval};
pub use error::SyncError;
pub use schema::{BatchHeader, CanonicalType, Fields};
