//! Singer tap support.
//!
//! - [`bridge::TapBridge`] installs taps into per-tap virtual environments and
//!   tracks their readiness.
//! - [`discovery`] runs a tap in discovery mode and force-selects its catalog.
//! - [`parser`] turns a running tap's stdout into per-stream records, using
//!   [`inference`] to map declared property types onto canonical fields.
//! - [`driver::SingerDriver`] ties these together behind the `Driver` contract.

pub mod bridge;
pub mod discovery;
pub mod driver;
mod files;
pub mod inference;
pub mod installer;
pub mod parser;

pub use bridge::TapBridge;
pub use discovery::{Catalog, CatalogStream, TapConfigSource};
pub use driver::{SingerDriver, SingerSourceConfig, SINGER_TYPE};
pub use inference::infer_fields;
pub use installer::{TapInstaller, VenvInstaller};
pub use parser::{parse_output, OutputRepresentation, StreamRepresentation, MAX_LINE_BYTES};
