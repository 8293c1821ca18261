//! Source connectors for the intake engine.
//!
//! Every connector implements [`intake::Driver`]:
//!
//! ```text
//!  orchestrator ──► registry::create_driver(source, collection)
//!                          │
//!          ┌───────────────┴────────────────┐
//!          ▼                                ▼
//!   firebase::FirebaseDriver         singer::SingerDriver
//!   (Firestore REST, accounts)       (TapBridge ─► tap process ─► parser)
//! ```
//!
//! - [`singer`] - Singer taps installed into per-tap virtual environments
//! - [`firebase`] - Firestore collections and Firebase users
//! - [`runner`] - external process execution with timeouts
//! - [`registry`] - driver construction by source type

pub mod firebase;
pub mod registry;
pub mod runner;
pub mod singer;

pub use registry::{create_driver, supported_types};
