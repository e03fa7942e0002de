//! Marcus server binary support library.
//!
//! The binary in `main.rs` stays thin; configuration loading, telemetry
//! and application wiring live here so integration tests can exercise
//! them in-process.

pub mod config;
pub mod setup;
pub mod stdio;
pub mod telemetry;

pub use config::{BackendKind, Config, KanbanProvider, LogFormat};
pub use setup::{build_persistence, initialize_app};
