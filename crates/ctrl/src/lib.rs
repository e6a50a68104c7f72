//! Weft controller plane: configuration compilation, the reconcile driver,
//! watch-kind event handling and the per-document configuration manager.

#![forbid(unsafe_code)]

pub mod applicator;
pub mod config;
pub mod controller;
pub mod driver;
pub mod events;
pub mod manager;

pub use applicator::Applicator;
pub use config::{compile, CompiledConfig, ConfigError};
pub use controller::PrimaryController;
pub use driver::{ReconcileDriver, ReconcileDriverConfig, ReconcileOutcome};
pub use events::{EventKind, WatchEventHandler};
pub use manager::{ConfigManager, ConfigManagerConfig};
