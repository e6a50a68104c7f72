//! Weft process root: owns signal-scoped lifecycle, optional leader
//! election, the health probe endpoint and the per-document configuration
//! managers.

#![forbid(unsafe_code)]

pub mod health;
pub mod leader;
pub mod manager;

pub use manager::{FleetManager, FleetManagerConfig};
