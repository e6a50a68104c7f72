//! Weft image fleet: keeps one worker pod per declared image alive and
//! reachable, and publishes/retracts the corresponding store client as the
//! pod's readiness changes.

#![forbid(unsafe_code)]

pub mod controller;
pub mod fleet;
pub mod resolve;
pub mod workload;

pub use controller::{ImageController, ImageControllerConfig};
pub use fleet::{ImageFleet, ImageFleetConfig};
pub use resolve::{DigestResolver, PinnedResolver};
