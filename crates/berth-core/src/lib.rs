//! berth-core: shared vocabulary for the Berth provisioning engine.
//!
//! Holds the configuration surface (`berth.toml`), the size-class and
//! slot-count value types used by the host pool, duration parsing, and
//! id generation. Every other Berth crate depends on this one.

pub mod config;
pub mod ids;
pub mod types;

pub use config::{BerthConfig, ConfigError};
pub use ids::generate_id;
pub use types::*;
