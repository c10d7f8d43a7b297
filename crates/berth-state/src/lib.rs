//! berth-state: durable record store for Berth.
//!
//! Backed by [redb](https://docs.rs/redb). Holds instance, host and
//! blueprint records plus per-instance provisioning logs and named
//! advisory locks.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Instance and host records carry a `version` counter; state transitions
//! go through [`StateStore::cas_instance`] / [`StateStore::cas_host`],
//! which only write when the stored version matches the caller's view.
//! A mismatch surfaces as [`StateError::Conflict`] and the caller re-reads.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
