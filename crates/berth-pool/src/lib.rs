//! berth-pool: dynamic host pool for pool-based drivers.
//!
//! Drivers such as docker run instances on hosts the pool owns. The pool
//! keeps a configured number of spare slots per size class, places each
//! instance on the tightest host that fits, and retires hosts nobody uses.
//!
//! # Tick
//!
//! ```text
//! 1. prepare spawning hosts         (failures count toward max_host_errors)
//! 2. mark hosts past host_lifetime  inactive
//! 3. retire empty hosts             (idle > idle_grace and spare stays >= target,
//!                                    or inactive; terminate or power off)
//! 4. while free[class] < target[class] + held[class]:
//!        restart a stopped host, else create one if hosts < max_hosts
//!        (creation failures back off exponentially, then stop until
//!         reset_host_errors() or pending demand after exhausted_retry_interval)
//! ```
//!
//! Requests that find no slot are held, not failed; the caller retries
//! `reserve` and the held count feeds the next tick's scaling decision.

pub mod error;
pub mod manager;

pub use error::{PoolError, PoolResult};
pub use manager::{HOUSEKEEPING_LOCK, HostPool, PoolSnapshot, Reservation, TickReport};
