//! # iproto-client
//!
//! Client library for iproto.
//!
//! This crate provides:
//! - [`Pool`]: a fixed number of channels to one server, round-robin
//!   balancing, background redial and pool-wide graceful shutdown
//! - [`PoolConfig`] tuning and [`PoolStats`] counters

pub mod config;
pub mod error;
pub mod pool;

pub use config::PoolConfig;
pub use error::PoolError;
pub use pool::{Pool, PoolStats};
