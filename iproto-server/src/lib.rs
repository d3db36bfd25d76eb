//! # iproto-server
//!
//! TCP server for iproto.
//!
//! This crate provides:
//! - An accept loop that wraps every connection in a [`Channel`](iproto_channel::Channel)
//! - A registry of live channels, drained gracefully on shutdown
//! - File and environment configuration for the `iproto` binary

pub mod config;
pub mod error;
pub mod server;

pub use config::{ChannelSettings, Config, ConfigError, NetworkConfig};
pub use error::ServerError;
pub use server::{Server, ServerStats};
