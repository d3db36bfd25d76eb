//! # iproto-channel
//!
//! One multiplexed iproto connection.
//!
//! This crate provides:
//! - [`Channel`]: framing, call/response correlation by sync, ordered
//!   batched writes, graceful and abrupt shutdown
//! - [`Sender`] and [`Closer`], the capabilities a channel shares with
//!   anything fronting several channels
//! - [`Handler`], [`HandlerFn`] and [`ServeMux`] for inbound requests
//! - [`BytePool`] for reusing frame buffers
//! - Shared packet [`Counters`]

pub mod bytes_pool;
pub mod channel;
pub mod config;
pub mod conn;
pub mod error;
pub mod handler;
pub mod stats;

pub use bytes_pool::BytePool;
pub use channel::{Channel, ChannelState};
pub use config::ChannelConfig;
pub use conn::{CloseCallback, CloseCallbacks, Closer, Sender};
pub use error::{ChannelError, HandlerError};
pub use handler::{BoxFuture, Handler, HandlerFn, ServeMux};
pub use stats::{Counters, CountersSnapshot};
