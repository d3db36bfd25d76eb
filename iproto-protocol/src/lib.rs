//! # iproto-protocol
//!
//! Wire protocol implementation for iproto.
//!
//! This crate provides:
//! - Length-prefixed packet framing with request/response correlation ids
//! - Fixed-width and BER integer packing, length-prefixed strings
//! - Schema-driven record encoding via [`record!`]
//! - Error types and protocol constants

pub mod ber;
pub mod codec;
pub mod error;
pub mod pack;
pub mod packet;
pub mod record;

pub use bytes;

pub use codec::{Decoder, Encoder};
pub use error::{PackError, ProtocolError};
pub use pack::{pack, unpack, unpack_into, Mode, Pack, Unpack};
pub use packet::{response_to, Header, Packet, HEADER_LEN, RESPONSE_FLAG};
pub use record::{pack_record, unpack_record, Field, Kind, Record, Value};

/// Message code of the ping packet, answered by the channel itself.
pub const MESSAGE_PING: u32 = 0xff00;

/// Default maximum packet body size (16 MiB).
pub const DEFAULT_MAX_BODY_LEN: u32 = 16 * 1024 * 1024;
