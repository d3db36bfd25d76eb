//! Packet header and framing.
//!
//! Packet layout (12 bytes header + body):
//!
//! ```text
//! +----------+----------+----------+---------------------+
//! | msg      | sync     | body_len | data                |
//! | 4 bytes  | 4 bytes  | 4 bytes  | body_len bytes      |
//! +----------+----------+----------+---------------------+
//! ```
//!
//! Header fields are little-endian. Bit 31 of `msg` marks a response.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the packet header in bytes (4+4+4 = 12).
pub const HEADER_LEN: usize = 12;

/// High bit of `msg`, set on responses.
pub const RESPONSE_FLAG: u32 = 1 << 31;

/// Packet header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Header {
    /// Message (method) code. Bit 31 is the response flag.
    pub msg: u32,
    /// Request correlation id.
    pub sync: u32,
    /// Length of the body that follows the header.
    pub body_len: u32,
}

impl Header {
    pub fn new(msg: u32, sync: u32, body_len: u32) -> Self {
        Self {
            msg,
            sync,
            body_len,
        }
    }

    /// Returns whether the response flag is set.
    pub fn is_response(&self) -> bool {
        self.msg & RESPONSE_FLAG != 0
    }

    /// Returns the message code without the response flag.
    pub fn message(&self) -> u32 {
        self.msg & !RESPONSE_FLAG
    }

    /// Writes the header into `dst`.
    pub fn encode_into(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(self.msg);
        dst.put_u32_le(self.sync);
        dst.put_u32_le(self.body_len);
    }

    /// Encodes the header onto the stack.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        self.encode_into(&mut &mut out[..]);
        out
    }

    /// Decodes a header from exactly [`HEADER_LEN`] bytes.
    pub fn decode(src: &[u8; HEADER_LEN]) -> Self {
        let mut src: &[u8] = &src[..];
        Self {
            msg: src.get_u32_le(),
            sync: src.get_u32_le(),
            body_len: src.get_u32_le(),
        }
    }
}

/// One protocol message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    /// Payload, opaque to framing.
    pub data: Bytes,
}

impl Packet {
    /// Creates a packet, filling in `body_len` from `data`.
    pub fn new(msg: u32, sync: u32, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            header: Header::new(msg, sync, data.len() as u32),
            data,
        }
    }

    /// Returns whether this packet is a response.
    pub fn is_response(&self) -> bool {
        self.header.is_response()
    }

    /// The total wire size of this packet (header + body).
    pub fn wire_size(&self) -> usize {
        HEADER_LEN + self.data.len()
    }

    /// Encodes the packet into `dst`.
    pub fn encode_into(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        if self.data.len() > u32::MAX as usize {
            return Err(ProtocolError::BodyTooLarge {
                size: u32::MAX,
                max: u32::MAX,
            });
        }
        if self.header.body_len as usize != self.data.len() {
            return Err(ProtocolError::LengthMismatch {
                declared: self.header.body_len,
                actual: self.data.len(),
            });
        }

        self.header.encode_into(dst);
        dst.put_slice(&self.data);
        Ok(())
    }

    /// Decodes a packet from bytes.
    ///
    /// Returns `Ok(Some(packet))` if a complete packet was decoded,
    /// `Ok(None)` if more data is needed, or `Err` if the header announces a
    /// body larger than `max_body_len`.
    pub fn decode(buf: &mut BytesMut, max_body_len: u32) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&buf[..HEADER_LEN]);
        let header = Header::decode(&raw);

        if header.body_len > max_body_len {
            return Err(ProtocolError::BodyTooLarge {
                size: header.body_len,
                max: max_body_len,
            });
        }

        let total_len = HEADER_LEN + header.body_len as usize;
        if buf.len() < total_len {
            buf.reserve(total_len - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let data = buf.split_to(header.body_len as usize).freeze();

        Ok(Some(Self { header, data }))
    }
}

/// Builds the response to `packet` carrying `payload`.
///
/// Keeps `sync` and the message code, sets the response flag and replaces
/// the body.
pub fn response_to(packet: &Packet, payload: impl Into<Bytes>) -> Packet {
    Packet::new(packet.header.msg | RESPONSE_FLAG, packet.header.sync, payload)
}
