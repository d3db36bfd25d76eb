//! Buffering encoder and decoder for packets read from and written to a
//! byte stream.

use crate::error::ProtocolError;
use crate::packet::{response_to, Packet, HEADER_LEN};
use crate::DEFAULT_MAX_BODY_LEN;
use bytes::{Bytes, BytesMut};

/// Encodes packets into contiguous frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a packet into a new buffer.
    pub fn encode(packet: &Packet) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(packet.wire_size());
        packet.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Encodes a request built from its parts.
    pub fn encode_request(msg: u32, sync: u32, data: Bytes) -> Result<BytesMut, ProtocolError> {
        Self::encode(&Packet::new(msg, sync, data))
    }

    /// Encodes the response to `request` carrying `payload`.
    pub fn encode_response(request: &Packet, payload: Bytes) -> Result<BytesMut, ProtocolError> {
        Self::encode(&response_to(request, payload))
    }
}

/// Accumulates stream bytes and yields complete packets.
pub struct Decoder {
    buffer: BytesMut,
    max_body_len: u32,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_body_len(DEFAULT_MAX_BODY_LEN)
    }

    /// Creates a decoder that rejects bodies longer than `max_body_len`.
    pub fn with_max_body_len(max_body_len: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_body_len,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Gives direct access to the buffer so socket reads can fill it
    /// without an intermediate copy.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        if self.buffer.capacity() - self.buffer.len() < HEADER_LEN {
            self.buffer.reserve(8192);
        }
        &mut self.buffer
    }

    /// Attempts to decode the next packet from the buffer.
    pub fn decode(&mut self) -> Result<Option<Packet>, ProtocolError> {
        Packet::decode(&mut self.buffer, self.max_body_len)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn max_body_len(&self) -> u32 {
        self.max_body_len
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
