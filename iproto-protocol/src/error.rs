//! Protocol and serialization error types.

use thiserror::Error;

/// Framing errors that make a byte stream untrustworthy.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: u32, max: u32 },

    #[error("body length mismatch: header says {declared}, payload has {actual}")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("incomplete packet: need {needed} more bytes")]
    IncompletePacket { needed: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by `pack`/`unpack` to their immediate caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PackError {
    #[error("truncated input: need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("value overflows {kind}")]
    Overflow { kind: &'static str },

    #[error("non-minimal BER encoding")]
    NonMinimal,

    #[error("unsupported shape: {0}")]
    Unsupported(String),

    #[error("invalid UTF-8 in string")]
    InvalidUtf8,
}

impl PackError {
    pub(crate) fn truncated(needed: usize, remaining: usize) -> Self {
        PackError::Truncated { needed, remaining }
    }
}
