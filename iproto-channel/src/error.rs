//! Channel error types.

use thiserror::Error;

/// Errors returned by channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] iproto_protocol::ProtocolError),

    #[error("channel closed")]
    Closed,

    #[error("channel is shutting down")]
    ShuttingDown,

    #[error("request timeout")]
    Timeout,
}

impl ChannelError {
    /// Returns whether the operation may succeed on another channel or a
    /// later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChannelError::Io(_)
                | ChannelError::Closed
                | ChannelError::ShuttingDown
                | ChannelError::Timeout
        )
    }
}

/// Errors raised while building a handler table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("multiple handlers for message {0:#x}")]
    Duplicate(u32),
}
