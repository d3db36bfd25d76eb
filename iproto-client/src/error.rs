//! Pool error types.

use iproto_channel::ChannelError;
use thiserror::Error;

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("no channel online")]
    NoChannel,

    #[error("pool closed")]
    Closed,
}

impl PoolError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::Channel(e) => e.is_retryable(),
            PoolError::ConnectTimeout => true,
            PoolError::NoChannel => true,
            PoolError::Closed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(PoolError::NoChannel.is_retryable());
        assert!(PoolError::ConnectTimeout.is_retryable());
        assert!(PoolError::Channel(ChannelError::Closed).is_retryable());
        assert!(!PoolError::Closed.is_retryable());
    }

    #[test]
    fn test_from_channel_error() {
        let err: PoolError = ChannelError::Timeout.into();
        assert!(matches!(err, PoolError::Channel(ChannelError::Timeout)));
        assert_eq!(err.to_string(), "channel error: request timeout");
    }
}
