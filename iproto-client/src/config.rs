//! Pool configuration.

use iproto_channel::ChannelConfig;
use std::time::Duration;

/// Default number of channels per pool.
pub const DEFAULT_POOL_SIZE: usize = 1;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of channels kept to the server.
    pub size: usize,
    /// Limit on each dial attempt.
    pub connect_timeout: Duration,
    /// Pause between redial attempts of a slot.
    pub redial_interval: Duration,
    /// How long a request waits for an online channel.
    pub request_timeout: Duration,
    /// Configuration of every channel the pool opens.
    pub channel: ChannelConfig,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            connect_timeout: Duration::from_secs(10),
            redial_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            channel: ChannelConfig::default(),
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(1);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_redial_interval(mut self, interval: Duration) -> Self {
        self.redial_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}
