//! Channel configuration.

use crate::bytes_pool::BytePool;
use crate::handler::{Handler, ServeMux};
use iproto_protocol::DEFAULT_MAX_BODY_LEN;
use std::sync::Arc;
use std::time::Duration;

/// Default capacity of the outbound frame queue.
pub const DEFAULT_WRITE_QUEUE_SIZE: usize = 1024;

/// Frames written per flush, at most.
pub const DEFAULT_WRITE_BATCH: usize = 64;

/// Tuning and handler shared by every channel built from it.
#[derive(Clone)]
pub struct ChannelConfig {
    /// Serves inbound requests.
    pub handler: Arc<dyn Handler>,
    /// Largest accepted inbound body.
    pub max_body_len: u32,
    /// Capacity of the outbound frame queue.
    pub write_queue_size: usize,
    /// Frames written before each flush, at most.
    pub write_batch: usize,
    /// How long `call` waits for its response.
    pub request_timeout: Duration,
    /// How long `shutdown` waits for in-flight work before closing.
    pub shutdown_timeout: Duration,
    /// Buffers for encoded frames.
    pub byte_pool: BytePool,
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self {
            handler: Arc::new(ServeMux::new()),
            max_body_len: DEFAULT_MAX_BODY_LEN,
            write_queue_size: DEFAULT_WRITE_QUEUE_SIZE,
            write_batch: DEFAULT_WRITE_BATCH,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            byte_pool: BytePool::new(),
        }
    }

    pub fn with_handler(mut self, handler: impl Handler) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn with_shared_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_max_body_len(mut self, len: u32) -> Self {
        self.max_body_len = len;
        self
    }

    pub fn with_write_queue_size(mut self, size: usize) -> Self {
        self.write_queue_size = size.max(1);
        self
    }

    pub fn with_write_batch(mut self, batch: usize) -> Self {
        self.write_batch = batch.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_byte_pool(mut self, pool: BytePool) -> Self {
        self.byte_pool = pool;
        self
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("max_body_len", &self.max_body_len)
            .field("write_queue_size", &self.write_queue_size)
            .field("write_batch", &self.write_batch)
            .field("request_timeout", &self.request_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("byte_pool", &self.byte_pool)
            .finish_non_exhaustive()
    }
}
