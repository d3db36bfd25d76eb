//! Inbound request handlers.
//!
//! A channel hands every non-technical inbound request to its configured
//! [`Handler`] on a task of its own. The handler replies, if it wants to,
//! through the [`Channel`] it is given.

use crate::channel::Channel;
use crate::error::HandlerError;
use iproto_protocol::Packet;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Serves inbound request packets.
pub trait Handler: Send + Sync + 'static {
    fn serve_iproto(&self, conn: Channel, packet: Packet) -> BoxFuture<'static, ()>;
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn serve_iproto(&self, conn: Channel, packet: Packet) -> BoxFuture<'static, ()> {
        (**self).serve_iproto(conn, packet)
    }
}

/// Adapts an async closure into a [`Handler`].
///
/// ```ignore
/// let echo = HandlerFn::new(|conn: Channel, packet: Packet| async move {
///     let _ = conn.send(response_to(&packet, packet.data.clone())).await;
/// });
/// ```
pub struct HandlerFn<F> {
    f: F,
}

impl<F, Fut> HandlerFn<F>
where
    F: Fn(Channel, Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Channel, Packet) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn serve_iproto(&self, conn: Channel, packet: Packet) -> BoxFuture<'static, ()> {
        Box::pin((self.f)(conn, packet))
    }
}

/// Routes requests to handlers by message code.
///
/// Requests with no registered handler are dropped.
#[derive(Default)]
pub struct ServeMux {
    handlers: RwLock<HashMap<u32, Arc<dyn Handler>>>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `message`.
    pub fn handle(&self, message: u32, handler: impl Handler) -> Result<(), HandlerError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&message) {
            return Err(HandlerError::Duplicate(message));
        }
        handlers.insert(message, Arc::new(handler));
        Ok(())
    }

    /// Registers a closure for `message`.
    pub fn handle_fn<F, Fut>(&self, message: u32, f: F) -> Result<(), HandlerError>
    where
        F: Fn(Channel, Packet) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handle(message, HandlerFn::new(f))
    }

    /// Returns the handler registered for `message`, if any.
    pub fn handler(&self, message: u32) -> Option<Arc<dyn Handler>> {
        self.handlers.read().get(&message).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl Handler for ServeMux {
    fn serve_iproto(&self, conn: Channel, packet: Packet) -> BoxFuture<'static, ()> {
        let message = packet.header.message();
        match self.handler(message) {
            Some(handler) => handler.serve_iproto(conn, packet),
            None => {
                tracing::debug!(
                    "No handler for message {:#x} (sync={})",
                    message,
                    packet.header.sync
                );
                Box::pin(async {})
            }
        }
    }
}

impl std::fmt::Debug for ServeMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut codes: Vec<u32> = self.handlers.read().keys().copied().collect();
        codes.sort_unstable();
        f.debug_struct("ServeMux").field("messages", &codes).finish()
    }
}
