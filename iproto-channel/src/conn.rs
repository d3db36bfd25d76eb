//! Capabilities shared by a single [`Channel`](crate::Channel) and anything
//! fronting several of them, such as a client pool.

use crate::handler::BoxFuture;
use bytes::Bytes;
use iproto_protocol::Packet;
use parking_lot::Mutex;

/// Boxed close callback.
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Sends requests and packets.
pub trait Sender: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Sends a request and waits for its response payload.
    fn call(&self, msg: u32, data: Bytes) -> BoxFuture<'_, Result<Bytes, Self::Error>>;

    /// Sends a request that expects no response.
    fn notify(&self, msg: u32, data: Bytes) -> BoxFuture<'_, Result<(), Self::Error>>;

    /// Sends a packet as is.
    fn send(&self, packet: Packet) -> BoxFuture<'_, Result<(), Self::Error>>;
}

/// Lifecycle control.
pub trait Closer: Send + Sync {
    /// Stops immediately.
    fn close(&self);

    /// Stops once in-flight work is done and waits for termination.
    fn shutdown(&self) -> BoxFuture<'_, ()>;

    /// Resolves once fully terminated.
    fn done(&self) -> BoxFuture<'_, ()>;

    /// Runs `f` once at termination, after every callback registered before it.
    fn on_close(&self, f: CloseCallback);
}

/// Close callbacks, run once in registration order.
///
/// Callbacks registered while the list is being run (including from inside
/// a callback) run after the ones already queued. Callbacks registered after
/// the list has run are called immediately.
pub struct CloseCallbacks {
    /// `None` once every callback has run.
    pending: Mutex<Option<Vec<CloseCallback>>>,
}

impl CloseCallbacks {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Some(Vec::new())),
        }
    }

    pub fn push(&self, f: CloseCallback) {
        let mut pending = self.pending.lock();
        if let Some(list) = pending.as_mut() {
            list.push(f);
            return;
        }
        drop(pending);
        f();
    }

    /// Runs every queued callback. Later calls do nothing.
    pub fn fire(&self) {
        loop {
            let batch = {
                let mut pending = self.pending.lock();
                match pending.as_mut() {
                    Some(list) if !list.is_empty() => std::mem::take(list),
                    _ => {
                        *pending = None;
                        return;
                    }
                }
            };
            for callback in batch {
                callback();
            }
        }
    }

    pub fn has_fired(&self) -> bool {
        self.pending.lock().is_none()
    }
}

impl Default for CloseCallbacks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CloseCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = self.pending.lock();
        f.debug_struct("CloseCallbacks")
            .field("queued", &pending.as_ref().map_or(0, Vec::len))
            .field("fired", &pending.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn record(log: &Log, entry: &'static str) -> CloseCallback {
        let log = log.clone();
        Box::new(move || log.lock().push(entry))
    }

    #[test]
    fn test_fire_runs_in_registration_order() {
        let callbacks = CloseCallbacks::new();
        let log = Log::default();
        callbacks.push(record(&log, "a"));
        callbacks.push(record(&log, "b"));
        assert!(log.lock().is_empty());

        callbacks.fire();
        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert!(callbacks.has_fired());

        callbacks.fire();
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_registered_while_firing_runs_after_queued() {
        let callbacks = Arc::new(CloseCallbacks::new());
        let log = Log::default();

        let nested = callbacks.clone();
        let nested_log = log.clone();
        callbacks.push(Box::new(move || {
            nested_log.lock().push("a");
            nested.push(record(&nested_log, "c"));
        }));
        callbacks.push(record(&log, "b"));

        callbacks.fire();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_registered_after_fire_runs_now() {
        let callbacks = CloseCallbacks::new();
        let log = Log::default();
        callbacks.fire();

        callbacks.push(record(&log, "late"));
        assert_eq!(*log.lock(), vec!["late"]);
    }
}
