//! A single multiplexed connection.
//!
//! Every channel runs two tasks:
//! - the read loop decodes inbound packets, completes pending calls and
//!   spawns a handler task per inbound request;
//! - the writer drains a bounded queue of encoded frames, writing them whole
//!   and in order, flushing once per batch.
//!
//! Pending calls live in a concurrent map keyed by sync. Whoever removes a
//! slot from the map (the read loop, the caller giving up, or teardown) is
//! the one that resolves it.

use crate::config::ChannelConfig;
use crate::conn::{CloseCallback, CloseCallbacks, Closer, Sender};
use crate::error::ChannelError;
use crate::handler::BoxFuture;
use crate::stats::Counters;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use iproto_protocol::{response_to, Decoder, Packet, MESSAGE_PING};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Online = 1,
    /// Graceful shutdown in progress; responses may still be sent.
    Draining = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Connecting,
            1 => ChannelState::Online,
            2 => ChannelState::Draining,
            _ => ChannelState::Closed,
        }
    }
}

type PendingSlot = oneshot::Sender<Result<Bytes, ChannelError>>;

/// An encoded frame waiting for the writer.
struct Outgoing {
    buf: Vec<u8>,
    ack: oneshot::Sender<Result<(), ChannelError>>,
}

struct Inner {
    id: Uuid,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    config: ChannelConfig,
    counters: Arc<Counters>,
    state: AtomicU8,
    pending: DashMap<u32, PendingSlot>,
    next_sync: AtomicU32,
    /// Handler tasks still running.
    handlers: AtomicUsize,
    /// Signalled whenever a pending call or handler finishes.
    idle: Notify,
    queue: mpsc::Sender<Outgoing>,
    stop: watch::Sender<bool>,
    done: watch::Sender<bool>,
    on_close: CloseCallbacks,
}

/// Handle to a live connection.
///
/// Cheap to clone; all clones drive the same connection. The same type is
/// given to handlers so they can reply on the connection a request came in
/// on.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    /// Connects to `addr` and starts a channel on the new stream.
    pub async fn connect(
        addr: SocketAddr,
        config: ChannelConfig,
        counters: Arc<Counters>,
    ) -> Result<Self, ChannelError> {
        tracing::debug!("Connecting to {}...", addr);
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::new(stream, config, counters)
    }

    /// Starts a channel on an established stream.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        stream: TcpStream,
        config: ChannelConfig,
        counters: Arc<Counters>,
    ) -> Result<Self, ChannelError> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (queue, queue_rx) = mpsc::channel(config.write_queue_size);
        let (stop, _) = watch::channel(false);
        let (done, _) = watch::channel(false);

        let channel = Channel {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                local_addr,
                remote_addr,
                config,
                counters,
                state: AtomicU8::new(ChannelState::Connecting as u8),
                pending: DashMap::new(),
                next_sync: AtomicU32::new(1),
                handlers: AtomicUsize::new(0),
                idle: Notify::new(),
                queue,
                stop,
                done,
                on_close: CloseCallbacks::new(),
            }),
        };

        let reader = tokio::spawn(run_reader(channel.clone(), read_half));
        let writer = tokio::spawn(write_loop(
            channel.inner.clone(),
            BufWriter::new(write_half),
            queue_rx,
        ));
        tokio::spawn(supervise(channel.inner.clone(), reader, writer));

        channel
            .inner
            .transition(ChannelState::Connecting, ChannelState::Online);
        tracing::info!(
            "Channel {} online ({} -> {})",
            channel.inner.id,
            local_addr,
            remote_addr
        );
        Ok(channel)
    }

    /// Sends a request and waits for its response payload.
    ///
    /// Fails with [`ChannelError::Timeout`] after the configured request
    /// timeout and with [`ChannelError::Closed`] if the channel closes first.
    /// Dropping the returned future abandons the call; a late response is
    /// then dropped and counted as unmatched.
    pub async fn call(&self, msg: u32, data: impl Into<Bytes>) -> Result<Bytes, ChannelError> {
        let inner = &self.inner;
        inner.check_accepting()?;

        let (tx, rx) = oneshot::channel();
        let sync = inner.register(tx);
        let _slot = PendingGuard {
            inner: inner.as_ref(),
            sync,
        };
        // Teardown may have swept the table just before the insert.
        inner.check_accepting()?;

        tracing::debug!("Channel {}: call msg={:#x} sync={}", inner.id, msg, sync);
        inner.enqueue(&Packet::new(msg, sync, data)).await?;

        match tokio::time::timeout(inner.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                tracing::debug!("Channel {}: call sync={} timed out", inner.id, sync);
                Err(ChannelError::Timeout)
            }
        }
    }

    /// Sends a request that expects no response.
    pub async fn notify(&self, msg: u32, data: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.inner.check_accepting()?;
        let sync = self.inner.next_sync.fetch_add(1, Ordering::Relaxed);
        self.inner.enqueue(&Packet::new(msg, sync, data)).await
    }

    /// Sends a packet as is.
    ///
    /// Resolves once the frame is flushed to the socket. While the channel
    /// drains only responses are accepted.
    pub async fn send(&self, packet: Packet) -> Result<(), ChannelError> {
        match self.state() {
            ChannelState::Closed => return Err(ChannelError::Closed),
            ChannelState::Draining if !packet.is_response() => {
                return Err(ChannelError::ShuttingDown)
            }
            _ => {}
        }
        self.inner.enqueue(&packet).await
    }

    /// Round-trips a ping packet, answered by the peer's channel itself.
    pub async fn ping(&self) -> Result<(), ChannelError> {
        self.call(MESSAGE_PING, Bytes::new()).await.map(|_| ())
    }

    /// Closes the channel immediately. Pending calls fail with
    /// [`ChannelError::Closed`].
    pub fn close(&self) {
        self.inner.terminate();
    }

    /// Stops accepting new calls, waits for pending calls and running
    /// handlers to finish (at most `shutdown_timeout`), then closes.
    ///
    /// Calling this from inside one of this channel's handlers waits out the
    /// full timeout; spawn it instead.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.transition(ChannelState::Online, ChannelState::Draining)
            || inner.transition(ChannelState::Connecting, ChannelState::Draining)
        {
            tracing::info!(
                "Channel {} draining ({} pending calls, {} handlers)",
                inner.id,
                inner.pending.len(),
                inner.handlers.load(Ordering::SeqCst)
            );
            let timeout = inner.config.shutdown_timeout;
            if tokio::time::timeout(timeout, inner.wait_idle())
                .await
                .is_err()
            {
                tracing::warn!(
                    "Channel {} shutdown timed out after {:?}, closing",
                    inner.id,
                    timeout
                );
            }
            inner.terminate();
        }
        self.done().await;
    }

    /// Resolves once both tasks have exited and close callbacks have run.
    pub async fn done(&self) {
        let mut done = self.inner.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Registers `f` to run once when the channel terminates. Callbacks run
    /// in registration order; registering after termination runs `f` now.
    pub fn on_close(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.on_close.push(Box::new(f));
    }

    /// Takes a buffer of at least `n` bytes capacity from the byte pool.
    pub fn get_bytes(&self, n: usize) -> Vec<u8> {
        self.inner.config.byte_pool.get(n)
    }

    /// Returns a buffer to the byte pool.
    pub fn put_bytes(&self, buf: Vec<u8>) {
        self.inner.config.byte_pool.put(buf);
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.inner.counters
    }

    fn dispatch(&self, packet: Packet) {
        let inner = &self.inner;
        inner.counters.record_received();

        if packet.is_response() {
            inner.complete(packet);
            return;
        }

        if packet.header.msg == MESSAGE_PING {
            let channel = self.clone();
            tokio::spawn(async move {
                if let Err(e) = channel.send(response_to(&packet, Bytes::new())).await {
                    tracing::debug!("Channel {}: ping reply failed: {}", channel.id(), e);
                }
            });
            return;
        }

        let running = HandlerGuard::new(inner.clone());
        let serve = inner.config.handler.serve_iproto(self.clone(), packet);
        tokio::spawn(async move {
            serve.await;
            drop(running);
        });
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("local_addr", &self.inner.local_addr)
            .field("remote_addr", &self.inner.remote_addr)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Sender for Channel {
    type Error = ChannelError;

    fn call(&self, msg: u32, data: Bytes) -> BoxFuture<'_, Result<Bytes, ChannelError>> {
        Box::pin(Channel::call(self, msg, data))
    }

    fn notify(&self, msg: u32, data: Bytes) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(Channel::notify(self, msg, data))
    }

    fn send(&self, packet: Packet) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(Channel::send(self, packet))
    }
}

impl Closer for Channel {
    fn close(&self) {
        Channel::close(self);
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(Channel::shutdown(self))
    }

    fn done(&self) -> BoxFuture<'_, ()> {
        Box::pin(Channel::done(self))
    }

    fn on_close(&self, f: CloseCallback) {
        self.inner.on_close.push(f);
    }
}

impl Inner {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn check_accepting(&self) -> Result<(), ChannelError> {
        match self.state() {
            ChannelState::Connecting | ChannelState::Online => Ok(()),
            ChannelState::Draining => Err(ChannelError::ShuttingDown),
            ChannelState::Closed => Err(ChannelError::Closed),
        }
    }

    /// Inserts `slot` under a sync that no in-flight call is using.
    fn register(&self, slot: PendingSlot) -> u32 {
        loop {
            let sync = self.next_sync.fetch_add(1, Ordering::Relaxed);
            if let Entry::Vacant(entry) = self.pending.entry(sync) {
                entry.insert(slot);
                return sync;
            }
        }
    }

    fn complete(&self, packet: Packet) {
        let sync = packet.header.sync;
        match self.pending.remove(&sync) {
            Some((_, slot)) => {
                let _ = slot.send(Ok(packet.data));
                self.idle.notify_waiters();
            }
            None => {
                self.counters.record_unmatched();
                tracing::debug!(
                    "Channel {}: dropping response with unknown sync={}",
                    self.id,
                    sync
                );
            }
        }
    }

    async fn enqueue(&self, packet: &Packet) -> Result<(), ChannelError> {
        let mut buf = self.config.byte_pool.get(packet.wire_size());
        packet.encode_into(&mut buf)?;

        let (ack, acked) = oneshot::channel();
        self.queue
            .send(Outgoing { buf, ack })
            .await
            .map_err(|_| ChannelError::Closed)?;
        acked.await.map_err(|_| ChannelError::Closed)?
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.handlers.load(Ordering::SeqCst) == 0
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() || self.state() == ChannelState::Closed {
                return;
            }
            notified.await;
        }
    }

    /// Moves to `Closed`, stops both tasks and fails every pending call.
    fn terminate(&self) {
        let prev = self.state.swap(ChannelState::Closed as u8, Ordering::SeqCst);
        if prev == ChannelState::Closed as u8 {
            return;
        }
        self.stop.send_replace(true);

        let syncs: Vec<u32> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for sync in syncs {
            if let Some((_, slot)) = self.pending.remove(&sync) {
                let _ = slot.send(Err(ChannelError::Closed));
                failed += 1;
            }
        }
        self.idle.notify_waiters();

        tracing::info!(
            "Channel {} closed ({} -> {}, {} pending calls failed)",
            self.id,
            self.local_addr,
            self.remote_addr,
            failed
        );
    }
}

/// Removes an abandoned call's slot.
struct PendingGuard<'a> {
    inner: &'a Inner,
    sync: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.inner.pending.remove(&self.sync).is_some() {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Counts a running handler task.
struct HandlerGuard {
    inner: Arc<Inner>,
}

impl HandlerGuard {
    fn new(inner: Arc<Inner>) -> Self {
        inner.handlers.fetch_add(1, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if self.inner.handlers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn run_reader(channel: Channel, reader: OwnedReadHalf) {
    match read_loop(&channel, reader).await {
        Ok(()) => tracing::debug!("Channel {}: read loop finished", channel.id()),
        Err(e) => tracing::warn!("Channel {}: read loop failed: {}", channel.id(), e),
    }
    channel.inner.terminate();
}

async fn read_loop(channel: &Channel, mut reader: OwnedReadHalf) -> Result<(), ChannelError> {
    let inner = &channel.inner;
    let mut stop = inner.stop.subscribe();
    let mut decoder = Decoder::with_max_body_len(inner.config.max_body_len);

    loop {
        while let Some(packet) = decoder.decode()? {
            channel.dispatch(packet);
        }

        let n = tokio::select! {
            biased;
            _ = stopped(&mut stop) => return Ok(()),
            n = reader.read_buf(decoder.buffer_mut()) => n?,
        };

        if n == 0 {
            if decoder.buffered() > 0 {
                tracing::debug!(
                    "Channel {}: peer closed with {} bytes of a partial packet",
                    inner.id,
                    decoder.buffered()
                );
            }
            return Ok(());
        }
    }
}

async fn write_loop(
    inner: Arc<Inner>,
    mut writer: BufWriter<OwnedWriteHalf>,
    mut queue: mpsc::Receiver<Outgoing>,
) {
    let mut stop = inner.stop.subscribe();
    let batch_limit = inner.config.write_batch;
    let mut batch: Vec<Outgoing> = Vec::with_capacity(batch_limit);

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut stop) => break,
            frame = queue.recv() => match frame {
                Some(frame) => batch.push(frame),
                None => break,
            },
        }
        while batch.len() < batch_limit {
            match queue.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::warn!("Channel {}: write failed: {}", inner.id, e);
            // The frame that hit the error reports it; the rest see Closed.
            let mut frames = batch.drain(..);
            if let Some(first) = frames.next() {
                let _ = first.ack.send(Err(ChannelError::Io(e)));
            }
            drop(frames);
            inner.terminate();
            return;
        }

        inner.counters.record_sent(batch.len() as u64);
        for frame in batch.drain(..) {
            inner.config.byte_pool.put(frame.buf);
            let _ = frame.ack.send(Ok(()));
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Channel {}: socket shutdown: {}", inner.id, e);
    }
}

async fn write_batch(
    writer: &mut BufWriter<OwnedWriteHalf>,
    batch: &[Outgoing],
) -> std::io::Result<()> {
    for frame in batch {
        writer.write_all(&frame.buf).await?;
    }
    writer.flush().await
}

async fn supervise(inner: Arc<Inner>, reader: JoinHandle<()>, writer: JoinHandle<()>) {
    let (read_result, write_result) = tokio::join!(reader, writer);
    if let Err(e) = read_result {
        tracing::error!("Channel {}: read task failed: {}", inner.id, e);
    }
    if let Err(e) = write_result {
        tracing::error!("Channel {}: write task failed: {}", inner.id, e);
    }
    inner.terminate();

    inner.on_close.fire();
    inner.done.send_replace(true);
    tracing::debug!("Channel {} done", inner.id);
}
