//! Connection pool.
//!
//! A pool keeps `size` channels to one address. Each slot has a supervisor
//! task that owns the slot's channel: when the channel terminates the slot
//! goes offline and the supervisor redials every `redial_interval` until it
//! succeeds or the pool stops. Requests go to online channels round-robin.

use crate::config::PoolConfig;
use crate::error::PoolError;
use bytes::Bytes;
use iproto_channel::{
    BoxFuture, Channel, ChannelState, CloseCallback, CloseCallbacks, Closer, Counters, Sender,
};
use iproto_protocol::Packet;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How the pool is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    Graceful,
    Abrupt,
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Channels currently online.
    pub online: usize,
}

struct Shared {
    addr: SocketAddr,
    config: PoolConfig,
    counters: Arc<Counters>,
    slots: RwLock<Vec<Option<Channel>>>,
    next: AtomicUsize,
    /// Bumped on every slot change.
    changed: watch::Sender<()>,
    stop: watch::Sender<Option<StopMode>>,
    done: watch::Sender<bool>,
    on_close: CloseCallbacks,
}

/// Closes the pool once the last `Pool` handle is dropped.
struct Owner {
    shared: Arc<Shared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.shared.request_stop(StopMode::Abrupt);
    }
}

/// A pool of channels to one server.
///
/// Cheap to clone. Dropping the last clone closes the pool.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
    _owner: Arc<Owner>,
}

impl Pool {
    /// Dials `addr`.
    ///
    /// The first channel is connected before this returns; the remaining
    /// `size - 1` slots dial in the background.
    pub async fn dial(addr: SocketAddr, config: PoolConfig) -> Result<Self, PoolError> {
        let size = config.size.max(1);
        let (changed, _) = watch::channel(());
        let (stop, _) = watch::channel(None);
        let (done, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            addr,
            config,
            counters: Arc::new(Counters::new()),
            slots: RwLock::new(vec![None; size]),
            next: AtomicUsize::new(0),
            changed,
            stop,
            done,
            on_close: CloseCallbacks::new(),
        });

        let first = shared.dial_channel().await?;
        shared.set_slot(0, Some(first.clone()));

        let mut supervisors: Vec<JoinHandle<()>> = Vec::with_capacity(size);
        supervisors.push(tokio::spawn(supervise_slot(shared.clone(), 0, Some(first))));
        for index in 1..size {
            supervisors.push(tokio::spawn(supervise_slot(shared.clone(), index, None)));
        }

        let finished = shared.clone();
        tokio::spawn(async move {
            for supervisor in supervisors {
                if let Err(e) = supervisor.await {
                    tracing::error!("Pool {}: slot supervisor failed: {}", finished.addr, e);
                }
            }
            finished.on_close.fire();
            finished.done.send_replace(true);
            tracing::info!("Pool {} done", finished.addr);
        });

        tracing::info!("Pool dialed {} ({} channels)", addr, size);
        Ok(Self {
            _owner: Arc::new(Owner {
                shared: shared.clone(),
            }),
            shared,
        })
    }

    /// Sends a request on an online channel and waits for the response.
    pub async fn call(&self, msg: u32, data: impl Into<Bytes>) -> Result<Bytes, PoolError> {
        let channel = self.shared.channel().await?;
        Ok(channel.call(msg, data).await?)
    }

    /// Sends a request that expects no response.
    pub async fn notify(&self, msg: u32, data: impl Into<Bytes>) -> Result<(), PoolError> {
        let channel = self.shared.channel().await?;
        Ok(channel.notify(msg, data).await?)
    }

    /// Sends a packet as is on an online channel.
    pub async fn send(&self, packet: Packet) -> Result<(), PoolError> {
        let channel = self.shared.channel().await?;
        Ok(channel.send(packet).await?)
    }

    pub fn stats(&self) -> PoolStats {
        let counters = self.shared.counters.snapshot();
        PoolStats {
            packets_sent: counters.packets_sent,
            packets_received: counters.packets_received,
            online: self.shared.online(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn size(&self) -> usize {
        self.shared.slots.read().len()
    }

    /// Shuts every channel down gracefully and waits until the pool is done.
    pub async fn shutdown(&self) {
        self.shared.request_stop(StopMode::Graceful);
        self.done().await;
    }

    /// Closes every channel immediately. Does not wait; see [`Pool::done`].
    pub fn close(&self) {
        self.shared.request_stop(StopMode::Abrupt);
    }

    /// Resolves once every slot supervisor has exited and every channel the
    /// pool owned is closed.
    pub async fn done(&self) {
        let mut done = self.shared.done.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Registers `f` to run once the pool is done, after callbacks registered
    /// earlier. Runs `f` right away if the pool is already done.
    pub fn on_close(&self, f: impl FnOnce() + Send + 'static) {
        self.shared.on_close.push(Box::new(f));
    }
}

impl Sender for Pool {
    type Error = PoolError;

    fn call(&self, msg: u32, data: Bytes) -> BoxFuture<'_, Result<Bytes, PoolError>> {
        Box::pin(Pool::call(self, msg, data))
    }

    fn notify(&self, msg: u32, data: Bytes) -> BoxFuture<'_, Result<(), PoolError>> {
        Box::pin(Pool::notify(self, msg, data))
    }

    fn send(&self, packet: Packet) -> BoxFuture<'_, Result<(), PoolError>> {
        Box::pin(Pool::send(self, packet))
    }
}

impl Closer for Pool {
    fn close(&self) {
        Pool::close(self);
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(Pool::shutdown(self))
    }

    fn done(&self) -> BoxFuture<'_, ()> {
        Box::pin(Pool::done(self))
    }

    fn on_close(&self, f: CloseCallback) {
        self.shared.on_close.push(f);
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("addr", &self.shared.addr)
            .field("size", &self.size())
            .field("online", &self.shared.online())
            .finish()
    }
}

impl Shared {
    fn request_stop(&self, mode: StopMode) {
        self.stop.send_if_modified(|current| match (*current, mode) {
            (None, _) | (Some(StopMode::Graceful), StopMode::Abrupt) => {
                tracing::info!("Pool {} stopping ({:?})", self.addr, mode);
                *current = Some(mode);
                true
            }
            _ => false,
        });
    }

    fn is_stopping(&self) -> bool {
        self.stop.borrow().is_some()
    }

    async fn dial_channel(&self) -> Result<Channel, PoolError> {
        let connect = Channel::connect(
            self.addr,
            self.config.channel.clone(),
            self.counters.clone(),
        );
        match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(PoolError::ConnectTimeout),
        }
    }

    fn set_slot(&self, index: usize, channel: Option<Channel>) {
        self.slots.write()[index] = channel;
        self.changed.send_replace(());
    }

    fn online(&self) -> usize {
        self.slots
            .read()
            .iter()
            .flatten()
            .filter(|channel| channel.state() == ChannelState::Online)
            .count()
    }

    /// Next online channel, round-robin.
    fn pick(&self) -> Option<Channel> {
        let slots = self.slots.read();
        let len = slots.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..len)
            .filter_map(|offset| slots[(start + offset) % len].as_ref())
            .find(|channel| channel.state() == ChannelState::Online)
            .cloned()
    }

    /// Waits up to `request_timeout` for an online channel.
    async fn channel(&self) -> Result<Channel, PoolError> {
        if self.is_stopping() {
            return Err(PoolError::Closed);
        }
        if let Some(channel) = self.pick() {
            return Ok(channel);
        }

        tracing::debug!("Pool {}: no channel online, waiting", self.addr);
        let mut changed = self.changed.subscribe();
        let mut stop = self.stop.subscribe();
        let wait = async {
            loop {
                if let Some(channel) = self.pick() {
                    return Ok(channel);
                }
                tokio::select! {
                    _ = stopped(&mut stop) => return Err(PoolError::Closed),
                    result = changed.changed() => {
                        if result.is_err() {
                            return Err(PoolError::Closed);
                        }
                    }
                }
            }
        };
        tokio::time::timeout(self.config.request_timeout, wait)
            .await
            .unwrap_or(Err(PoolError::NoChannel))
    }
}

async fn supervise_slot(shared: Arc<Shared>, index: usize, mut channel: Option<Channel>) {
    let mut stop = shared.stop.subscribe();
    let redial_interval = shared.config.redial_interval;

    loop {
        let current = match channel.take() {
            Some(current) => current,
            None => {
                if shared.is_stopping() {
                    return;
                }
                match shared.dial_channel().await {
                    Ok(current) => {
                        tracing::info!("Pool {}: slot {} online", shared.addr, index);
                        current
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Pool {}: slot {} dial failed: {}, retrying in {:?}",
                            shared.addr,
                            index,
                            e,
                            redial_interval
                        );
                        tokio::select! {
                            _ = stopped(&mut stop) => return,
                            _ = tokio::time::sleep(redial_interval) => continue,
                        }
                    }
                }
            }
        };
        shared.set_slot(index, Some(current.clone()));

        tokio::select! {
            biased;
            _ = stopped(&mut stop) => {
                shared.set_slot(index, None);
                stop_channel(&current, &mut stop).await;
                return;
            }
            _ = current.done() => {}
        }

        shared.set_slot(index, None);
        tracing::warn!(
            "Pool {}: slot {} lost its channel, redialing in {:?}",
            shared.addr,
            index,
            redial_interval
        );
        tokio::select! {
            _ = stopped(&mut stop) => return,
            _ = tokio::time::sleep(redial_interval) => {}
        }
    }
}

async fn stopped(stop: &mut watch::Receiver<Option<StopMode>>) {
    let _ = stop.wait_for(Option::is_some).await;
}

/// Stops `channel` the way the pool is stopping; a graceful shutdown is cut
/// short if the pool is closed meanwhile.
async fn stop_channel(channel: &Channel, stop: &mut watch::Receiver<Option<StopMode>>) {
    let graceful = *stop.borrow() == Some(StopMode::Graceful);
    if graceful {
        tokio::select! {
            _ = channel.shutdown() => {}
            _ = async {
                let _ = stop.wait_for(|mode| *mode == Some(StopMode::Abrupt)).await;
            } => channel.close(),
        }
    } else {
        channel.close();
    }
    channel.done().await;
}
