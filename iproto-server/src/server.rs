//! TCP server implementation.

use crate::error::ServerError;
use dashmap::DashMap;
use iproto_channel::{Channel, ChannelConfig, Counters, CountersSnapshot};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    /// Packet counters shared by every accepted channel.
    pub counters: Arc<Counters>,
}

impl ServerStats {
    pub fn packets(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }
}

/// TCP server for iproto.
///
/// Every accepted connection becomes a [`Channel`] built from the shared
/// [`ChannelConfig`]; its handler serves the inbound requests.
pub struct Server {
    config: ChannelConfig,
    stats: Arc<ServerStats>,
    channels: Arc<DashMap<Uuid, Channel>>,
    shutdown: watch::Sender<bool>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ChannelConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            stats: Arc::new(ServerStats::default()),
            channels: Arc::new(DashMap::new()),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Serves `listener` until [`Server::shutdown`] is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.serve_with_shutdown(listener, std::future::pending())
            .await
    }

    /// Serves `listener` until `signal` resolves or [`Server::shutdown`] is
    /// called, then shuts every live channel down gracefully and returns once
    /// they are all closed.
    pub async fn serve_with_shutdown(
        &self,
        listener: TcpListener,
        signal: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", local_addr);

        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::pin!(signal);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = &mut signal => {
                    tracing::info!("Server shutting down");
                    break;
                }
                _ = stopped(&mut shutdown_rx) => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        drop(listener);
        self.drain().await;
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Server on {} stopped", local_addr);
        Ok(())
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("[{}] failed to set TCP_NODELAY: {}", addr, e);
        }

        let channel = match Channel::new(stream, self.config.clone(), self.stats.counters.clone()) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!("[{}] failed to start channel: {}", addr, e);
                return;
            }
        };

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Client connected: {}", addr);

        let id = channel.id();
        self.channels.insert(id, channel.clone());

        let channels = self.channels.clone();
        let stats = self.stats.clone();
        channel.on_close(move || {
            channels.remove(&id);
            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            tracing::info!("Client disconnected: {}", addr);
        });
    }

    async fn drain(&self) {
        let live: Vec<Channel> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if live.is_empty() {
            return;
        }

        tracing::info!("Draining {} channels", live.len());
        let mut drains = JoinSet::new();
        for channel in live {
            drains.spawn(async move { channel.shutdown().await });
        }
        while let Some(result) = drains.join_next().await {
            if let Err(e) = result {
                tracing::error!("Channel drain task failed: {}", e);
            }
        }
    }

    /// Signals the server to shut down.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Number of live channels.
    pub fn connection_count(&self) -> usize {
        self.channels.len()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("connections", &self.channels.len())
            .field("running", &self.is_running())
            .finish()
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use iproto_channel::{BytePool, ChannelError, ServeMux};
    use iproto_protocol::{response_to, Packet};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio_test::assert_ok;

    const ECHO: u32 = 1;
    const SLOW: u32 = 2;

    fn server_config() -> ChannelConfig {
        let mux = ServeMux::new();
        mux.handle_fn(ECHO, |conn: Channel, packet: Packet| async move {
            let _ = conn.send(response_to(&packet, packet.data.clone())).await;
        })
        .unwrap();
        mux.handle_fn(SLOW, |conn: Channel, packet: Packet| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = conn.send(response_to(&packet, packet.data.clone())).await;
        })
        .unwrap();
        ChannelConfig::new()
            .with_handler(mux)
            .with_byte_pool(BytePool::disabled())
    }

    async fn start() -> (Arc<Server>, SocketAddr, JoinHandle<Result<(), ServerError>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(server_config()));
        let serving = server.clone();
        let handle = tokio::spawn(async move { serving.serve(listener).await });
        (server, addr, handle)
    }

    async fn connect(addr: SocketAddr) -> Channel {
        Channel::connect(addr, ChannelConfig::new(), Arc::new(Counters::new()))
            .await
            .unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_server_stats() {
        let server = Server::new(ChannelConfig::new());
        assert!(!server.is_running());
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 0);
        assert_eq!(server.stats().packets().packets_received, 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_echo_and_connection_tracking() {
        let (server, addr, handle) = start().await;
        let client = connect(addr).await;

        let response = client.call(ECHO, Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(response.as_ref(), b"hi");
        assert!(server.is_running());
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);
        assert_eq!(server.stats().connections_active.load(Ordering::Relaxed), 1);
        assert_eq!(server.stats().packets().packets_received, 1);
        assert_eq!(server.connection_count(), 1);

        client.close();
        client.done().await;
        wait_until(|| server.connection_count() == 0).await;
        assert_eq!(server.stats().connections_active.load(Ordering::Relaxed), 0);
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);

        server.shutdown();
        assert_ok!(handle.await.unwrap());
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_ping() {
        let (server, addr, handle) = start().await;
        let client = connect(addr).await;
        client.ping().await.unwrap();

        server.shutdown();
        assert_ok!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_requests() {
        let (server, addr, handle) = start().await;
        let client = connect(addr).await;
        wait_until(|| server.connection_count() == 1).await;

        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.call(SLOW, Bytes::from_static(b"slow")).await })
        };
        wait_until(|| client.pending_count() == 1).await;

        server.shutdown();
        let response = call.await.unwrap().unwrap();
        assert_eq!(response.as_ref(), b"slow");

        assert_ok!(handle.await.unwrap());
        assert_eq!(server.connection_count(), 0);

        // The server closed the connection once drained.
        tokio::time::timeout(Duration::from_secs(5), client.done())
            .await
            .unwrap();
        assert!(matches!(
            client.call(ECHO, Bytes::new()).await,
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_serve_with_shutdown_signal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(server_config()));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let serving = server.clone();
        let handle = tokio::spawn(async move {
            serving
                .serve_with_shutdown(listener, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let client = connect(addr).await;
        client.call(ECHO, Bytes::from_static(b"x")).await.unwrap();

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!server.is_running());

        // The listener is gone.
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_registry_tracks_accepted_channel() {
        let (server, addr, handle) = start().await;
        let client = connect(addr).await;
        wait_until(|| server.connection_count() == 1).await;

        let accepted = server
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .next()
            .unwrap();
        assert_eq!(accepted.remote_addr(), client.local_addr());

        server.shutdown();
        assert_ok!(handle.await.unwrap());
    }
}
