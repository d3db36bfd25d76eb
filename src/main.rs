//! iproto - demo server
//!
//! Serves an echo handler over the iproto protocol until Ctrl-C.

use iproto_channel::{Channel, ServeMux};
use iproto_protocol::{response_to, Packet};
use iproto_server::{Config, Server};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Echoes the request body back.
const MESSAGE_ECHO: u32 = 1;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if IPROTO_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("IPROTO_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Starting iproto server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max body length: {} bytes", config.channel.max_body_len);
    tracing::info!(
        "  Shutdown timeout: {:?}",
        config.channel.shutdown_timeout()
    );
    tracing::info!(
        "  Byte pool: {}",
        if config.channel.byte_pool {
            "enabled"
        } else {
            "disabled"
        }
    );

    let mux = ServeMux::new();
    mux.handle_fn(MESSAGE_ECHO, |conn: Channel, packet: Packet| async move {
        if let Err(e) = conn.send(response_to(&packet, packet.data.clone())).await {
            tracing::debug!("Echo to {} failed: {}", conn.remote_addr(), e);
        }
    })?;

    let server = Server::new(config.channel.channel_config(mux));
    let listener = TcpListener::bind(config.network.bind_addr).await?;

    // Run server (blocks until Ctrl-C and every channel has drained)
    server
        .serve_with_shutdown(listener, async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Received shutdown signal, stopping server...");
        })
        .await?;

    let packets = server.stats().packets();
    tracing::info!(
        "Server stopped ({} packets received, {} sent)",
        packets.packets_received,
        packets.packets_sent
    );
    Ok(())
}
