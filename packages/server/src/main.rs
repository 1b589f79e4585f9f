#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::Arc;

use chatbox_auth::{Sha256TokenIssuer, TokenIssuer};
use chatbox_config::Config;
use chatbox_hub::Hub;
use chatbox_logging::{ErrorLog, LogErrorLog};
use clap::Parser;

/// Websocket chat server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on. Overrides `CHATBOX_ADDR`
    #[arg(long)]
    addr: Option<String>,

    /// Deliver broadcasts back to their sender
    #[arg(long)]
    broadcast_to_sender: bool,

    /// Largest payload written into a single frame
    #[arg(long)]
    max_frame_size: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    chatbox_logging::init()?;

    let mut config = Config::from_env()?;
    if let Some(addr) = args.addr {
        config = config.with_listen_addr(addr);
    }
    if args.broadcast_to_sender {
        config = config.with_broadcast_to_sender(true);
    }
    if let Some(max_frame_size) = args.max_frame_size {
        config = config.with_max_frame_size(max_frame_size);
    }
    log::debug!(
        "Starting addr={} max_frame_size={} max_message_size={} broadcast_to_sender={}",
        config.listen_addr,
        config.max_frame_size,
        config.max_message_size,
        config.broadcast_to_sender
    );

    let issuer = match &config.token_secret {
        Some(secret) => Sha256TokenIssuer::new().with_secret(secret.clone()),
        None => Sha256TokenIssuer::new(),
    };
    let issuer: Arc<dyn TokenIssuer> = Arc::new(issuer);
    let error_log: Arc<dyn ErrorLog> = Arc::new(LogErrorLog);

    let listener = chatbox_server::bind(&config).await?;

    let (hub, handle) = Hub::new(&config);
    let hub = tokio::spawn(hub.run());

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            return;
        }
        log::info!("Received Ctrl-C, shutting down");
        shutdown.shutdown();
    });

    chatbox_server::serve(listener, handle, issuer, Arc::new(config), error_log).await;

    hub.await?;

    log::info!("Server stopped");

    Ok(())
}
