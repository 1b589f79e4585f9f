#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! TCP listener that hands upgraded connections to the hub.

use std::sync::Arc;

use chatbox_auth::TokenIssuer;
use chatbox_config::Config;
use chatbox_hub::HubHandle;
use chatbox_logging::{ErrorLog, report};
use chatbox_ws::ConnectionStream;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Binds the configured listen address.
///
/// # Errors
///
/// * [`ServeError::Bind`] if the address is invalid or already in use
pub async fn bind(config: &Config) -> Result<TcpListener, ServeError> {
    TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|source| ServeError::Bind {
            addr: config.listen_addr.clone(),
            source,
        })
}

/// Accepts connections until the hub shuts down.
///
/// Each socket is upgraded on its own task, so a slow client never holds up
/// the next accept. Failed accepts are logged and the loop keeps going.
pub async fn serve(
    listener: TcpListener,
    hub: HubHandle,
    issuer: Arc<dyn TokenIssuer>,
    config: Arc<Config>,
    error_log: Arc<dyn ErrorLog>,
) {
    match listener.local_addr() {
        Ok(addr) => log::info!("Listening on {addr}"),
        Err(e) => log::warn!("Listening on unknown address: {e}"),
    }

    loop {
        let (socket, addr) = tokio::select! {
            () = hub.stopped() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    report(error_log.as_ref(), &format!("Failed to accept connection: {e}"));
                    continue;
                }
            },
        };

        log::debug!("serve: accepted addr={addr}");

        tokio::spawn(handle_socket(
            socket,
            hub.clone(),
            issuer.clone(),
            config.clone(),
            error_log.clone(),
        ));
    }

    log::debug!("serve: stopped accepting");
}

async fn handle_socket(
    socket: TcpStream,
    hub: HubHandle,
    issuer: Arc<dyn TokenIssuer>,
    config: Arc<Config>,
    error_log: Arc<dyn ErrorLog>,
) {
    if let Err(e) = socket.set_nodelay(true) {
        log::debug!("handle_socket: failed to set nodelay: {e}");
    }

    let stream = match ConnectionStream::accept(socket, &config, issuer.as_ref(), error_log).await {
        Ok(stream) => stream,
        Err(e) => {
            log::debug!("handle_socket: handshake rejected: {e}");
            return;
        }
    };

    if let Err(e) = hub.register(stream).await {
        log::debug!("handle_socket: not registered: {e}");
    }
}
