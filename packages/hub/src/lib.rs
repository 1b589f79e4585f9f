#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Fan-out of chat messages between registered connections.
//!
//! Every connection's reader feeds one shared inbound channel. A single
//! consumer, [`Hub::run`], drains it and places each message on the outbound
//! queues of its recipients. The registry of connections is the only shared
//! mutable state and is never locked across a network write.

use std::sync::Arc;

use async_trait::async_trait;
use chatbox_config::Config;
use chatbox_frame::CloseCode;
use chatbox_ws::{
    ConnId, ConnectionHandle, ConnectionStream, Message, SinkClosed, StreamSink,
};
use strum_macros::AsRefStr;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::RwLock,
};
use tokio_util::sync::CancellationToken;

mod registry;

pub use registry::Registry;

/// Close reason sent to a connection superseded by a newer one for the same user.
pub const REPLACED_REASON: &str = "replaced";

/// Close reason sent to every connection when the hub shuts down.
pub const SHUTDOWN_REASON: &str = "server shutting down";

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Hub is shut down")]
    ShutDown,
}

/// Work for the fan-out consumer.
#[derive(Debug, AsRefStr)]
pub enum Command {
    /// A message to route by its `recipient_id`.
    Deliver { message: Message },
    /// `user_id` left. Everyone still connected gets a notice.
    Disconnected { user_id: String },
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// The fan-out consumer. Call and spawn [`run`](Self::run) to start delivering.
pub struct Hub {
    registry: Arc<RwLock<Registry>>,
    cmd_tx: flume::Sender<Command>,
    cmd_rx: flume::Receiver<Command>,
    broadcast_to_sender: bool,
    token: CancellationToken,
}

impl Hub {
    #[must_use]
    pub fn new(config: &Config) -> (Self, HubHandle) {
        let (cmd_tx, cmd_rx) = flume::unbounded();
        let registry = Arc::new(RwLock::new(Registry::new()));
        let token = CancellationToken::new();

        let handle = HubHandle {
            registry: registry.clone(),
            cmd_tx: cmd_tx.clone(),
            token: token.clone(),
        };

        (
            Self {
                registry,
                cmd_tx,
                cmd_rx,
                broadcast_to_sender: config.broadcast_to_sender,
                token,
            },
            handle,
        )
    }

    /// Delivers until [`HubHandle::shutdown`] is called, then closes every
    /// registered connection.
    pub async fn run(self) {
        while let Some(cmd) = tokio::select! {
            () = self.token.cancelled() => {
                log::debug!("Hub was cancelled");
                None
            }
            cmd = self.cmd_rx.recv_async() => cmd.ok(),
        } {
            self.process_command(cmd).await;
        }

        let connections = self.registry.write().await.drain();
        log::debug!("Closing {} connection(s)", connections.len());
        for connection in connections {
            if connection.close(CloseCode::GoingAway, SHUTDOWN_REASON).is_err() {
                connection.cancel();
            }
        }

        log::debug!("Stopped Hub");
    }

    async fn process_command(&self, cmd: Command) {
        chatbox_logging::debug_or_trace!(
            ("process_command: cmd={cmd}"),
            ("process_command: cmd={cmd:?}")
        );

        let message = match cmd {
            Command::Deliver { message } => message,
            Command::Disconnected { user_id } => Message::disconnected(&user_id),
        };

        let failed = self.dispatch(&message).await;

        if failed.is_empty() {
            return;
        }

        let mut registry = self.registry.write().await;
        for (user_id, conn_id) in failed {
            if let Some(connection) = registry.remove(&user_id, conn_id) {
                log::debug!("Removed unreachable user_id={user_id} conn_id={conn_id}");
                connection.cancel();
                if let Err(e) = self.cmd_tx.send(Command::Disconnected { user_id }) {
                    log::debug!("Disconnect notice not queued: {e}");
                }
            }
        }
    }

    /// Enqueues `message` for each recipient and returns the ones whose queue
    /// has closed. One failure does not stop delivery to the rest.
    async fn dispatch(&self, message: &Message) -> Vec<(String, ConnId)> {
        let registry = self.registry.read().await;

        let recipients: Vec<&ConnectionHandle> = if message.is_broadcast() {
            registry
                .iter()
                .filter(|c| self.broadcast_to_sender || c.user_id() != message.sender_id)
                .collect()
        } else {
            registry.get(&message.recipient_id).into_iter().collect()
        };

        if recipients.is_empty() {
            log::debug!(
                "dispatch: no recipients sender_id={} recipient_id={}",
                message.sender_id,
                message.recipient_id
            );
        }

        recipients
            .into_iter()
            .filter_map(|connection| match connection.send(message.clone()) {
                Ok(()) => None,
                Err(e) => {
                    log::debug!(
                        "dispatch: failed to enqueue for user_id={}: {e}",
                        connection.user_id()
                    );
                    Some((connection.user_id().to_string(), connection.conn_id()))
                }
            })
            .collect()
    }
}

/// Cloneable entry point to a running [`Hub`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    registry: Arc<RwLock<Registry>>,
    cmd_tx: flume::Sender<Command>,
    token: CancellationToken,
}

impl HubHandle {
    /// Adds an upgraded connection and starts its reader and writer.
    ///
    /// A user already connected is replaced: the older connection is closed
    /// with [`CloseCode::GoingAway`] and no disconnect notice is sent.
    ///
    /// # Errors
    ///
    /// * [`HubError::ShutDown`] if the hub has stopped. The connection is closed.
    pub async fn register<S>(&self, stream: ConnectionStream<S>) -> Result<ConnectionHandle, HubError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let handle = stream.handle();

        if self.token.is_cancelled() {
            if let Err(e) = handle.close(CloseCode::GoingAway, SHUTDOWN_REASON) {
                log::debug!("register: close after shutdown not queued: {e}");
            }
            stream.spawn(Arc::new(Detached));
            return Err(HubError::ShutDown);
        }

        let replaced = self.registry.write().await.insert(handle.clone());
        if let Some(replaced) = replaced {
            log::debug!(
                "register: user_id={} conn_id={} replaces conn_id={}",
                handle.user_id(),
                handle.conn_id(),
                replaced.conn_id()
            );
            if replaced.close(CloseCode::GoingAway, REPLACED_REASON).is_err() {
                replaced.cancel();
            }
        } else {
            log::debug!(
                "register: user_id={} conn_id={}",
                handle.user_id(),
                handle.conn_id()
            );
        }

        Ok(stream.spawn(Arc::new(self.clone())))
    }

    /// Removes `user_id` if it is still registered to `conn_id` and queues a
    /// disconnect notice. Returns whether anything was removed.
    pub async fn deregister(&self, user_id: &str, conn_id: ConnId) -> bool {
        if self.registry.write().await.remove(user_id, conn_id).is_none() {
            log::trace!("deregister: user_id={user_id} conn_id={conn_id} already gone");
            return false;
        }

        log::debug!("deregister: user_id={user_id} conn_id={conn_id}");
        if self
            .cmd_tx
            .send_async(Command::Disconnected {
                user_id: user_id.to_string(),
            })
            .await
            .is_err()
        {
            log::debug!("deregister: hub stopped, no notice for user_id={user_id}");
        }
        true
    }

    /// Routes `message` as if a connection had sent it.
    ///
    /// # Errors
    ///
    /// * [`HubError::ShutDown`] if the hub has stopped
    pub async fn publish(&self, message: Message) -> Result<(), HubError> {
        if self.token.is_cancelled() {
            return Err(HubError::ShutDown);
        }
        self.cmd_tx
            .send_async(Command::Deliver { message })
            .await
            .map_err(|_| HubError::ShutDown)
    }

    pub async fn connected_users(&self) -> Vec<String> {
        self.registry
            .read()
            .await
            .user_ids()
            .map(ToString::to_string)
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.registry.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.read().await.is_empty()
    }

    /// Stops [`Hub::run`], which then closes every connection.
    pub fn shutdown(&self) {
        log::debug!("shutdown: stopping hub");
        self.token.cancel();
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`Self::shutdown`] has been called.
    pub async fn stopped(&self) {
        self.token.cancelled().await;
    }
}

#[async_trait]
impl StreamSink for HubHandle {
    async fn deliver(&self, message: Message) -> Result<(), SinkClosed> {
        self.publish(message).await.map_err(|_| SinkClosed)
    }

    async fn closed(&self, user_id: &str, conn_id: ConnId) {
        self.deregister(user_id, conn_id).await;
    }
}

/// Sink for a connection refused after shutdown. Its reader only has to
/// drain until the Close frame is written.
struct Detached;

#[async_trait]
impl StreamSink for Detached {
    async fn deliver(&self, _message: Message) -> Result<(), SinkClosed> {
        Err(SinkClosed)
    }

    async fn closed(&self, _user_id: &str, _conn_id: ConnId) {}
}

#[cfg(test)]
mod tests {
    use chatbox_ws::Outbound;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    async fn add(handle: &HubHandle, user_id: &str, conn_id: ConnId) -> UnboundedReceiver<Outbound> {
        let (connection, rx) = ConnectionHandle::channel(user_id, conn_id);
        handle.registry.write().await.insert(connection);
        rx
    }

    fn body(outbound: Outbound) -> String {
        match outbound {
            Outbound::Message(message) => message.body_str().into_owned(),
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn broadcast_skips_the_sender_by_default() {
        let (hub, handle) = Hub::new(&Config::default());
        let mut a = add(&handle, "a", 1).await;
        let mut b = add(&handle, "b", 2).await;

        let failed = hub.dispatch(&Message::text("a", "", "hello")).await;

        assert!(failed.is_empty());
        assert_eq!(body(b.try_recv().unwrap()), "hello");
        assert!(a.try_recv().is_err());
    }

    #[test_log::test(tokio::test)]
    async fn broadcast_includes_the_sender_when_configured() {
        let (hub, handle) = Hub::new(&Config::default().with_broadcast_to_sender(true));
        let mut a = add(&handle, "a", 1).await;

        hub.dispatch(&Message::text("a", "", "echo")).await;

        assert_eq!(body(a.try_recv().unwrap()), "echo");
    }

    #[test_log::test(tokio::test)]
    async fn targeted_message_reaches_only_its_recipient() {
        let (hub, handle) = Hub::new(&Config::default());
        let mut b = add(&handle, "b", 2).await;
        let mut c = add(&handle, "c", 3).await;

        hub.dispatch(&Message::text("a", "c", "psst")).await;
        hub.dispatch(&Message::text("a", "nobody", "lost")).await;

        assert_eq!(body(c.try_recv().unwrap()), "psst");
        assert!(c.try_recv().is_err());
        assert!(b.try_recv().is_err());
    }

    #[test_log::test(tokio::test)]
    async fn closed_recipient_is_removed_without_stopping_delivery() {
        let (hub, handle) = Hub::new(&Config::default());
        let b = add(&handle, "b", 2).await;
        let mut c = add(&handle, "c", 3).await;
        drop(b);

        hub.process_command(Command::Deliver {
            message: Message::text("a", "", "still delivered"),
        })
        .await;

        assert_eq!(body(c.try_recv().unwrap()), "still delivered");
        assert_eq!(handle.connected_users().await, vec!["c".to_string()]);

        let notice = hub.cmd_rx.try_recv().unwrap();
        assert!(matches!(notice, Command::Disconnected { ref user_id } if user_id == "b"));
    }

    #[test_log::test(tokio::test)]
    async fn deregister_needs_the_matching_connection() {
        let (hub, handle) = Hub::new(&Config::default());
        let _rx = add(&handle, "a", 1).await;

        assert!(!handle.deregister("a", 99).await);
        assert!(hub.cmd_rx.is_empty());
        assert!(handle.deregister("a", 1).await);
        assert!(!handle.deregister("a", 1).await);
        assert_eq!(hub.cmd_rx.len(), 1);
        assert!(handle.is_empty().await);
    }

    #[test_log::test(tokio::test)]
    async fn disconnect_notice_goes_to_everyone_left() {
        let (hub, handle) = Hub::new(&Config::default());
        let mut a = add(&handle, "a", 1).await;
        let mut c = add(&handle, "c", 3).await;

        hub.process_command(Command::Disconnected {
            user_id: "b".to_string(),
        })
        .await;

        for rx in [&mut a, &mut c] {
            match rx.try_recv().unwrap() {
                Outbound::Message(message) => {
                    assert_eq!(message.sender_id, chatbox_ws::SERVER_SENDER_ID);
                    assert_eq!(message.body_str(), "b has disconnected");
                }
                other => panic!("expected a notice, got {other:?}"),
            }
        }
    }

    #[test_log::test(tokio::test)]
    async fn run_closes_everyone_on_shutdown() {
        let (hub, handle) = Hub::new(&Config::default());
        let mut a = add(&handle, "a", 1).await;
        assert!(!handle.is_shut_down());

        handle.shutdown();
        assert!(handle.is_shut_down());
        hub.run().await;

        assert!(matches!(
            a.try_recv().unwrap(),
            Outbound::Close(CloseCode::GoingAway, reason) if reason == SHUTDOWN_REASON
        ));
        assert!(handle.is_empty().await);
        assert!(matches!(
            handle.publish(Message::text("a", "", "late")).await,
            Err(HubError::ShutDown)
        ));
    }
}
