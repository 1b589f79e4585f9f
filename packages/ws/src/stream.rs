//! A single upgraded connection and the tasks that drive it.
//!
//! After the handshake the socket is split. The inbound half yields decoded
//! messages and answers Ping and Close on its own. The outbound half is a
//! writer task draining the connection's queue, so nothing that enqueues a
//! message ever waits on the network.

use std::{pin::pin, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use chatbox_auth::TokenIssuer;
use chatbox_config::Config;
use chatbox_frame::{CloseCode, FrameError, OpCode, close_payload, encode, parse_close_payload};
use chatbox_logging::{ErrorLog, report};
use futures::{Stream, StreamExt as _};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader, BufWriter, ReadHalf, WriteHalf},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::{
    ConnId,
    handshake::{HandshakeError, Negotiator},
    models::Message,
    reassembler::{MessageReader, ReadError, Received, decode_message},
};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Connection closed")]
    Closed,
}

/// Work queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Message(Message),
    Pong(Bytes),
    /// Written last. The writer shuts the socket down afterwards.
    Close(CloseCode, String),
}

#[derive(Debug, Error)]
#[error("Message sink closed")]
pub struct SinkClosed;

/// Where a running connection hands its inbound messages.
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// # Errors
    ///
    /// * If the sink no longer accepts messages
    async fn deliver(&self, message: Message) -> Result<(), SinkClosed>;

    /// Called once, after the connection's reader has stopped.
    async fn closed(&self, user_id: &str, conn_id: ConnId);
}

/// Cloneable handle to a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    user_id: String,
    conn_id: ConnId,
    outbound: mpsc::UnboundedSender<Outbound>,
    token: CancellationToken,
}

impl ConnectionHandle {
    /// A handle whose outbound queue is drained by the caller instead of a
    /// writer task.
    #[must_use]
    pub fn channel(
        user_id: impl Into<String>,
        conn_id: ConnId,
    ) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                user_id: user_id.into(),
                conn_id,
                outbound,
                token: CancellationToken::new(),
            },
            rx,
        )
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub const fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Queues `message` for this connection's writer.
    ///
    /// # Errors
    ///
    /// * [`StreamError::Closed`] if the connection has shut down
    pub fn send(&self, message: Message) -> Result<(), StreamError> {
        self.enqueue(Outbound::Message(message))
    }

    /// Queues a Close frame. The connection ends once it is written.
    ///
    /// # Errors
    ///
    /// * [`StreamError::Closed`] if the connection has shut down
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) -> Result<(), StreamError> {
        self.enqueue(Outbound::Close(code, reason.into()))
    }

    /// Stops both tasks without writing anything further.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.outbound.is_closed()
    }

    fn enqueue(&self, outbound: Outbound) -> Result<(), StreamError> {
        if self.token.is_cancelled() {
            return Err(StreamError::Closed);
        }
        self.outbound.send(outbound).map_err(|_| StreamError::Closed)
    }
}

/// Inbound half of a connection: a lazy sequence of decoded messages.
struct Inbound<S> {
    user_id: String,
    reader: MessageReader<BufReader<ReadHalf<S>>>,
    handle: ConnectionHandle,
    error_log: Arc<dyn ErrorLog>,
    finished: bool,
}

impl<S> Inbound<S>
where
    S: AsyncRead + Send + Unpin + 'static,
{
    /// Waits for the next Text message addressed to the hub.
    ///
    /// Ping, Close, Pong, Binary and empty messages are handled here and never
    /// returned. `Ok(None)` means the connection is over.
    ///
    /// # Errors
    ///
    /// * If the transport fails or the peer breaks the protocol. A Close
    ///   frame is queued first for protocol violations.
    pub async fn next_message(&mut self) -> Result<Option<Message>, StreamError> {
        if self.finished {
            return Ok(None);
        }

        loop {
            let received = tokio::select! {
                () = self.handle.token.cancelled() => {
                    self.finished = true;
                    return Ok(None);
                }
                received = self.reader.next() => received,
            };

            let raw = match received {
                Ok(Some(Received::Message(raw))) => raw,
                Ok(Some(Received::NoData)) => {
                    log::trace!("next_message: user_id={} empty message", self.user_id);
                    continue;
                }
                Ok(None) => {
                    log::debug!("next_message: user_id={} peer hung up", self.user_id);
                    self.finished = true;
                    self.handle.cancel();
                    return Ok(None);
                }
                Err(e) => {
                    self.fail(&e);
                    return Err(e.into());
                }
            };

            match raw.kind {
                OpCode::Text => match decode_message(&raw, &self.user_id) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => report(
                        self.error_log.as_ref(),
                        &format!("Dropping message from {}: {e}", self.user_id),
                    ),
                },
                OpCode::Ping => {
                    if self.handle.enqueue(Outbound::Pong(raw.body)).is_err() {
                        self.finished = true;
                        return Ok(None);
                    }
                }
                OpCode::Close => {
                    match parse_close_payload(&raw.body) {
                        Some((code, reason)) => log::debug!(
                            "next_message: user_id={} closed code={code} reason={reason}",
                            self.user_id
                        ),
                        None => log::debug!("next_message: user_id={} closed", self.user_id),
                    }
                    self.finished = true;
                    if self.handle.close(CloseCode::Normal, "").is_err() {
                        self.handle.cancel();
                    }
                    return Ok(None);
                }
                OpCode::Pong | OpCode::Binary | OpCode::Continuation => {
                    log::trace!(
                        "next_message: user_id={} ignoring {} size={}",
                        self.user_id,
                        raw.kind,
                        raw.body.len()
                    );
                }
            }
        }
    }

    /// The same sequence as [`Self::next_message`], ending after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Message, StreamError>> + Send {
        futures::stream::unfold(Some(self), |inbound| async move {
            let mut inbound = inbound?;
            match inbound.next_message().await {
                Ok(Some(message)) => Some((Ok(message), Some(inbound))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    fn fail(&mut self, error: &ReadError) {
        self.finished = true;
        report(
            self.error_log.as_ref(),
            &format!("Connection {} failed: {error}", self.user_id),
        );

        if error.is_protocol_violation() {
            let reason = error.to_string();
            if self.handle.close(error.close_code(), reason).is_ok() {
                return;
            }
        }
        self.handle.cancel();
    }
}

/// Outbound half of a connection: drains the queue onto the socket.
struct Writer<S> {
    user_id: String,
    writer: BufWriter<WriteHalf<S>>,
    rx: mpsc::UnboundedReceiver<Outbound>,
    token: CancellationToken,
    max_frame_size: usize,
    error_log: Arc<dyn ErrorLog>,
}

impl<S> Writer<S>
where
    S: AsyncWrite + Send + Unpin + 'static,
{
    async fn run(mut self) {
        loop {
            let outbound = tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                outbound = self.rx.recv() => match outbound {
                    Some(outbound) => outbound,
                    None => break,
                },
            };

            let closing = matches!(outbound, Outbound::Close(..));

            if let Err(e) = self.write(outbound).await {
                report(
                    self.error_log.as_ref(),
                    &format!("Write to {} failed: {e}", self.user_id),
                );
                break;
            }

            if closing {
                if let Err(e) = self.writer.shutdown().await {
                    log::debug!("run: user_id={} shutdown failed: {e}", self.user_id);
                }
                break;
            }
        }

        log::debug!("run: user_id={} writer stopped", self.user_id);
        self.token.cancel();
    }

    async fn write(&mut self, outbound: Outbound) -> Result<(), StreamError> {
        let bytes = match outbound {
            Outbound::Message(message) => {
                let wire = match message.to_wire() {
                    Ok(wire) => wire,
                    Err(e) => {
                        report(
                            self.error_log.as_ref(),
                            &format!("Dropping message to {}: {e}", self.user_id),
                        );
                        return Ok(());
                    }
                };
                chatbox_logging::debug_or_trace!(
                    ("write: user_id={} size={}", self.user_id, wire.len()),
                    ("write: user_id={} message={wire}", self.user_id)
                );
                encode(OpCode::Text, wire.as_bytes(), self.max_frame_size)?
            }
            Outbound::Pong(payload) => encode(OpCode::Pong, &payload, self.max_frame_size)?,
            Outbound::Close(code, reason) => {
                log::debug!("write: user_id={} close code={code}", self.user_id);
                encode(
                    OpCode::Close,
                    &close_payload(code, &reason),
                    self.max_frame_size,
                )?
            }
        };

        self.writer.write_all(&bytes).await?;
        if self.rx.is_empty() {
            self.writer.flush().await?;
        }

        Ok(())
    }
}

/// An accepted, upgraded connection that has not started running yet.
pub struct ConnectionStream<S> {
    inbound: Inbound<S>,
    writer: Writer<S>,
}

impl<S> ConnectionStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Performs the handshake on `socket` and prepares both halves.
    ///
    /// On rejection the socket is dropped, which closes it.
    ///
    /// # Errors
    ///
    /// * If the handshake is rejected or the socket fails during it
    pub async fn accept(
        socket: S,
        config: &Config,
        issuer: &dyn TokenIssuer,
        error_log: Arc<dyn ErrorLog>,
    ) -> Result<Self, HandshakeError> {
        let (read, write) = tokio::io::split(socket);
        let mut reader = BufReader::new(read);
        let mut writer = BufWriter::new(write);

        let mut negotiator = Negotiator::new(config.credential_header.as_str());
        let user_id = match negotiator.negotiate(&mut reader, &mut writer, issuer).await {
            Ok(user_id) => user_id,
            Err(e) => {
                report(error_log.as_ref(), &format!("Handshake rejected: {e}"));
                return Err(e);
            }
        };

        let conn_id = rand::random::<ConnId>();
        let (handle, rx) = ConnectionHandle::channel(user_id.clone(), conn_id);
        let token = handle.token.clone();

        log::info!("Connection open user_id={user_id} conn_id={conn_id}");

        Ok(Self {
            inbound: Inbound {
                user_id: user_id.clone(),
                reader: MessageReader::new(reader).with_max_message_size(config.max_message_size),
                handle,
                error_log: error_log.clone(),
                finished: false,
            },
            writer: Writer {
                user_id,
                writer,
                rx,
                token,
                max_frame_size: config.max_frame_size,
                error_log,
            },
        })
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.inbound.user_id
    }

    #[must_use]
    pub const fn conn_id(&self) -> ConnId {
        self.inbound.handle.conn_id
    }

    #[must_use]
    pub fn handle(&self) -> ConnectionHandle {
        self.inbound.handle.clone()
    }

    /// Starts the writer task and hands back the inbound messages, for callers
    /// that drive the connection themselves. Ping and Close are still answered.
    pub fn into_stream(self) -> impl Stream<Item = Result<Message, StreamError>> + Send {
        tokio::spawn(self.writer.run());
        self.inbound.into_stream()
    }

    /// Starts the writer task and a reader task feeding `sink`.
    ///
    /// The reader calls [`StreamSink::closed`] exactly once when it stops.
    pub fn spawn(self, sink: Arc<dyn StreamSink>) -> ConnectionHandle {
        let Self { inbound, writer } = self;
        let handle = inbound.handle.clone();

        tokio::spawn(writer.run());

        let user_id = handle.user_id.clone();
        let conn_id = handle.conn_id;
        let control = handle.clone();

        tokio::spawn(async move {
            let mut messages = pin!(inbound.into_stream());

            while let Some(next) = messages.next().await {
                match next {
                    Ok(message) => {
                        if sink.deliver(message).await.is_err() {
                            log::debug!("spawn: user_id={user_id} sink closed");
                            if control.close(CloseCode::GoingAway, "server shutting down").is_err() {
                                control.cancel();
                            }
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("spawn: user_id={user_id} conn_id={conn_id} ended: {e}");
                        break;
                    }
                }
            }

            sink.closed(&user_id, conn_id).await;
            log::info!("Connection closed user_id={user_id} conn_id={conn_id}");
        });

        handle
    }
}
