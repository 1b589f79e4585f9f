//! Client end of a connection. Sends masked frames and expects unmasked ones.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chatbox_frame::{CloseCode, FrameCodec, FrameError, OpCode, close_payload, encode_masked};
use thiserror::Error;
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader, ReadHalf, WriteHalf,
};

use crate::{
    handshake::{HandshakeError, accept_key, read_head},
    models::{InboundPayload, OutboundPayload},
    reassembler::{MessageReader, RawMessage, ReadError, Received},
};

/// Frames written by the client are split at this size.
const CLIENT_MAX_FRAME_SIZE: usize = 0x200;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Upgrade refused: {0}")]
    Refused(String),
    #[error("Sec-WebSocket-Accept mismatch")]
    AcceptMismatch,
}

pub struct Client<S> {
    reader: MessageReader<BufReader<ReadHalf<S>>>,
    writer: WriteHalf<S>,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Sends the upgrade request with `credential` in `credential_header` and
    /// waits for `101 Switching Protocols`.
    ///
    /// # Errors
    ///
    /// * If the server refuses the upgrade or answers with the wrong accept key
    /// * If the socket fails
    pub async fn connect(
        socket: S,
        credential_header: &str,
        credential: &str,
    ) -> Result<Self, ClientError> {
        let (read, mut writer) = tokio::io::split(socket);
        let mut reader = BufReader::new(read);

        let key = STANDARD.encode(rand::random::<[u8; 16]>());
        let request = format!(
            "GET / HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             {credential_header}: {credential}\r\n\
             \r\n"
        );
        writer.write_all(request.as_bytes()).await?;
        writer.flush().await?;

        let head = read_head(&mut reader).await?;
        if head.start_line.split_whitespace().nth(1) != Some("101") {
            return Err(ClientError::Refused(head.start_line));
        }
        if head.header("Sec-WebSocket-Accept") != Some(accept_key(&key).as_str()) {
            return Err(ClientError::AcceptMismatch);
        }

        Ok(Self {
            reader: MessageReader::with_codec(reader, FrameCodec::client()),
            writer,
        })
    }

    /// Sends a JSON payload addressed to `recipient_id`, or broadcast when empty.
    ///
    /// # Errors
    ///
    /// * If the socket fails
    pub async fn send_text(&mut self, recipient_id: &str, body: &str) -> Result<(), ClientError> {
        let payload = serde_json::to_vec(&InboundPayload {
            recipient_id: recipient_id.to_string(),
            body: body.to_string(),
        })?;
        self.send(OpCode::Text, &payload).await
    }

    /// # Errors
    ///
    /// * If `payload` is too large for a control frame
    /// * If the socket fails
    pub async fn send(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), ClientError> {
        let bytes = encode_masked(opcode, payload, CLIENT_MAX_FRAME_SIZE, mask_key())?;
        self.send_raw(&bytes).await
    }

    /// Writes `bytes` to the socket untouched.
    ///
    /// # Errors
    ///
    /// * If the socket fails
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Sends a Normal Close frame.
    ///
    /// # Errors
    ///
    /// * If the socket fails
    pub async fn close(&mut self) -> Result<(), ClientError> {
        self.send(OpCode::Close, &close_payload(CloseCode::Normal, "bye"))
            .await
    }

    /// Next message of any kind, control frames included. Empty data
    /// messages are skipped. `Ok(None)` once the server closes the socket.
    ///
    /// # Errors
    ///
    /// * If the socket fails or the server sends invalid frames
    pub async fn recv(&mut self) -> Result<Option<RawMessage>, ClientError> {
        loop {
            match self.reader.next().await? {
                Some(Received::Message(raw)) => return Ok(Some(raw)),
                Some(Received::NoData) => {}
                None => return Ok(None),
            }
        }
    }

    /// Next Text message, parsed. Pings, Pongs and Close frames are skipped.
    ///
    /// # Errors
    ///
    /// * If the socket fails or the payload is not valid JSON
    pub async fn recv_payload(&mut self) -> Result<Option<OutboundPayload>, ClientError> {
        while let Some(raw) = self.recv().await? {
            if raw.kind == OpCode::Text {
                return Ok(Some(serde_json::from_slice(&raw.body)?));
            }
            log::trace!("recv_payload: skipping {}", raw.kind);
        }
        Ok(None)
    }
}

fn mask_key() -> [u8; 4] {
    loop {
        let key = rand::random::<[u8; 4]>();
        if key != [0; 4] {
            return key;
        }
    }
}

#[cfg(test)]
mod tests {
    use chatbox_auth::{Sha256TokenIssuer, TokenIssuer as _};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::handshake::Negotiator;

    #[test_log::test]
    fn mask_keys_are_never_zero() {
        for _ in 0..1000 {
            assert_ne!(mask_key(), [0; 4]);
        }
    }

    #[test_log::test(tokio::test)]
    async fn connect_completes_against_the_negotiator() {
        let (server, client) = tokio::io::duplex(4096);
        let (read, mut write) = tokio::io::split(server);
        let mut read = BufReader::new(read);
        let issuer = Sha256TokenIssuer::new();
        let mut negotiator = Negotiator::new("X-Credential");

        let (user_id, client) = tokio::join!(
            negotiator.negotiate(&mut read, &mut write, &issuer),
            Client::connect(client, "X-Credential", "alice"),
        );

        assert!(client.is_ok());
        assert_eq!(user_id.unwrap(), issuer.issue(b"alice").unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn refused_upgrade_is_reported() {
        let (mut server, client) = tokio::io::duplex(4096);
        server
            .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
            .await
            .unwrap();

        let result = Client::connect(client, "Authorization", "alice").await;

        assert!(matches!(result, Err(ClientError::Refused(line)) if line.contains("400")));
    }
}
