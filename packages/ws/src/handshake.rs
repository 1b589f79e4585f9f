//! HTTP upgrade from a plain socket to a websocket connection.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chatbox_auth::{TokenError, TokenIssuer};
use sha1::{Digest as _, Sha1};
use strum_macros::AsRefStr;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// Appended to the client's key before hashing, as fixed by RFC 6455.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the request line plus all header lines.
pub const MAX_HEADER_BYTES: usize = 8192;

pub const MAX_HEADERS: usize = 64;

/// Misspelled credential header sent by older clients.
const LEGACY_CREDENTIAL_HEADER: &str = "Autorization";

const SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum RejectReason {
    MissingKey,
    MissingCredential,
    MalformedRequest,
    HeadersTooLarge,
    TokenIssuance,
    Io,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    Open { user_id: String },
    Rejected(RejectReason),
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("Missing {0} header")]
    MissingCredential(String),
    #[error("Malformed request: {0}")]
    Malformed(String),
    #[error("Request head exceeds {} bytes or {} headers", MAX_HEADER_BYTES, MAX_HEADERS)]
    HeadersTooLarge,
    #[error(transparent)]
    Token(#[from] TokenError),
}

impl HandshakeError {
    #[must_use]
    pub const fn reason(&self) -> RejectReason {
        match self {
            Self::Io(_) => RejectReason::Io,
            Self::MissingKey => RejectReason::MissingKey,
            Self::MissingCredential(_) => RejectReason::MissingCredential,
            Self::Malformed(_) => RejectReason::MalformedRequest,
            Self::HeadersTooLarge => RejectReason::HeadersTooLarge,
            Self::Token(_) => RejectReason::TokenIssuance,
        }
    }
}

/// `Sec-WebSocket-Accept` value for a client's `Sec-WebSocket-Key`.
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.trim().as_bytes());
    sha.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(sha.finalize())
}

/// Start line and headers of an HTTP request or response.
#[derive(Debug, Clone, Default)]
pub struct Head {
    pub start_line: String,
    pub headers: Vec<(String, String)>,
}

impl Head {
    /// Value of the first header called `name`, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Reads an HTTP start line and the header block that follows it.
///
/// # Errors
///
/// * If the stream fails or closes before the blank line ending the headers
/// * If the head is larger than [`MAX_HEADER_BYTES`] or has more than [`MAX_HEADERS`] headers
/// * If a header line has no `:` or is not UTF-8
pub async fn read_head<R>(reader: &mut R) -> Result<Head, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEADER_BYTES;

    let start_line = read_line(reader, &mut budget).await?;
    if start_line.is_empty() {
        return Err(HandshakeError::Malformed("empty start line".to_string()));
    }

    let mut headers: Vec<(String, String)> = vec![];

    loop {
        let line = read_line(reader, &mut budget).await?;
        if line.is_empty() {
            break;
        }

        if line.starts_with([' ', '\t']) {
            let Some((_, value)) = headers.last_mut() else {
                return Err(HandshakeError::Malformed(
                    "continuation line before any header".to_string(),
                ));
            };
            value.push(' ');
            value.push_str(line.trim());
            continue;
        }

        if headers.len() == MAX_HEADERS {
            return Err(HandshakeError::HeadersTooLarge);
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(HandshakeError::Malformed(format!(
                "header line without ':' ({line})"
            )));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Head {
        start_line,
        headers,
    })
}

async fn read_line<R>(reader: &mut R, budget: &mut usize) -> Result<String, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let limit = u64::try_from(*budget).unwrap_or(u64::MAX);
    let read = (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;

    if line.last() != Some(&b'\n') {
        if read >= *budget {
            return Err(HandshakeError::HeadersTooLarge);
        }
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed during handshake",
        )
        .into());
    }
    *budget -= read;

    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }

    String::from_utf8(line).map_err(|_| HandshakeError::Malformed("non UTF-8 header".to_string()))
}

/// Runs the server side of the upgrade and remembers how it ended.
#[derive(Debug, Clone)]
pub struct Negotiator {
    credential_header: String,
    state: HandshakeState,
}

impl Negotiator {
    #[must_use]
    pub fn new(credential_header: impl Into<String>) -> Self {
        Self {
            credential_header: credential_header.into(),
            state: HandshakeState::Connecting,
        }
    }

    #[must_use]
    pub const fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Reads the upgrade request, issues the session token and answers with
    /// `101 Switching Protocols`. Returns the token, which becomes the
    /// connection's user id.
    ///
    /// Nothing is written when the request is rejected. Closing the socket is
    /// left to the caller.
    ///
    /// # Errors
    ///
    /// * If the request is missing `Sec-WebSocket-Key` or the credential header
    /// * If the token issuer refuses the credential
    /// * If reading the request or writing the response fails
    pub async fn negotiate<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        issuer: &dyn TokenIssuer,
    ) -> Result<String, HandshakeError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if self.state != HandshakeState::Connecting {
            return Err(HandshakeError::Malformed(
                "handshake already completed".to_string(),
            ));
        }

        let result = self.upgrade(reader, writer, issuer).await;

        self.state = match &result {
            Ok(user_id) => HandshakeState::Open {
                user_id: user_id.clone(),
            },
            Err(e) => HandshakeState::Rejected(e.reason()),
        };

        result
    }

    async fn upgrade<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        issuer: &dyn TokenIssuer,
    ) -> Result<String, HandshakeError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let head = read_head(reader).await?;
        log::trace!("upgrade: request_line={}", head.start_line);

        let key = head
            .header(SEC_WEBSOCKET_KEY)
            .filter(|key| !key.is_empty())
            .ok_or(HandshakeError::MissingKey)?;

        let credential = head
            .header(&self.credential_header)
            .or_else(|| head.header(LEGACY_CREDENTIAL_HEADER))
            .filter(|credential| !credential.is_empty())
            .ok_or_else(|| HandshakeError::MissingCredential(self.credential_header.clone()))?;

        let accept = accept_key(key);
        let user_id = issuer.issue(credential.as_bytes())?;

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\
             \r\n"
        );
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;

        log::debug!("upgrade: connection open user_id={user_id}");

        Ok(user_id)
    }
}

#[cfg(test)]
mod tests {
    use chatbox_auth::Sha256TokenIssuer;
    use pretty_assertions::assert_eq;
    use tokio::io::BufReader;

    use super::*;

    fn request(headers: &[(&str, &str)]) -> Vec<u8> {
        let mut request = "GET /chat HTTP/1.1\r\nHost: localhost\r\n".to_string();
        for (name, value) in headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");
        request.into_bytes()
    }

    async fn negotiate(request: Vec<u8>) -> (Negotiator, Result<String, HandshakeError>, Vec<u8>) {
        let mut negotiator = Negotiator::new("Authorization");
        let mut reader = BufReader::new(std::io::Cursor::new(request));
        let mut writer = Vec::new();
        let result = negotiator
            .negotiate(&mut reader, &mut writer, &Sha256TokenIssuer::new())
            .await;
        (negotiator, result, writer)
    }

    #[test_log::test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test_log::test(tokio::test)]
    async fn successful_upgrade_writes_101_and_returns_the_token() {
        let (negotiator, result, written) = negotiate(request(&[
            ("Upgrade", "websocket"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("Authorization", "alice"),
        ]))
        .await;

        let user_id = result.unwrap();
        assert_eq!(user_id, Sha256TokenIssuer::new().issue(b"alice").unwrap());
        assert_eq!(
            negotiator.state(),
            &HandshakeState::Open {
                user_id: user_id.clone()
            }
        );

        let response = String::from_utf8(written).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Upgrade: websocket\r\n"));
        assert!(response.contains("Connection: Upgrade\r\n"));
        assert!(response.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test_log::test(tokio::test)]
    async fn header_names_are_case_insensitive() {
        let (_, result, _) = negotiate(request(&[
            ("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("AUTHORIZATION", "alice"),
        ]))
        .await;
        assert!(result.is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn legacy_credential_header_is_accepted() {
        let (_, result, _) = negotiate(request(&[
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("Autorization", "alice"),
        ]))
        .await;
        assert!(result.is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn missing_key_is_rejected_silently() {
        let (negotiator, result, written) = negotiate(request(&[("Authorization", "alice")])).await;

        assert!(matches!(result, Err(HandshakeError::MissingKey)));
        assert_eq!(
            negotiator.state(),
            &HandshakeState::Rejected(RejectReason::MissingKey)
        );
        assert!(written.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn missing_credential_is_rejected_silently() {
        let (negotiator, result, written) =
            negotiate(request(&[("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")])).await;

        assert!(matches!(result, Err(HandshakeError::MissingCredential(_))));
        assert_eq!(
            negotiator.state(),
            &HandshakeState::Rejected(RejectReason::MissingCredential)
        );
        assert!(written.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn token_issuance_failure_rejects_the_handshake() {
        let mut negotiator = Negotiator::new("Authorization");
        let mut reader = BufReader::new(std::io::Cursor::new(request(&[
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("Authorization", "alice"),
        ])));
        let mut writer = Vec::new();
        let refuse = |_: &[u8]| -> Result<String, TokenError> {
            Err(TokenError::Issuer("store unavailable".to_string()))
        };

        let result = negotiator.negotiate(&mut reader, &mut writer, &refuse).await;

        assert!(matches!(result, Err(HandshakeError::Token(_))));
        assert_eq!(
            negotiator.state(),
            &HandshakeState::Rejected(RejectReason::TokenIssuance)
        );
        assert!(writer.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn truncated_request_is_an_io_error() {
        let (negotiator, result, _) =
            negotiate(b"GET / HTTP/1.1\r\nSec-WebSocket-Key: abc\r\n".to_vec()).await;

        assert!(matches!(result, Err(HandshakeError::Io(_))));
        assert_eq!(
            negotiator.state(),
            &HandshakeState::Rejected(RejectReason::Io)
        );
    }

    #[test_log::test(tokio::test)]
    async fn oversized_head_is_rejected() {
        let filler = "x".repeat(MAX_HEADER_BYTES);
        let (_, result, _) = negotiate(request(&[("X-Filler", &filler)])).await;
        assert!(matches!(result, Err(HandshakeError::HeadersTooLarge)));
    }

    #[test_log::test(tokio::test)]
    async fn too_many_headers_are_rejected() {
        let names: Vec<String> = (0..=MAX_HEADERS).map(|i| format!("X-Header-{i}")).collect();
        let headers: Vec<(&str, &str)> = names.iter().map(|name| (name.as_str(), "1")).collect();
        let (_, result, _) = negotiate(request(&headers)).await;
        assert!(matches!(result, Err(HandshakeError::HeadersTooLarge)));
    }

    #[test_log::test(tokio::test)]
    async fn bytes_after_the_head_stay_in_the_reader() {
        let mut bytes = request(&[
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("Authorization", "alice"),
        ]);
        bytes.extend_from_slice(b"frame bytes");

        let mut reader = BufReader::new(std::io::Cursor::new(bytes));
        let mut writer = Vec::new();
        Negotiator::new("Authorization")
            .negotiate(&mut reader, &mut writer, &Sha256TokenIssuer::new())
            .await
            .unwrap();

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"frame bytes");
    }

    #[test_log::test(tokio::test)]
    async fn folded_header_lines_are_joined() {
        let mut reader = BufReader::new(std::io::Cursor::new(
            b"GET / HTTP/1.1\r\nX-Long: first\r\n  second\r\n\r\n".to_vec(),
        ));
        let head = read_head(&mut reader).await.unwrap();
        assert_eq!(head.start_line, "GET / HTTP/1.1");
        assert_eq!(head.header("x-long"), Some("first second"));
    }

    #[test_log::test(tokio::test)]
    async fn second_negotiation_is_refused() {
        let mut negotiator = Negotiator::new("Authorization");
        let bytes = request(&[
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
            ("Authorization", "alice"),
        ]);
        let issuer = Sha256TokenIssuer::new();

        let mut reader = BufReader::new(std::io::Cursor::new(bytes.clone()));
        negotiator
            .negotiate(&mut reader, &mut Vec::new(), &issuer)
            .await
            .unwrap();

        let mut reader = BufReader::new(std::io::Cursor::new(bytes));
        assert!(
            negotiator
                .negotiate(&mut reader, &mut Vec::new(), &issuer)
                .await
                .is_err()
        );
        assert!(matches!(negotiator.state(), HandshakeState::Open { .. }));
    }
}
