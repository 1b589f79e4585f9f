//! Joins continuation frames back into whole messages.

use bytes::{Bytes, BytesMut};
use chatbox_frame::{CloseCode, Frame, FrameCodec, FrameError, OpCode};
use chrono::Utc;
use futures::StreamExt as _;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;

use crate::models::{InboundPayload, Message, PayloadError};

/// A complete message as it arrived: its kind and the joined payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub kind: OpCode,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Message(RawMessage),
    /// A Text or Binary message with no payload. Nothing to deliver.
    NoData,
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Continuation frame without a message in progress")]
    UnexpectedContinuation,
    #[error("{0} frame while a fragmented message is in progress")]
    ExpectedContinuation(OpCode),
    #[error("Message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Text message is not valid UTF-8")]
    InvalidUtf8,
}

impl ReadError {
    /// Protocol violations end the connection with a Close frame, transport
    /// errors end it without one.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        match self {
            Self::Frame(e) => e.is_protocol_violation(),
            _ => true,
        }
    }

    #[must_use]
    pub const fn close_code(&self) -> CloseCode {
        match self {
            Self::Frame(e) => e.close_code(),
            Self::MessageTooLarge { .. } => CloseCode::MessageTooBig,
            Self::InvalidUtf8 => CloseCode::InvalidPayload,
            Self::UnexpectedContinuation | Self::ExpectedContinuation(_) => {
                CloseCode::ProtocolError
            }
        }
    }
}

#[derive(Debug)]
struct Partial {
    kind: OpCode,
    body: BytesMut,
}

/// Reads whole messages off a byte stream.
///
/// Control frames that arrive between the fragments of a data message are
/// returned as soon as they arrive, while the partial message is kept.
pub struct MessageReader<R> {
    frames: FramedRead<R, FrameCodec>,
    partial: Option<Partial>,
    max_message_size: usize,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Reader for the server end of a connection.
    pub fn new(reader: R) -> Self {
        Self::with_codec(reader, FrameCodec::new())
    }

    pub fn with_codec(reader: R, codec: FrameCodec) -> Self {
        let max_message_size = usize::try_from(codec.max_payload_size()).unwrap_or(usize::MAX);
        Self {
            frames: FramedRead::new(reader, codec),
            partial: None,
            max_message_size,
        }
    }

    /// Caps both a single frame and a reassembled message at `max` bytes.
    #[must_use]
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        let codec = *self.frames.decoder();
        *self.frames.decoder_mut() =
            codec.with_max_payload_size(u64::try_from(max).unwrap_or(u64::MAX));
        self.max_message_size = max;
        self
    }

    /// Waits for the next complete message.
    ///
    /// Returns `Ok(None)` once the peer closes the stream cleanly.
    ///
    /// # Errors
    ///
    /// * If the stream fails or ends in the middle of a message
    /// * If the peer violates the framing rules
    pub async fn next(&mut self) -> Result<Option<Received>, ReadError> {
        loop {
            let Some(frame) = self.frames.next().await.transpose()? else {
                if let Some(partial) = &self.partial {
                    return Err(FrameError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!(
                            "stream ended inside a fragmented {} message",
                            partial.kind
                        ),
                    ))
                    .into());
                }
                return Ok(None);
            };

            if let Some(received) = self.push(frame)? {
                return Ok(Some(received));
            }
        }
    }

    fn push(&mut self, frame: Frame) -> Result<Option<Received>, ReadError> {
        match frame.opcode {
            opcode if opcode.is_control() => Ok(Some(Received::Message(RawMessage {
                kind: opcode,
                body: frame.payload,
            }))),
            OpCode::Continuation => {
                let Some(partial) = self.partial.as_mut() else {
                    return Err(ReadError::UnexpectedContinuation);
                };
                let size = partial.body.len() + frame.payload.len();
                if size > self.max_message_size {
                    return Err(ReadError::MessageTooLarge {
                        size,
                        max: self.max_message_size,
                    });
                }
                partial.body.extend_from_slice(&frame.payload);

                if !frame.fin {
                    return Ok(None);
                }
                let Some(Partial { kind, body }) = self.partial.take() else {
                    return Ok(None);
                };
                complete(kind, body.freeze()).map(Some)
            }
            kind => {
                if self.partial.is_some() {
                    return Err(ReadError::ExpectedContinuation(kind));
                }
                if frame.fin {
                    return complete(kind, frame.payload).map(Some);
                }
                log::trace!(
                    "push: start of fragmented {kind} message size={}",
                    frame.payload.len()
                );
                self.partial = Some(Partial {
                    kind,
                    body: BytesMut::from(&frame.payload[..]),
                });
                Ok(None)
            }
        }
    }
}

fn complete(kind: OpCode, body: Bytes) -> Result<Received, ReadError> {
    if body.is_empty() {
        return Ok(Received::NoData);
    }
    if kind == OpCode::Text && std::str::from_utf8(&body).is_err() {
        return Err(ReadError::InvalidUtf8);
    }
    Ok(Received::Message(RawMessage { kind, body }))
}

/// Deserializes the structured payload of a Text message sent by `sender_id`.
///
/// # Errors
///
/// * If the message is not Text
/// * If the body is not a valid payload
pub fn decode_message(raw: &RawMessage, sender_id: &str) -> Result<Message, PayloadError> {
    if raw.kind != OpCode::Text {
        return Err(PayloadError::NotText(raw.kind));
    }
    let payload: InboundPayload = serde_json::from_slice(&raw.body)?;

    Ok(Message {
        sender_id: sender_id.to_string(),
        recipient_id: payload.recipient_id,
        body: Bytes::from(payload.body),
        kind: OpCode::Text,
        created_at: Utc::now(),
    })
}
