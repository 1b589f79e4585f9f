use std::borrow::Cow;

use bytes::Bytes;
use chatbox_frame::OpCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sender id of messages the server produces itself.
pub const SERVER_SENDER_ID: &str = "server";

/// One logical application message.
///
/// An empty `recipient_id` means the message is broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender_id: String,
    pub recipient_id: String,
    pub body: Bytes,
    pub kind: OpCode,
    pub created_at: DateTime<Utc>,
}

impl Message {
    #[must_use]
    pub fn text(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            body: Bytes::from(body.into()),
            kind: OpCode::Text,
            created_at: Utc::now(),
        }
    }

    /// Notice broadcast to everyone still connected when `user_id` leaves.
    #[must_use]
    pub fn disconnected(user_id: &str) -> Self {
        Self::text(SERVER_SENDER_ID, "", format!("{user_id} has disconnected"))
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_empty()
    }

    #[must_use]
    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// JSON text sent to recipients.
    ///
    /// # Errors
    ///
    /// * If the payload fails to serialize
    pub fn to_wire(&self) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(&OutboundPayload::from(self))?)
    }
}

/// What a client sends in a Text message.
///
/// `RecvID` and `Message` are accepted as the legacy spellings of
/// `recipientId` and `body`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundPayload {
    #[serde(default, alias = "RecvID")]
    pub recipient_id: String,
    #[serde(alias = "Message")]
    pub body: String,
}

/// What a recipient receives in a Text message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundPayload {
    pub sender_id: String,
    pub recipient_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Message> for OutboundPayload {
    fn from(value: &Message) -> Self {
        Self {
            sender_id: value.sender_id.clone(),
            recipient_id: value.recipient_id.clone(),
            body: value.body_str().into_owned(),
            created_at: value.created_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Expected a Text message, got {0}")]
    NotText(OpCode),
}
