#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! RFC 6455 frame encoding and decoding.
//!
//! Decoding is exposed as a [`tokio_util::codec::Decoder`] so it can be driven
//! by a `FramedRead` over any socket, while still being a pure function of the
//! bytes buffered so far. Encoding produces server-role (unmasked) frames by
//! default, with [`encode_masked`] available for the client role.

use bytes::Bytes;
use strum_macros::AsRefStr;
use thiserror::Error;

mod codec;
mod encode;
mod mask;

pub use codec::{FrameCodec, Role};
pub use encode::{close_payload, encode, encode_masked, parse_close_payload};
pub use mask::apply_mask;

/// Largest payload written into a single data frame unless told otherwise.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 0x200;

/// Largest payload a Close, Ping or Pong frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest single frame payload the decoder accepts unless told otherwise.
pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// Close, Ping and Pong. These are never fragmented.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Text and Binary. These may start a fragmented message.
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => return Err(FrameError::InvalidOpCode(other)),
        })
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// A single decoded frame.
///
/// `payload` is always stored unmasked. `mask_key` is `Some` iff the frame
/// arrived with the mask bit set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask_key: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    #[must_use]
    pub const fn masked(&self) -> bool {
        self.mask_key.is_some()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Status codes carried in the first two bytes of a Close payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum CloseCode {
    Normal,
    GoingAway,
    ProtocolError,
    Unsupported,
    InvalidPayload,
    PolicyViolation,
    MessageTooBig,
    InternalError,
    Other(u16),
}

impl From<CloseCode> for u16 {
    fn from(value: CloseCode) -> Self {
        match value {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::InternalError => 1011,
            CloseCode::Other(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(value: u16) -> Self {
        match value {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::Unsupported,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooBig,
            1011 => Self::InternalError,
            other => Self::Other(other),
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_ref(), u16::from(*self))
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid opcode {0:#x}")]
    InvalidOpCode(u8),
    #[error("Reserved bits set without a negotiated extension ({0:#05b})")]
    ReservedBits(u8),
    #[error("Client frame is not masked")]
    NotMaskedFrame,
    #[error("Server frame is masked")]
    UnexpectedMask,
    #[error("Mask key is all zeros")]
    InvalidMask,
    #[error("Control frame payload is {0} bytes (max 125)")]
    InvalidControlFrameLength(usize),
    #[error("Control frame is fragmented")]
    FragmentedControlFrame,
    #[error("Malformed payload length")]
    MalformedLength,
    #[error("Frame payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: u64, max: u64 },
    #[error("Max frame size must be greater than zero")]
    InvalidMaxFrameSize,
}

impl FrameError {
    /// Whether the peer broke the framing rules, as opposed to the transport
    /// failing or the local caller misusing the encoder.
    #[must_use]
    pub const fn is_protocol_violation(&self) -> bool {
        !matches!(self, Self::Io(_) | Self::InvalidMaxFrameSize)
    }

    /// Close code to send back when this error ends a connection.
    #[must_use]
    pub const fn close_code(&self) -> CloseCode {
        match self {
            Self::PayloadTooLarge { .. } => CloseCode::MessageTooBig,
            Self::Io(_) | Self::InvalidMaxFrameSize => CloseCode::InternalError,
            _ => CloseCode::ProtocolError,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn opcode_round_trips_through_its_wire_value() {
        for opcode in [
            OpCode::Continuation,
            OpCode::Text,
            OpCode::Binary,
            OpCode::Close,
            OpCode::Ping,
            OpCode::Pong,
        ] {
            assert_eq!(OpCode::try_from(opcode.as_u8()).unwrap(), opcode);
        }
    }

    #[test_log::test]
    fn reserved_opcodes_are_rejected() {
        for value in [0x3, 0x7, 0xB, 0xF] {
            assert!(matches!(
                OpCode::try_from(value),
                Err(FrameError::InvalidOpCode(x)) if x == value
            ));
        }
    }

    #[test_log::test]
    fn only_close_ping_and_pong_are_control() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
        assert!(!OpCode::Continuation.is_control());
    }

    #[test_log::test]
    fn only_text_and_binary_are_data() {
        assert!(OpCode::Text.is_data());
        assert!(OpCode::Binary.is_data());
        assert!(!OpCode::Continuation.is_data());
        assert!(!OpCode::Close.is_data());
        assert!(!OpCode::Ping.is_data());
        assert!(!OpCode::Pong.is_data());
    }

    #[test_log::test]
    fn close_code_maps_known_and_unknown_values() {
        assert_eq!(CloseCode::from(1002), CloseCode::ProtocolError);
        assert_eq!(u16::from(CloseCode::MessageTooBig), 1009);
        assert_eq!(CloseCode::from(4000), CloseCode::Other(4000));
        assert_eq!(CloseCode::ProtocolError.to_string(), "ProtocolError (1002)");
    }

    #[test_log::test]
    fn io_errors_are_not_protocol_violations() {
        let error = FrameError::from(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(!error.is_protocol_violation());
        assert!(FrameError::NotMaskedFrame.is_protocol_violation());
        assert_eq!(
            FrameError::PayloadTooLarge { size: 2, max: 1 }.close_code(),
            CloseCode::MessageTooBig
        );
    }
}
