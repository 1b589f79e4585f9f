use bytes::{Buf as _, BytesMut};
use tokio_util::codec::Decoder;

use crate::{DEFAULT_MAX_PAYLOAD_SIZE, Frame, FrameError, MAX_CONTROL_PAYLOAD, OpCode, apply_mask};

/// Which end of the connection is decoding.
///
/// A server only accepts masked frames and a client only accepts unmasked
/// ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Decodes frames for one end of a connection.
///
/// The decoder only consumes bytes once a whole frame is buffered. A partial
/// frame yields `Ok(None)` and a rejected frame yields an error, both leaving
/// the buffer exactly as it was.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    role: Role,
    max_payload_size: u64,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Header {
    fin: bool,
    opcode: OpCode,
    mask_key: Option<[u8; 4]>,
    header_len: usize,
    payload_len: usize,
}

impl FrameCodec {
    /// Decoder for the server end: client frames must be masked.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            role: Role::Server,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    /// Decoder for the client end: server frames must not be masked.
    #[must_use]
    pub const fn client() -> Self {
        Self {
            role: Role::Client,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub const fn with_max_payload_size(mut self, max_payload_size: u64) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    #[must_use]
    pub const fn max_payload_size(&self) -> u64 {
        self.max_payload_size
    }

    fn parse_header(&self, src: &[u8]) -> Result<Option<Header>, FrameError> {
        let [b0, b1, ..] = *src else {
            return Ok(None);
        };

        let fin = b0 & 0x80 != 0;
        let rsv = (b0 >> 4) & 0x07;
        if rsv != 0 {
            return Err(FrameError::ReservedBits(rsv));
        }
        let opcode = OpCode::try_from(b0 & 0x0F)?;

        let masked = b1 & 0x80 != 0;
        match (self.role, masked) {
            (Role::Server, false) => return Err(FrameError::NotMaskedFrame),
            (Role::Client, true) => return Err(FrameError::UnexpectedMask),
            _ => {}
        }

        let (payload_len, mut offset) = match b1 & 0x7F {
            126 => {
                let Some(ext) = src.get(2..4) else {
                    return Ok(None);
                };
                (u64::from(u16::from_be_bytes([ext[0], ext[1]])), 4)
            }
            127 => {
                let Some(ext) = src.get(2..10) else {
                    return Ok(None);
                };
                let mut len = [0_u8; 8];
                len.copy_from_slice(ext);
                let len = u64::from_be_bytes(len);
                if len & (1 << 63) != 0 {
                    return Err(FrameError::MalformedLength);
                }
                (len, 10)
            }
            marker => (u64::from(marker), 2),
        };

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControlFrame);
            }
            if payload_len > MAX_CONTROL_PAYLOAD as u64 {
                return Err(FrameError::InvalidControlFrameLength(
                    usize::try_from(payload_len).unwrap_or(usize::MAX),
                ));
            }
        }

        if payload_len > self.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: self.max_payload_size,
            });
        }
        let payload_len = usize::try_from(payload_len).map_err(|_| FrameError::MalformedLength)?;

        let mask_key = if masked {
            let Some(key) = src.get(offset..offset + 4) else {
                return Ok(None);
            };
            let key = [key[0], key[1], key[2], key[3]];
            if key == [0; 4] {
                return Err(FrameError::InvalidMask);
            }
            offset += 4;
            Some(key)
        } else {
            None
        };

        Ok(Some(Header {
            fin,
            opcode,
            mask_key,
            header_len: offset,
            payload_len,
        }))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(header) = self.parse_header(src)? else {
            return Ok(None);
        };

        let frame_len = header.header_len + header.payload_len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(header.header_len);
        let mut payload = src.split_to(header.payload_len);
        if let Some(key) = header.mask_key {
            apply_mask(&mut payload, key);
        }

        log::trace!(
            "decode: fin={} opcode={} size={}",
            header.fin,
            header.opcode,
            header.payload_len
        );

        Ok(Some(Frame {
            fin: header.fin,
            opcode: header.opcode,
            mask_key: header.mask_key,
            payload: payload.freeze(),
        }))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream ended inside a frame ({} bytes buffered)", buf.len()),
            )
            .into()),
        }
    }
}
