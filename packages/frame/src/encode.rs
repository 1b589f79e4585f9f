use bytes::{BufMut as _, Bytes, BytesMut};

use crate::{CloseCode, FrameError, MAX_CONTROL_PAYLOAD, OpCode, apply_mask};

/// Two header bytes, an eight byte extended length and a mask key.
const MAX_HEADER_LEN: usize = 14;

/// Encodes `payload` as one or more unmasked (server role) frames.
///
/// Data payloads longer than `max_frame_size` are split: the first frame
/// carries `opcode`, later frames carry [`OpCode::Continuation`], and only the
/// last has FIN set. Control frames are always emitted as a single frame.
///
/// # Errors
///
/// * [`FrameError::InvalidControlFrameLength`] if a control payload is longer than 125 bytes
/// * [`FrameError::InvalidMaxFrameSize`] if `max_frame_size` is zero
pub fn encode(opcode: OpCode, payload: &[u8], max_frame_size: usize) -> Result<Bytes, FrameError> {
    encode_frames(opcode, payload, max_frame_size, None)
}

/// Encodes `payload` the way a client must: every frame masked with `mask_key`.
///
/// # Errors
///
/// * [`FrameError::InvalidControlFrameLength`] if a control payload is longer than 125 bytes
/// * [`FrameError::InvalidMaxFrameSize`] if `max_frame_size` is zero
pub fn encode_masked(
    opcode: OpCode,
    payload: &[u8],
    max_frame_size: usize,
    mask_key: [u8; 4],
) -> Result<Bytes, FrameError> {
    encode_frames(opcode, payload, max_frame_size, Some(mask_key))
}

fn encode_frames(
    opcode: OpCode,
    payload: &[u8],
    max_frame_size: usize,
    mask_key: Option<[u8; 4]>,
) -> Result<Bytes, FrameError> {
    if max_frame_size == 0 {
        return Err(FrameError::InvalidMaxFrameSize);
    }

    if opcode.is_control() || payload.is_empty() {
        if opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::InvalidControlFrameLength(payload.len()));
        }
        let mut buf = BytesMut::with_capacity(MAX_HEADER_LEN + payload.len());
        put_frame(&mut buf, true, opcode, payload, mask_key);
        return Ok(buf.freeze());
    }

    let chunk_count = payload.len().div_ceil(max_frame_size);
    let mut buf = BytesMut::with_capacity(payload.len() + chunk_count * MAX_HEADER_LEN);

    for (index, chunk) in payload.chunks(max_frame_size).enumerate() {
        let fin = index + 1 == chunk_count;
        let opcode = if index == 0 {
            opcode
        } else {
            OpCode::Continuation
        };
        put_frame(&mut buf, fin, opcode, chunk, mask_key);
    }

    log::trace!(
        "encode: opcode={opcode} size={} frames={chunk_count}",
        payload.len()
    );

    Ok(buf.freeze())
}

#[allow(clippy::cast_possible_truncation)]
fn put_frame(
    buf: &mut BytesMut,
    fin: bool,
    opcode: OpCode,
    payload: &[u8],
    mask_key: Option<[u8; 4]>,
) {
    let fin_bit = if fin { 0x80 } else { 0x00 };
    buf.put_u8(fin_bit | opcode.as_u8());

    let mask_bit = if mask_key.is_some() { 0x80 } else { 0x00 };
    match payload.len() {
        len @ 0..=125 => buf.put_u8(mask_bit | len as u8),
        len @ 126..=0xFFFF => {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(len as u16);
        }
        len => {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(len as u64);
        }
    }

    match mask_key {
        Some(key) => {
            buf.put_slice(&key);
            let start = buf.len();
            buf.put_slice(payload);
            apply_mask(&mut buf[start..], key);
        }
        None => buf.put_slice(payload),
    }
}

/// Builds a Close payload: big-endian status code followed by a UTF-8 reason.
///
/// The reason is cut at a character boundary so the payload fits in a
/// control frame.
#[must_use]
pub fn close_payload(code: CloseCode, reason: &str) -> Bytes {
    let max_reason = MAX_CONTROL_PAYLOAD - 2;
    let mut end = reason.len().min(max_reason);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut buf = BytesMut::with_capacity(2 + end);
    buf.put_u16(code.into());
    buf.put_slice(&reason.as_bytes()[..end]);
    buf.freeze()
}

/// Splits a received Close payload into its status code and reason.
///
/// Returns `None` for an empty payload, which is a valid Close without a code.
#[must_use]
pub fn parse_close_payload(payload: &[u8]) -> Option<(CloseCode, String)> {
    match payload {
        [hi, lo, reason @ ..] => Some((
            CloseCode::from(u16::from_be_bytes([*hi, *lo])),
            String::from_utf8_lossy(reason).into_owned(),
        )),
        _ => None,
    }
}
