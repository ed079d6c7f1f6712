//! MQTT Client Codec
//!
//! Encodes the packets a subscribing client sends and decodes the packets a
//! broker sends back, for both MQTT v3.1.1 and v5.0.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Maximum remaining length (268,435,455 bytes = ~256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default limit for packets accepted from the broker, matching the largest
/// Pub/Sub publish request
pub const DEFAULT_MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// v5.0 property identifiers the client reads or writes
pub const PROP_SERVER_KEEP_ALIVE: u8 = 0x13;
pub const PROP_MAXIMUM_PACKET_SIZE: u8 = 0x27;

/// Read a Variable Byte Integer from buffer
/// Returns (value, bytes_consumed) or error
#[inline]
pub fn read_variable_int(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut multiplier: u32 = 1;
    let mut value: u32 = 0;
    let mut pos = 0;

    loop {
        if pos >= 4 {
            return Err(DecodeError::InvalidRemainingLength);
        }
        let byte = *buf.get(pos).ok_or(DecodeError::InsufficientData)?;
        value += ((byte & 0x7F) as u32) * multiplier;
        pos += 1;

        if (byte & 0x80) == 0 {
            return Ok((value, pos));
        }
        multiplier *= 128;
    }
}

/// Write a Variable Byte Integer to buffer
#[inline]
pub fn write_variable_int(buf: &mut BytesMut, mut value: u32) -> Result<(), EncodeError> {
    if value > MAX_REMAINING_LENGTH as u32 {
        return Err(EncodeError::PacketTooLarge);
    }

    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            return Ok(());
        }
    }
}

/// Number of bytes needed to encode a Variable Byte Integer
#[inline]
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Read a Two Byte Integer (u16 big-endian)
#[inline]
pub fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    match buf {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(DecodeError::InsufficientData),
    }
}

/// Read a UTF-8 encoded string
/// Returns (string, bytes_consumed) or error
#[inline]
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let len = read_u16(buf)? as usize;
    let total_len = 2 + len;
    let raw = buf.get(2..total_len).ok_or(DecodeError::InsufficientData)?;
    let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;

    if s.contains('\0') {
        return Err(DecodeError::MalformedPacket(
            "string contains null character",
        ));
    }

    Ok((s, total_len))
}

/// Skip a v5.0 property block, returning the bytes it occupies
#[inline]
pub fn skip_properties(buf: &[u8]) -> Result<usize, DecodeError> {
    let (len, len_bytes) = read_variable_int(buf)?;
    let total = len_bytes + len as usize;
    if buf.len() < total {
        return Err(DecodeError::MalformedPacket("property length exceeds packet"));
    }
    Ok(total)
}

/// Read a v5.0 CONNACK property block, returning the Server Keep Alive
/// value (if present) and the bytes the block occupies
pub fn read_connack_properties(buf: &[u8]) -> Result<(Option<u16>, usize), DecodeError> {
    let (len, len_bytes) = read_variable_int(buf)?;
    let end = len_bytes + len as usize;
    let props = buf
        .get(len_bytes..end)
        .ok_or(DecodeError::MalformedPacket("property length exceeds packet"))?;

    let mut server_keep_alive = None;
    let mut pos = 0;
    while pos < props.len() {
        let id = props[pos];
        pos += 1;
        let rest = &props[pos..];
        let size = match id {
            PROP_SERVER_KEEP_ALIVE => {
                if server_keep_alive.is_some() {
                    return Err(DecodeError::MalformedPacket("duplicate server keep alive"));
                }
                server_keep_alive = Some(read_u16(rest)?);
                2
            }
            // byte
            0x01 | 0x17 | 0x19 | 0x24 | 0x25 | 0x28 | 0x29 | 0x2A => 1,
            // two byte integer
            0x21 | 0x22 | 0x23 => 2,
            // four byte integer
            0x02 | 0x11 | 0x18 | PROP_MAXIMUM_PACKET_SIZE => 4,
            // variable byte integer
            0x0B => read_variable_int(rest)?.1,
            // string or binary data
            0x03 | 0x08 | 0x09 | 0x12 | 0x15 | 0x16 | 0x1A | 0x1C | 0x1F => {
                2 + read_u16(rest)? as usize
            }
            // string pair
            0x26 => {
                let key = 2 + read_u16(rest)? as usize;
                let value = rest.get(key..).ok_or(DecodeError::InsufficientData)?;
                key + 2 + read_u16(value)? as usize
            }
            _ => return Err(DecodeError::MalformedPacket("unknown property identifier")),
        };
        if rest.len() < size {
            return Err(DecodeError::MalformedPacket("property length exceeds packet"));
        }
        pos += size;
    }

    Ok((server_keep_alive, end))
}

/// Write a UTF-8 encoded string
#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}

/// Write length-prefixed binary data
#[inline]
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::StringTooLong)?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}
