//! MQTT Packet Decoder
//!
//! Decodes server -> client packets for both v3.1.1 and v5.0

use bytes::Bytes;

use super::{
    read_connack_properties, read_string, read_u16, read_variable_int, skip_properties,
    DEFAULT_MAX_PACKET_SIZE,
};
use crate::protocol::{
    Ack, ConnAck, DecodeError, Disconnect, Packet, ProtocolVersion, Publish, QoS, ReasonCode,
    SubAck,
};

/// MQTT Packet Decoder
pub struct Decoder {
    max_packet_size: usize,
    protocol_version: ProtocolVersion,
}

impl Decoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            protocol_version: version,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Decode a packet from the buffer
    /// Returns `Ok(None)` until a complete packet is buffered, otherwise
    /// (packet, bytes_consumed)
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };

        let total_len = 1 + len_bytes + remaining_length as usize;
        if total_len > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge(total_len));
        }
        if buf.len() < total_len {
            return Ok(None);
        }

        let payload = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            2 => self.decode_connack(flags, payload)?,
            3 => self.decode_publish(flags, payload)?,
            4 => Packet::PubAck(self.decode_ack(flags, 0x00, payload)?),
            5 => Packet::PubRec(self.decode_ack(flags, 0x00, payload)?),
            6 => Packet::PubRel(self.decode_ack(flags, 0x02, payload)?),
            7 => Packet::PubComp(self.decode_ack(flags, 0x00, payload)?),
            9 => self.decode_suback(flags, payload)?,
            13 => {
                if flags != 0 {
                    return Err(DecodeError::InvalidFlags);
                }
                Packet::PingResp
            }
            14 => self.decode_disconnect(flags, payload)?,
            1 | 8 | 10 | 11 | 12 | 15 => return Err(DecodeError::UnexpectedPacket(packet_type)),
            _ => return Err(DecodeError::InvalidPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }

    /// Acknowledgement owed for an oversized PUBLISH at the start of `buf`.
    ///
    /// `None` for QoS 0, for other packet types, or when the packet
    /// identifier has not been buffered yet.
    pub fn oversized_publish_ack(&self, buf: &[u8]) -> Option<Packet> {
        let first_byte = *buf.first()?;
        if first_byte >> 4 != 3 {
            return None;
        }
        let qos = QoS::from_u8((first_byte >> 1) & 0x03)?;
        let (_, len_bytes) = read_variable_int(buf.get(1..)?).ok()?;
        let variable_header = buf.get(1 + len_bytes..)?;
        let topic_len = read_u16(variable_header).ok()? as usize;
        let packet_id = read_u16(variable_header.get(2 + topic_len..)?).ok()?;

        match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => Some(Packet::PubAck(Ack::new(packet_id))),
            QoS::ExactlyOnce => Some(Packet::PubRec(Ack::new(packet_id))),
        }
    }

    fn decode_connack(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if payload.len() < 2 {
            return Err(DecodeError::InsufficientData);
        }

        let acknowledge_flags = payload[0];
        // Only bit 0 is valid (session present), rest must be 0
        if (acknowledge_flags & 0xFE) != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let reason_byte = payload[1];
        let reason_code = if self.is_v5() {
            ReasonCode::from_u8(reason_byte).ok_or(DecodeError::InvalidReasonCode(reason_byte))?
        } else {
            ReasonCode::from_v3_connack_code(reason_byte)
        };

        // Some v5 brokers omit an empty property block
        let server_keep_alive = if self.is_v5() && payload.len() > 2 {
            read_connack_properties(&payload[2..])?.0
        } else {
            None
        };

        Ok(Packet::ConnAck(ConnAck {
            session_present: (acknowledge_flags & 0x01) != 0,
            reason_code,
            server_keep_alive,
        }))
    }

    fn decode_publish(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        let dup = (flags & 0x08) != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let retain = (flags & 0x01) != 0;

        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let (topic, mut pos) = read_string(payload)?;

        let packet_id = if qos != QoS::AtMostOnce {
            let id = read_u16(&payload[pos..])?;
            if id == 0 {
                return Err(DecodeError::MalformedPacket("packet id cannot be 0"));
            }
            pos += 2;
            Some(id)
        } else {
            None
        };

        if self.is_v5() {
            pos += skip_properties(&payload[pos..])?;
        }

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(&payload[pos..]),
        }))
    }

    /// PUBACK, PUBREC, PUBREL and PUBCOMP share one layout
    fn decode_ack(&self, flags: u8, expected_flags: u8, payload: &[u8]) -> Result<Ack, DecodeError> {
        if flags != expected_flags {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(payload)?;
        let reason_code = match payload.get(2) {
            Some(&byte) if self.is_v5() => {
                ReasonCode::from_u8(byte).ok_or(DecodeError::InvalidReasonCode(byte))?
            }
            _ => ReasonCode::Success,
        };

        Ok(Ack {
            packet_id,
            reason_code,
        })
    }

    fn decode_suback(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let packet_id = read_u16(payload)?;
        let mut pos = 2;
        if self.is_v5() {
            pos += skip_properties(&payload[pos..])?;
        }

        let codes = &payload[pos..];
        if codes.is_empty() {
            return Err(DecodeError::MalformedPacket("SUBACK without reason codes"));
        }

        let reason_codes = codes
            .iter()
            .map(|&byte| {
                let code = if self.is_v5() {
                    ReasonCode::from_u8(byte)
                } else {
                    ReasonCode::from_v3_suback_code(byte)
                };
                code.ok_or(DecodeError::InvalidReasonCode(byte))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
        }))
    }

    fn decode_disconnect(&self, flags: u8, payload: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        // v3.1.1 brokers never send DISCONNECT; accept an empty one anyway
        let reason_code = match payload.first() {
            Some(&byte) if self.is_v5() => {
                ReasonCode::from_u8(byte).ok_or(DecodeError::InvalidReasonCode(byte))?
            }
            _ => ReasonCode::Success,
        };

        Ok(Packet::Disconnect(Disconnect { reason_code }))
    }
}
