//! MQTT Packet Encoder
//!
//! Encodes client -> server packets for both v3.1.1 and v5.0. v5.0 packets
//! carry an empty property block, except CONNECT which may advertise a
//! Maximum Packet Size.

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int, PROP_MAXIMUM_PACKET_SIZE};
use crate::protocol::{
    Ack, Connect, Disconnect, EncodeError, Packet, ProtocolVersion, ReasonCode, Subscribe,
};

/// Length of an empty v5.0 property block
const EMPTY_PROPERTIES: usize = 1;

/// MQTT Packet Encoder
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::PubAck(p) => self.encode_ack(0x40, p, buf),
            Packet::PubRec(p) => self.encode_ack(0x50, p, buf),
            Packet::PubComp(p) => self.encode_ack(0x70, p, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0); // PINGREQ type + flags
                buf.put_u8(0x00); // Remaining length
                Ok(())
            }
            Packet::Disconnect(p) => self.encode_disconnect(p, buf),
            other => Err(EncodeError::UnsupportedPacket(other.packet_type())),
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // Protocol name, level, flags and keep alive
        let is_v5 = packet.protocol_version == ProtocolVersion::V5;
        let properties_len = match packet.maximum_packet_size {
            Some(_) if is_v5 => 5,
            _ => 0,
        };
        let mut remaining_length = 6 + 1 + 1 + 2;
        if is_v5 {
            remaining_length += EMPTY_PROPERTIES + properties_len;
        }
        remaining_length += 2 + packet.client_id.len();
        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }
        if let Some(ref password) = packet.password {
            remaining_length += 2 + password.len();
        }

        buf.put_u8(0x10);
        write_variable_int(buf, remaining_length as u32)?;
        write_string(buf, "MQTT")?;
        buf.put_u8(packet.protocol_version as u8);

        let mut connect_flags: u8 = 0;
        if packet.clean_start {
            connect_flags |= 0x02;
        }
        if packet.password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);
        buf.put_u16(packet.keep_alive);

        if is_v5 {
            buf.put_u8(properties_len as u8);
            if let Some(size) = packet.maximum_packet_size {
                buf.put_u8(PROP_MAXIMUM_PACKET_SIZE);
                buf.put_u32(size);
            }
        }

        write_string(buf, &packet.client_id)?;
        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }
        if let Some(ref password) = packet.password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2;
        if self.is_v5() {
            remaining_length += EMPTY_PROPERTIES;
        }
        for sub in &packet.subscriptions {
            remaining_length += 2 + sub.filter.len() + 1;
        }

        // SUBSCRIBE fixed header flags must be 0010
        buf.put_u8(0x82);
        write_variable_int(buf, remaining_length as u32)?;
        buf.put_u16(packet.packet_id);
        if self.is_v5() {
            buf.put_u8(0);
        }
        for sub in &packet.subscriptions {
            write_string(buf, &sub.filter)?;
            buf.put_u8(sub.qos as u8);
        }

        Ok(())
    }

    fn encode_ack(&self, header: u8, packet: &Ack, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(header);
        if self.is_v5() && packet.reason_code != ReasonCode::Success {
            buf.put_u8(0x03);
            buf.put_u16(packet.packet_id);
            buf.put_u8(packet.reason_code as u8);
        } else {
            buf.put_u8(0x02);
            buf.put_u16(packet.packet_id);
        }
        Ok(())
    }

    fn encode_disconnect(&self, packet: &Disconnect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0xE0);
        if self.is_v5() && packet.reason_code != ReasonCode::Success {
            buf.put_u8(0x01);
            buf.put_u8(packet.reason_code as u8);
        } else {
            buf.put_u8(0x00);
        }
        Ok(())
    }
}
