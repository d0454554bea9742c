//! Wire bytes -> packet decoding for MQTT v3.1, v3.1.1 and v5.0

use std::sync::Arc;

use super::{Cursor, MAX_REMAINING_LENGTH};
use crate::protocol::{
    Ack, Auth, ConnAck, Connect, DecodeError, Disconnect, Packet, Properties, ProtocolVersion,
    Publish, QoS, ReasonCode, SubAck, Subscribe, Subscription, UnsubAck, Unsubscribe, Will,
};

/// Streaming packet decoder. Feed it the connection's read buffer; it
/// returns `None` until a complete packet is buffered.
pub struct Decoder {
    max_packet_size: usize,
    protocol_version: Option<ProtocolVersion>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            protocol_version: None,
        }
    }

    /// Cap the accepted remaining length; 0 leaves it unbounded.
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        }
        self
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = Some(version);
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.protocol_version
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == Some(ProtocolVersion::V5)
    }

    /// Decode one packet from the front of `buf`. Returns the packet and the
    /// number of consumed bytes, or `None` when more data is needed.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first = buf[0];
        let flags = first & 0x0F;

        let mut header = Cursor::new(&buf[1..]);
        let remaining = match header.take_variable_int() {
            Ok(v) => v as usize,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        let header_len = 1 + (buf[1..].len() - header.remaining());

        if remaining > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }
        if buf.len() < header_len + remaining {
            return Ok(None);
        }

        let mut body = Cursor::new(&buf[header_len..header_len + remaining]);
        let packet = match first >> 4 {
            1 => self.decode_connect(&mut body)?,
            2 => self.decode_connack(flags, &mut body)?,
            3 => self.decode_publish(flags, &mut body)?,
            4 => Packet::PubAck(self.decode_ack(flags, 0x00, &mut body)?),
            5 => Packet::PubRec(self.decode_ack(flags, 0x00, &mut body)?),
            6 => Packet::PubRel(self.decode_ack(flags, 0x02, &mut body)?),
            7 => Packet::PubComp(self.decode_ack(flags, 0x00, &mut body)?),
            8 => self.decode_subscribe(flags, &mut body)?,
            9 => self.decode_suback(flags, &mut body)?,
            10 => self.decode_unsubscribe(flags, &mut body)?,
            11 => self.decode_unsuback(flags, &mut body)?,
            12 => {
                require_flags(flags, 0x00)?;
                Packet::PingReq
            }
            13 => {
                require_flags(flags, 0x00)?;
                Packet::PingResp
            }
            14 => self.decode_disconnect(flags, &mut body)?,
            15 => self.decode_auth(flags, &mut body)?,
            t => return Err(DecodeError::InvalidPacketType(t)),
        };

        Ok(Some((packet, header_len + remaining)))
    }

    fn decode_connect(&mut self, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        let protocol_name = body.take_string()?;
        let level = body.take_u8()?;
        let protocol_version = match (protocol_name.as_str(), level) {
            ("MQIsdp", 3) => ProtocolVersion::V31,
            ("MQTT", 4) => ProtocolVersion::V311,
            ("MQTT", 5) => ProtocolVersion::V5,
            ("MQTT" | "MQIsdp", v) => return Err(DecodeError::InvalidProtocolVersion(v)),
            _ => return Err(DecodeError::InvalidProtocolName),
        };
        self.protocol_version = Some(protocol_version);

        let connect_flags = body.take_u8()?;
        if connect_flags & 0x01 != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let clean_start = connect_flags & 0x02 != 0;
        let will_flag = connect_flags & 0x04 != 0;
        let will_qos = (connect_flags >> 3) & 0x03;
        let will_retain = connect_flags & 0x20 != 0;
        let password_flag = connect_flags & 0x40 != 0;
        let username_flag = connect_flags & 0x80 != 0;

        if !will_flag && (will_qos != 0 || will_retain) {
            return Err(DecodeError::InvalidFlags);
        }
        let will_qos = QoS::from_u8(will_qos).ok_or(DecodeError::InvalidQoS(will_qos))?;

        let keep_alive = body.take_u16()?;
        let properties = self.take_properties(protocol_version, body)?;
        let client_id = body.take_string()?;

        let will = if will_flag {
            let will_properties = self.take_properties(protocol_version, body)?;
            let topic = body.take_string()?;
            let payload = body.take_binary()?;
            Some(Will {
                topic,
                payload,
                qos: will_qos,
                retain: will_retain,
                properties: will_properties,
            })
        } else {
            None
        };

        let username = if username_flag {
            Some(body.take_string()?)
        } else {
            None
        };
        let password = if password_flag {
            Some(body.take_binary()?)
        } else {
            None
        };

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version,
            client_id,
            clean_start,
            keep_alive,
            username,
            password,
            will,
            properties,
        })))
    }

    fn decode_connack(&self, flags: u8, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        require_flags(flags, 0x00)?;
        let ack_flags = body.take_u8()?;
        let code = body.take_u8()?;
        let reason_code = if self.is_v5() {
            ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?
        } else {
            ReasonCode::Success // v3 return codes map onto Success/err classes at the session layer
        };
        let properties = if self.is_v5() && body.has_remaining() {
            Properties::decode(body)?
        } else {
            Properties::default()
        };
        Ok(Packet::ConnAck(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            reason_code,
            properties,
        }))
    }

    fn decode_publish(&self, flags: u8, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        let dup = flags & 0x08 != 0;
        let retain = flags & 0x01 != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;

        let topic = body.take_string()?;
        let packet_id = if qos != QoS::AtMostOnce {
            Some(body.take_u16()?)
        } else {
            None
        };
        let properties = if self.is_v5() {
            Properties::decode(body)?
        } else {
            Properties::default()
        };
        let payload = body.take_rest();

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain,
            topic: Arc::from(topic.as_str()),
            packet_id,
            payload,
            properties,
        }))
    }

    /// PUBACK/PUBREC/PUBREL/PUBCOMP share a shape: packet id, then for v5 an
    /// optional reason code and optional properties.
    fn decode_ack(
        &self,
        flags: u8,
        expected_flags: u8,
        body: &mut Cursor<'_>,
    ) -> Result<Ack, DecodeError> {
        require_flags(flags, expected_flags)?;
        let packet_id = body.take_u16()?;
        let reason_code = if self.is_v5() && body.has_remaining() {
            let code = body.take_u8()?;
            ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?
        } else {
            ReasonCode::Success
        };
        let properties = if self.is_v5() && body.has_remaining() {
            Properties::decode(body)?
        } else {
            Properties::default()
        };
        Ok(Ack {
            packet_id,
            reason_code,
            properties,
        })
    }

    fn decode_subscribe(&self, flags: u8, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        require_flags(flags, 0x02)?;
        let packet_id = body.take_u16()?;
        let properties = if self.is_v5() {
            Properties::decode(body)?
        } else {
            Properties::default()
        };

        let identifier = properties.subscription_identifiers.first().copied();
        let mut filters = Vec::new();
        while body.has_remaining() {
            let filter = body.take_string()?;
            let options = body.take_u8()?;
            let mut sub = Subscription {
                filter,
                identifier,
                ..Default::default()
            };
            sub.apply_options_byte(options)
                .ok_or(DecodeError::MalformedPacket("invalid subscription options"))?;
            filters.push(sub);
        }

        Ok(Packet::Subscribe(Subscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_suback(&self, flags: u8, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        require_flags(flags, 0x00)?;
        let packet_id = body.take_u16()?;
        let properties = if self.is_v5() {
            Properties::decode(body)?
        } else {
            Properties::default()
        };
        let mut reason_codes = Vec::with_capacity(body.remaining());
        while body.has_remaining() {
            reason_codes.push(body.take_u8()?);
        }
        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_unsubscribe(&self, flags: u8, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        require_flags(flags, 0x02)?;
        let packet_id = body.take_u16()?;
        let properties = if self.is_v5() {
            Properties::decode(body)?
        } else {
            Properties::default()
        };
        let mut filters = Vec::new();
        while body.has_remaining() {
            filters.push(body.take_string()?);
        }
        Ok(Packet::Unsubscribe(Unsubscribe {
            packet_id,
            filters,
            properties,
        }))
    }

    fn decode_unsuback(&self, flags: u8, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        require_flags(flags, 0x00)?;
        let packet_id = body.take_u16()?;
        let properties = if self.is_v5() {
            Properties::decode(body)?
        } else {
            Properties::default()
        };
        let mut reason_codes = Vec::with_capacity(body.remaining());
        while body.has_remaining() {
            reason_codes.push(body.take_u8()?);
        }
        Ok(Packet::UnsubAck(UnsubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn decode_disconnect(&self, flags: u8, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        require_flags(flags, 0x00)?;
        let reason_code = if self.is_v5() && body.has_remaining() {
            let code = body.take_u8()?;
            ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?
        } else {
            ReasonCode::Success
        };
        let properties = if self.is_v5() && body.has_remaining() {
            Properties::decode(body)?
        } else {
            Properties::default()
        };
        Ok(Packet::Disconnect(Disconnect {
            reason_code,
            properties,
        }))
    }

    fn decode_auth(&self, flags: u8, body: &mut Cursor<'_>) -> Result<Packet, DecodeError> {
        require_flags(flags, 0x00)?;
        let reason_code = if body.has_remaining() {
            let code = body.take_u8()?;
            ReasonCode::from_u8(code).ok_or(DecodeError::InvalidReasonCode(code))?
        } else {
            ReasonCode::Success
        };
        let properties = if body.has_remaining() {
            Properties::decode(body)?
        } else {
            Properties::default()
        };
        Ok(Packet::Auth(Auth {
            reason_code,
            properties,
        }))
    }

    fn take_properties(
        &self,
        version: ProtocolVersion,
        body: &mut Cursor<'_>,
    ) -> Result<Properties, DecodeError> {
        if version == ProtocolVersion::V5 {
            Properties::decode(body)
        } else {
            Ok(Properties::default())
        }
    }
}

#[inline]
fn require_flags(flags: u8, expected: u8) -> Result<(), DecodeError> {
    if flags != expected {
        return Err(DecodeError::InvalidFlags);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECT_V311: &[u8] = &[
        0x10, 0x0D, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x01, b'a',
    ];

    #[test]
    fn decode_v311_connect() {
        let mut decoder = Decoder::new();
        let (packet, consumed) = decoder.decode(CONNECT_V311).unwrap().unwrap();
        assert_eq!(consumed, CONNECT_V311.len());
        match packet {
            Packet::Connect(c) => {
                assert_eq!(c.protocol_version, ProtocolVersion::V311);
                assert_eq!(c.client_id, "a");
                assert!(c.clean_start);
                assert_eq!(c.keep_alive, 60);
            }
            other => panic!("expected connect, got {:?}", other.packet_type()),
        }
        assert_eq!(decoder.protocol_version(), Some(ProtocolVersion::V311));
    }

    #[test]
    fn partial_packet_returns_none() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.decode(&CONNECT_V311[..5]).unwrap(), None);
    }

    #[test]
    fn decode_v311_qos1_publish() {
        // PUBLISH dup=0 qos=1 retain=0, topic "a/b", id 10, payload "hi"
        let bytes = [
            0x32, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x0A, b'h', b'i',
        ];
        let mut decoder = Decoder::new();
        decoder.set_protocol_version(ProtocolVersion::V311);
        let (packet, _) = decoder.decode(&bytes).unwrap().unwrap();
        match packet {
            Packet::Publish(p) => {
                assert_eq!(p.qos, QoS::AtLeastOnce);
                assert_eq!(&*p.topic, "a/b");
                assert_eq!(p.packet_id, Some(10));
                assert_eq!(&p.payload[..], b"hi");
            }
            other => panic!("expected publish, got {:?}", other.packet_type()),
        }
    }

    #[test]
    fn pubrel_requires_fixed_flags() {
        let bad = [0x60, 0x02, 0x00, 0x01]; // flags 0000, must be 0010
        let mut decoder = Decoder::new();
        decoder.set_protocol_version(ProtocolVersion::V311);
        assert_eq!(decoder.decode(&bad), Err(DecodeError::InvalidFlags));
    }

    #[test]
    fn packet_size_limit_enforced() {
        let mut decoder = Decoder::new().with_max_packet_size(4);
        assert_eq!(
            decoder.decode(CONNECT_V311),
            Err(DecodeError::PacketTooLarge)
        );
    }

    #[test]
    fn v5_puback_with_reason_code() {
        let bytes = [0x40, 0x03, 0x00, 0x07, 0x87];
        let mut decoder = Decoder::new();
        decoder.set_protocol_version(ProtocolVersion::V5);
        let (packet, _) = decoder.decode(&bytes).unwrap().unwrap();
        match packet {
            Packet::PubAck(ack) => {
                assert_eq!(ack.packet_id, 7);
                assert_eq!(ack.reason_code, ReasonCode::NotAuthorized);
            }
            other => panic!("expected puback, got {:?}", other.packet_type()),
        }
    }
}
