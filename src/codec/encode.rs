//! Packet -> wire bytes encoding for MQTT v3.1, v3.1.1 and v5.0

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    Ack, Auth, ConnAck, Connect, Disconnect, EncodeError, Packet, Properties, ProtocolVersion,
    Publish, QoS, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

/// Packet encoder bound to one connection's protocol version.
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V311)
    }
}

impl Encoder {
    pub fn new(protocol_version: ProtocolVersion) -> Self {
        Self { protocol_version }
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Encode a packet, appending fixed header + body to `buf`.
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::with_capacity(64);
        let flags = match packet {
            Packet::Connect(c) => {
                self.encode_connect(c, &mut body)?;
                0x00
            }
            Packet::ConnAck(c) => {
                self.encode_connack(c, &mut body)?;
                0x00
            }
            Packet::Publish(p) => {
                self.encode_publish(p, &mut body)?;
                (p.dup as u8) << 3 | (p.qos as u8) << 1 | p.retain as u8
            }
            Packet::PubAck(a) | Packet::PubRec(a) | Packet::PubComp(a) => {
                self.encode_ack(a, &mut body)?;
                0x00
            }
            Packet::PubRel(a) => {
                self.encode_ack(a, &mut body)?;
                0x02
            }
            Packet::Subscribe(s) => {
                self.encode_subscribe(s, &mut body)?;
                0x02
            }
            Packet::SubAck(s) => {
                self.encode_suback(s, &mut body)?;
                0x00
            }
            Packet::Unsubscribe(u) => {
                self.encode_unsubscribe(u, &mut body)?;
                0x02
            }
            Packet::UnsubAck(u) => {
                self.encode_unsuback(u, &mut body)?;
                0x00
            }
            Packet::PingReq | Packet::PingResp => 0x00,
            Packet::Disconnect(d) => {
                self.encode_disconnect(d, &mut body)?;
                0x00
            }
            Packet::Auth(a) => {
                self.encode_auth(a, &mut body)?;
                0x00
            }
        };

        buf.put_u8((packet.packet_type() as u8) << 4 | flags);
        write_variable_int(buf, body.len() as u32)?;
        buf.put_slice(&body);
        Ok(())
    }

    fn encode_connect(&self, connect: &Connect, body: &mut BytesMut) -> Result<(), EncodeError> {
        match connect.protocol_version {
            ProtocolVersion::V31 => {
                write_string(body, "MQIsdp")?;
                body.put_u8(3);
            }
            version => {
                write_string(body, "MQTT")?;
                body.put_u8(version as u8);
            }
        }

        let mut flags = 0u8;
        if connect.clean_start {
            flags |= 0x02;
        }
        if let Some(ref will) = connect.will {
            flags |= 0x04 | (will.qos as u8) << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if connect.password.is_some() {
            flags |= 0x40;
        }
        if connect.username.is_some() {
            flags |= 0x80;
        }
        body.put_u8(flags);
        body.put_u16(connect.keep_alive);

        if connect.protocol_version == ProtocolVersion::V5 {
            connect.properties.encode(body)?;
        }
        write_string(body, &connect.client_id)?;

        if let Some(ref will) = connect.will {
            if connect.protocol_version == ProtocolVersion::V5 {
                will.properties.encode(body)?;
            }
            write_string(body, &will.topic)?;
            write_binary(body, &will.payload)?;
        }
        if let Some(ref username) = connect.username {
            write_string(body, username)?;
        }
        if let Some(ref password) = connect.password {
            write_binary(body, password)?;
        }
        Ok(())
    }

    fn encode_connack(&self, connack: &ConnAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u8(connack.session_present as u8);
        if self.is_v5() {
            body.put_u8(connack.reason_code as u8);
            connack.properties.encode(body)?;
        } else {
            body.put_u8(connack.reason_code.to_v3_connack_code());
        }
        Ok(())
    }

    fn encode_publish(&self, publish: &Publish, body: &mut BytesMut) -> Result<(), EncodeError> {
        write_string(body, &publish.topic)?;
        if publish.qos != QoS::AtMostOnce {
            body.put_u16(publish.packet_id.unwrap_or(0));
        }
        if self.is_v5() {
            publish.properties.encode(body)?;
        }
        body.put_slice(&publish.payload);
        Ok(())
    }

    fn encode_ack(&self, ack: &Ack, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(ack.packet_id);
        if self.is_v5() {
            let bare = ack.reason_code.is_success() && props_empty(&ack.properties);
            if !bare {
                body.put_u8(ack.reason_code as u8);
                ack.properties.encode(body)?;
            }
        }
        Ok(())
    }

    fn encode_subscribe(&self, sub: &Subscribe, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(sub.packet_id);
        if self.is_v5() {
            sub.properties.encode(body)?;
        }
        for filter in &sub.filters {
            write_string(body, &filter.filter)?;
            body.put_u8(filter.options_byte());
        }
        Ok(())
    }

    fn encode_suback(&self, suback: &SubAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(suback.packet_id);
        if self.is_v5() {
            suback.properties.encode(body)?;
        }
        body.put_slice(&suback.reason_codes);
        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        unsub: &Unsubscribe,
        body: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        body.put_u16(unsub.packet_id);
        if self.is_v5() {
            unsub.properties.encode(body)?;
        }
        for filter in &unsub.filters {
            write_string(body, filter)?;
        }
        Ok(())
    }

    fn encode_unsuback(&self, unsuback: &UnsubAck, body: &mut BytesMut) -> Result<(), EncodeError> {
        body.put_u16(unsuback.packet_id);
        if self.is_v5() {
            unsuback.properties.encode(body)?;
            body.put_slice(&unsuback.reason_codes);
        }
        Ok(())
    }

    fn encode_disconnect(
        &self,
        disconnect: &Disconnect,
        body: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        if self.is_v5() {
            let bare = disconnect.reason_code.is_success() && props_empty(&disconnect.properties);
            if !bare {
                body.put_u8(disconnect.reason_code as u8);
                disconnect.properties.encode(body)?;
            }
        }
        Ok(())
    }

    fn encode_auth(&self, auth: &Auth, body: &mut BytesMut) -> Result<(), EncodeError> {
        let bare = auth.reason_code.is_success() && props_empty(&auth.properties);
        if !bare {
            body.put_u8(auth.reason_code as u8);
            auth.properties.encode(body)?;
        }
        Ok(())
    }
}

fn props_empty(props: &Properties) -> bool {
    props.encoded_size() == 0
}
