//! MQTT v5.0 properties
//!
//! Only the properties the broker core reads or writes are modelled; an
//! unknown property identifier is a malformed packet per the v5 spec.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{variable_int_len, write_binary, write_string, write_variable_int, Cursor};
use crate::protocol::{DecodeError, EncodeError};

/// A user property key/value pair.
pub type UserProperty = (String, String);

mod id {
    pub const PAYLOAD_FORMAT_INDICATOR: u8 = 0x01;
    pub const MESSAGE_EXPIRY_INTERVAL: u8 = 0x02;
    pub const CONTENT_TYPE: u8 = 0x03;
    pub const RESPONSE_TOPIC: u8 = 0x08;
    pub const CORRELATION_DATA: u8 = 0x09;
    pub const SUBSCRIPTION_IDENTIFIER: u8 = 0x0B;
    pub const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
    pub const SERVER_KEEP_ALIVE: u8 = 0x13;
    pub const AUTHENTICATION_METHOD: u8 = 0x15;
    pub const AUTHENTICATION_DATA: u8 = 0x16;
    pub const REQUEST_PROBLEM_INFORMATION: u8 = 0x17;
    pub const WILL_DELAY_INTERVAL: u8 = 0x18;
    pub const REQUEST_RESPONSE_INFORMATION: u8 = 0x19;
    pub const RESPONSE_INFORMATION: u8 = 0x1A;
    pub const REASON_STRING: u8 = 0x1F;
    pub const RECEIVE_MAXIMUM: u8 = 0x21;
    pub const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
    pub const TOPIC_ALIAS: u8 = 0x23;
    pub const MAXIMUM_QOS: u8 = 0x24;
    pub const RETAIN_AVAILABLE: u8 = 0x25;
    pub const USER_PROPERTY: u8 = 0x26;
    pub const MAXIMUM_PACKET_SIZE: u8 = 0x27;
    pub const WILDCARD_SUB_AVAILABLE: u8 = 0x28;
    pub const SUB_ID_AVAILABLE: u8 = 0x29;
    pub const SHARED_SUB_AVAILABLE: u8 = 0x2A;
}

/// Decoded v5 property block. Absent on the wire for v3 connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub subscription_identifiers: Vec<u32>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub authentication_method: Option<String>,
    pub authentication_data: Option<Bytes>,
    pub request_problem_information: Option<u8>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<u8>,
    pub response_information: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<u8>,
    pub user_properties: Vec<UserProperty>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<u8>,
    pub subscription_identifier_available: Option<u8>,
    pub shared_subscription_available: Option<u8>,
}

fn set_once<T>(slot: &mut Option<T>, value: T, id: u8) -> Result<(), DecodeError> {
    if slot.is_some() {
        return Err(DecodeError::DuplicateProperty(id));
    }
    *slot = Some(value);
    Ok(())
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a property block (length prefix included) from the cursor.
    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        let prop_len = cur.take_variable_int()? as usize;
        let mut body = cur.take_cursor(prop_len)?;

        let mut props = Properties::new();
        while body.has_remaining() {
            let pid = body.take_u8()?;
            match pid {
                id::PAYLOAD_FORMAT_INDICATOR => {
                    set_once(&mut props.payload_format_indicator, body.take_u8()?, pid)?
                }
                id::MESSAGE_EXPIRY_INTERVAL => {
                    set_once(&mut props.message_expiry_interval, body.take_u32()?, pid)?
                }
                id::CONTENT_TYPE => set_once(&mut props.content_type, body.take_string()?, pid)?,
                id::RESPONSE_TOPIC => {
                    set_once(&mut props.response_topic, body.take_string()?, pid)?
                }
                id::CORRELATION_DATA => {
                    set_once(&mut props.correlation_data, body.take_binary()?, pid)?
                }
                id::SUBSCRIPTION_IDENTIFIER => {
                    let v = body.take_variable_int()?;
                    if v == 0 {
                        return Err(DecodeError::MalformedPacket(
                            "subscription identifier cannot be 0",
                        ));
                    }
                    props.subscription_identifiers.push(v);
                }
                id::SESSION_EXPIRY_INTERVAL => {
                    set_once(&mut props.session_expiry_interval, body.take_u32()?, pid)?
                }
                id::ASSIGNED_CLIENT_IDENTIFIER => set_once(
                    &mut props.assigned_client_identifier,
                    body.take_string()?,
                    pid,
                )?,
                id::SERVER_KEEP_ALIVE => {
                    set_once(&mut props.server_keep_alive, body.take_u16()?, pid)?
                }
                id::AUTHENTICATION_METHOD => {
                    set_once(&mut props.authentication_method, body.take_string()?, pid)?
                }
                id::AUTHENTICATION_DATA => {
                    set_once(&mut props.authentication_data, body.take_binary()?, pid)?
                }
                id::REQUEST_PROBLEM_INFORMATION => set_once(
                    &mut props.request_problem_information,
                    body.take_u8()?,
                    pid,
                )?,
                id::WILL_DELAY_INTERVAL => {
                    set_once(&mut props.will_delay_interval, body.take_u32()?, pid)?
                }
                id::REQUEST_RESPONSE_INFORMATION => set_once(
                    &mut props.request_response_information,
                    body.take_u8()?,
                    pid,
                )?,
                id::RESPONSE_INFORMATION => {
                    set_once(&mut props.response_information, body.take_string()?, pid)?
                }
                id::REASON_STRING => set_once(&mut props.reason_string, body.take_string()?, pid)?,
                id::RECEIVE_MAXIMUM => {
                    let v = body.take_u16()?;
                    if v == 0 {
                        return Err(DecodeError::MalformedPacket("receive maximum cannot be 0"));
                    }
                    set_once(&mut props.receive_maximum, v, pid)?
                }
                id::TOPIC_ALIAS_MAXIMUM => {
                    set_once(&mut props.topic_alias_maximum, body.take_u16()?, pid)?
                }
                id::TOPIC_ALIAS => {
                    set_once(&mut props.topic_alias, body.take_u16()?, pid)?;
                }
                id::MAXIMUM_QOS => set_once(&mut props.maximum_qos, body.take_u8()?, pid)?,
                id::RETAIN_AVAILABLE => set_once(&mut props.retain_available, body.take_u8()?, pid)?,
                id::USER_PROPERTY => {
                    let k = body.take_string()?;
                    let v = body.take_string()?;
                    props.user_properties.push((k, v));
                }
                id::MAXIMUM_PACKET_SIZE => {
                    let v = body.take_u32()?;
                    if v == 0 {
                        return Err(DecodeError::MalformedPacket(
                            "maximum packet size cannot be 0",
                        ));
                    }
                    set_once(&mut props.maximum_packet_size, v, pid)?
                }
                id::WILDCARD_SUB_AVAILABLE => set_once(
                    &mut props.wildcard_subscription_available,
                    body.take_u8()?,
                    pid,
                )?,
                id::SUB_ID_AVAILABLE => set_once(
                    &mut props.subscription_identifier_available,
                    body.take_u8()?,
                    pid,
                )?,
                id::SHARED_SUB_AVAILABLE => set_once(
                    &mut props.shared_subscription_available,
                    body.take_u8()?,
                    pid,
                )?,
                other => return Err(DecodeError::InvalidPropertyId(other)),
            }
        }

        Ok(props)
    }

    /// Size of the encoded block, excluding the length prefix.
    pub fn encoded_size(&self) -> usize {
        fn opt_str(s: &Option<String>) -> usize {
            s.as_ref().map_or(0, |s| 3 + s.len())
        }
        fn opt_bin(b: &Option<Bytes>) -> usize {
            b.as_ref().map_or(0, |b| 3 + b.len())
        }

        let mut size = 0;
        size += self.payload_format_indicator.map_or(0, |_| 2);
        size += self.message_expiry_interval.map_or(0, |_| 5);
        size += opt_str(&self.content_type);
        size += opt_str(&self.response_topic);
        size += opt_bin(&self.correlation_data);
        for v in &self.subscription_identifiers {
            size += 1 + variable_int_len(*v);
        }
        size += self.session_expiry_interval.map_or(0, |_| 5);
        size += opt_str(&self.assigned_client_identifier);
        size += self.server_keep_alive.map_or(0, |_| 3);
        size += opt_str(&self.authentication_method);
        size += opt_bin(&self.authentication_data);
        size += self.request_problem_information.map_or(0, |_| 2);
        size += self.will_delay_interval.map_or(0, |_| 5);
        size += self.request_response_information.map_or(0, |_| 2);
        size += opt_str(&self.response_information);
        size += opt_str(&self.reason_string);
        size += self.receive_maximum.map_or(0, |_| 3);
        size += self.topic_alias_maximum.map_or(0, |_| 3);
        size += self.topic_alias.map_or(0, |_| 3);
        size += self.maximum_qos.map_or(0, |_| 2);
        size += self.retain_available.map_or(0, |_| 2);
        for (k, v) in &self.user_properties {
            size += 5 + k.len() + v.len();
        }
        size += self.maximum_packet_size.map_or(0, |_| 5);
        size += self.wildcard_subscription_available.map_or(0, |_| 2);
        size += self.subscription_identifier_available.map_or(0, |_| 2);
        size += self.shared_subscription_available.map_or(0, |_| 2);
        size
    }

    /// Encode the block including the length prefix.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_variable_int(buf, self.encoded_size() as u32)?;

        if let Some(v) = self.payload_format_indicator {
            buf.put_u8(id::PAYLOAD_FORMAT_INDICATOR);
            buf.put_u8(v);
        }
        if let Some(v) = self.message_expiry_interval {
            buf.put_u8(id::MESSAGE_EXPIRY_INTERVAL);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.content_type {
            buf.put_u8(id::CONTENT_TYPE);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.response_topic {
            buf.put_u8(id::RESPONSE_TOPIC);
            write_string(buf, s)?;
        }
        if let Some(ref d) = self.correlation_data {
            buf.put_u8(id::CORRELATION_DATA);
            write_binary(buf, d)?;
        }
        for v in &self.subscription_identifiers {
            buf.put_u8(id::SUBSCRIPTION_IDENTIFIER);
            write_variable_int(buf, *v)?;
        }
        if let Some(v) = self.session_expiry_interval {
            buf.put_u8(id::SESSION_EXPIRY_INTERVAL);
            buf.put_u32(v);
        }
        if let Some(ref s) = self.assigned_client_identifier {
            buf.put_u8(id::ASSIGNED_CLIENT_IDENTIFIER);
            write_string(buf, s)?;
        }
        if let Some(v) = self.server_keep_alive {
            buf.put_u8(id::SERVER_KEEP_ALIVE);
            buf.put_u16(v);
        }
        if let Some(ref s) = self.authentication_method {
            buf.put_u8(id::AUTHENTICATION_METHOD);
            write_string(buf, s)?;
        }
        if let Some(ref d) = self.authentication_data {
            buf.put_u8(id::AUTHENTICATION_DATA);
            write_binary(buf, d)?;
        }
        if let Some(v) = self.request_problem_information {
            buf.put_u8(id::REQUEST_PROBLEM_INFORMATION);
            buf.put_u8(v);
        }
        if let Some(v) = self.will_delay_interval {
            buf.put_u8(id::WILL_DELAY_INTERVAL);
            buf.put_u32(v);
        }
        if let Some(v) = self.request_response_information {
            buf.put_u8(id::REQUEST_RESPONSE_INFORMATION);
            buf.put_u8(v);
        }
        if let Some(ref s) = self.response_information {
            buf.put_u8(id::RESPONSE_INFORMATION);
            write_string(buf, s)?;
        }
        if let Some(ref s) = self.reason_string {
            buf.put_u8(id::REASON_STRING);
            write_string(buf, s)?;
        }
        if let Some(v) = self.receive_maximum {
            buf.put_u8(id::RECEIVE_MAXIMUM);
            buf.put_u16(v);
        }
        if let Some(v) = self.topic_alias_maximum {
            buf.put_u8(id::TOPIC_ALIAS_MAXIMUM);
            buf.put_u16(v);
        }
        if let Some(v) = self.topic_alias {
            buf.put_u8(id::TOPIC_ALIAS);
            buf.put_u16(v);
        }
        if let Some(v) = self.maximum_qos {
            buf.put_u8(id::MAXIMUM_QOS);
            buf.put_u8(v);
        }
        if let Some(v) = self.retain_available {
            buf.put_u8(id::RETAIN_AVAILABLE);
            buf.put_u8(v);
        }
        for (k, v) in &self.user_properties {
            buf.put_u8(id::USER_PROPERTY);
            write_string(buf, k)?;
            write_string(buf, v)?;
        }
        if let Some(v) = self.maximum_packet_size {
            buf.put_u8(id::MAXIMUM_PACKET_SIZE);
            buf.put_u32(v);
        }
        if let Some(v) = self.wildcard_subscription_available {
            buf.put_u8(id::WILDCARD_SUB_AVAILABLE);
            buf.put_u8(v);
        }
        if let Some(v) = self.subscription_identifier_available {
            buf.put_u8(id::SUB_ID_AVAILABLE);
            buf.put_u8(v);
        }
        if let Some(v) = self.shared_subscription_available {
            buf.put_u8(id::SHARED_SUB_AVAILABLE);
            buf.put_u8(v);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn round_trip(props: &Properties) -> Properties {
        let mut buf = BytesMut::new();
        props.encode(&mut buf).unwrap();
        let mut cur = Cursor::new(&buf);
        let decoded = Properties::decode(&mut cur).unwrap();
        assert!(!cur.has_remaining());
        decoded
    }

    #[test]
    fn empty_block_is_single_zero_byte() {
        let mut buf = BytesMut::new();
        Properties::new().encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00]);
    }

    #[test]
    fn publish_properties_round_trip() {
        let props = Properties {
            message_expiry_interval: Some(30),
            topic_alias: Some(4),
            subscription_identifiers: vec![1, 130],
            user_properties: vec![("origin".into(), "sensor-7".into())],
            ..Default::default()
        };
        assert_eq!(round_trip(&props), props);
    }

    #[test]
    fn connack_properties_round_trip() {
        let props = Properties {
            receive_maximum: Some(1024),
            maximum_qos: Some(1),
            assigned_client_identifier: Some("ember-auto-1".into()),
            session_expiry_interval: Some(600),
            shared_subscription_available: Some(1),
            ..Default::default()
        };
        assert_eq!(round_trip(&props), props);
    }

    #[test]
    fn duplicate_property_rejected() {
        let mut buf = BytesMut::new();
        // two topic-alias properties in one block
        buf.put_u8(6);
        buf.put_u8(0x23);
        buf.put_u16(1);
        buf.put_u8(0x23);
        buf.put_u16(2);
        let mut cur = Cursor::new(&buf);
        assert_eq!(
            Properties::decode(&mut cur),
            Err(DecodeError::DuplicateProperty(0x23))
        );
    }

    #[test]
    fn zero_receive_maximum_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(3);
        buf.put_u8(0x21);
        buf.put_u16(0);
        let mut cur = Cursor::new(&buf);
        assert!(Properties::decode(&mut cur).is_err());
    }
}
