//! MQTT packet definitions
//!
//! Unified packet types supporting MQTT v3.1, v3.1.1 and v5.0, plus the
//! broker-side [`Message`] representation used by the router and the
//! inflight store.

use std::sync::Arc;

use bytes::Bytes;

use super::{PacketType, Properties, ProtocolVersion, QoS, ReasonCode, RetainHandling};

/// MQTT packet - unified representation for all supported versions
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(Ack),
    PubRec(Ack),
    PubRel(Ack),
    PubComp(Ack),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
    Auth(Auth),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::PubRec(_) => PacketType::PubRec,
            Packet::PubRel(_) => PacketType::PubRel,
            Packet::PubComp(_) => PacketType::PubComp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect(_) => PacketType::Disconnect,
            Packet::Auth(_) => PacketType::Auth,
        }
    }
}

/// CONNECT packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_version: ProtocolVersion,
    pub client_id: String,
    /// Clean session (v3) / clean start (v5)
    pub clean_start: bool,
    pub keep_alive: u16,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<Will>,
    /// Properties (v5.0 only)
    pub properties: Properties,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V5,
            client_id: String::new(),
            clean_start: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
            properties: Properties::default(),
        }
    }
}

impl Connect {
    /// Validate that the connect packet is compliant [MQTT-3.1.4-1] [MQTT-3.1.4-2].
    pub fn validate(&self) -> ReasonCode {
        if self.client_id.len() > 65535 {
            return ReasonCode::ClientIdNotValid;
        }
        if self.password.is_some() && self.username.is_none() && self.protocol_version.is_v3() {
            // v3 password requires username; v5 allows password alone
            return ReasonCode::MalformedPacket;
        }
        if let Some(ref will) = self.will {
            if will.topic.is_empty() {
                return ReasonCode::TopicNameInvalid;
            }
            if will.topic.contains(['+', '#']) {
                return ReasonCode::TopicNameInvalid;
            }
        }
        ReasonCode::Success
    }
}

/// Will message carried in CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Will properties (v5.0 only); delay interval lives here
    pub properties: Properties,
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnAck {
    pub session_present: bool,
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

/// PUBLISH packet (bidirectional)
///
/// The topic is `Arc<str>` so fan-out copies clone it in O(1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: Arc<str>,
    /// Present only for QoS > 0
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub properties: Properties,
}

impl Default for Publish {
    fn default() -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(""),
            packet_id: None,
            payload: Bytes::new(),
            properties: Properties::default(),
        }
    }
}

impl Publish {
    /// Validate an inbound publish [MQTT-2.2.1-2] [MQTT-3.3.2-2].
    pub fn validate(&self, topic_alias_maximum: u16) -> ReasonCode {
        match (self.qos, self.packet_id) {
            (QoS::AtMostOnce, Some(_)) => return ReasonCode::ProtocolError,
            (QoS::AtLeastOnce | QoS::ExactlyOnce, None | Some(0)) => {
                return ReasonCode::ProtocolError
            }
            _ => {}
        }
        if let Some(alias) = self.properties.topic_alias {
            if alias == 0 || alias > topic_alias_maximum {
                return ReasonCode::TopicAliasInvalid;
            }
        } else if self.topic.is_empty() {
            return ReasonCode::TopicNameInvalid;
        }
        ReasonCode::Success
    }
}

/// PUBACK / PUBREC / PUBREL / PUBCOMP share one wire shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub packet_id: u16,
    /// Reason code (v5.0 only on the wire)
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl Ack {
    pub fn new(packet_id: u16) -> Self {
        Self {
            packet_id,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        }
    }

    pub fn with_reason(packet_id: u16, reason_code: ReasonCode) -> Self {
        Self {
            packet_id,
            reason_code,
            properties: Properties::default(),
        }
    }
}

/// A single subscription request, also the broker's subscription record.
///
/// Ordinary and shared subscriptions use the same record; shared filters are
/// recognised by their `$share/<group>/` prefix. `identifiers` accumulates
/// subscription identifiers when one client's overlapping filters match the
/// same topic; `fwd_retained` is set transiently while delivering the
/// retained snapshot for a fresh subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
    pub identifier: Option<u32>,
    pub identifiers: Vec<u32>,
    pub fwd_retained: bool,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
            ..Default::default()
        }
    }

    /// Decode the v5 subscription options byte; reserved bits must be zero.
    pub fn apply_options_byte(&mut self, byte: u8) -> Option<()> {
        if byte & 0xC0 != 0 {
            return None;
        }
        self.qos = QoS::from_u8(byte & 0x03)?;
        self.no_local = byte & 0x04 != 0;
        self.retain_as_published = byte & 0x08 != 0;
        self.retain_handling = RetainHandling::from_u8((byte >> 4) & 0x03)?;
        Some(())
    }

    pub fn options_byte(&self) -> u8 {
        (self.qos as u8)
            | ((self.no_local as u8) << 2)
            | ((self.retain_as_published as u8) << 3)
            | ((self.retain_handling as u8) << 4)
    }
}

/// SUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<Subscription>,
    pub properties: Properties,
}

impl Subscribe {
    /// Validate a subscribe packet [MQTT-3.8.3-2] [MQTT-2.2.1-3].
    pub fn validate(&self) -> ReasonCode {
        if self.packet_id == 0 {
            return ReasonCode::ProtocolError;
        }
        if self.filters.is_empty() {
            return ReasonCode::ProtocolError;
        }
        ReasonCode::Success
    }
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub reason_codes: Vec<u8>,
    pub properties: Properties,
}

/// UNSUBSCRIBE packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
    pub properties: Properties,
}

impl Unsubscribe {
    /// Validate an unsubscribe packet [MQTT-3.10.3-2] [MQTT-2.2.1-3].
    pub fn validate(&self) -> ReasonCode {
        if self.packet_id == 0 {
            return ReasonCode::ProtocolError;
        }
        if self.filters.is_empty() {
            return ReasonCode::ProtocolError;
        }
        ReasonCode::Success
    }
}

/// UNSUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    pub packet_id: u16,
    /// Reason codes (v5.0 only; v3 has no payload)
    pub reason_codes: Vec<u8>,
    pub properties: Properties,
}

/// DISCONNECT packet (bidirectional in v5.0)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

/// AUTH packet (v5.0 only)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Auth {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

impl Auth {
    /// Validate an auth packet [MQTT-3.15.2-1].
    pub fn validate(&self) -> ReasonCode {
        match self.reason_code {
            ReasonCode::Success
            | ReasonCode::ContinueAuthentication
            | ReasonCode::ReAuthenticate => ReasonCode::Success,
            _ => ReasonCode::ProtocolError,
        }
    }
}

/// Park marker: an inflight entry whose transmission waits on send quota.
pub const EXPIRY_PARKED: i64 = -1;

/// Broker-side message: a publish (or a stored qos ack) together with the
/// routing metadata the core tracks for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Publish, or the stored ack type for receiver-side QoS 2 state
    pub packet_type: PacketType,
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub packet_id: u16,
    pub reason_code: ReasonCode,
    pub properties: Properties,
    /// Client id the publish originated from
    pub origin: Arc<str>,
    /// Unix seconds at receipt; 0 until the router stamps it
    pub created: i64,
    /// Unix seconds after which the message is dropped; [`EXPIRY_PARKED`]
    /// while waiting on send quota
    pub expiry: i64,
    /// Set by a hook to suppress delivery without an error
    pub ignore: bool,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            packet_type: PacketType::Publish,
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(""),
            payload: Bytes::new(),
            packet_id: 0,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
            origin: Arc::from(""),
            created: 0,
            expiry: 0,
            ignore: false,
        }
    }
}

impl Message {
    /// Capture an inbound publish for routing. The payload is shared, not
    /// copied.
    pub fn from_publish(publish: &Publish, origin: Arc<str>) -> Self {
        Self {
            packet_type: PacketType::Publish,
            dup: publish.dup,
            qos: publish.qos,
            retain: publish.retain,
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            packet_id: publish.packet_id.unwrap_or(0),
            properties: publish.properties.clone(),
            origin,
            ..Default::default()
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry > 0 && self.expiry < now
    }

    /// Wire packet for this message. Stored acks reproduce their ack type;
    /// everything else is a publish.
    pub fn to_packet(&self) -> Packet {
        match self.packet_type {
            PacketType::PubAck => Packet::PubAck(self.to_ack()),
            PacketType::PubRec => Packet::PubRec(self.to_ack()),
            PacketType::PubRel => Packet::PubRel(self.to_ack()),
            PacketType::PubComp => Packet::PubComp(self.to_ack()),
            _ => Packet::Publish(Publish {
                dup: self.dup,
                qos: self.qos,
                retain: self.retain,
                topic: self.topic.clone(),
                packet_id: (self.packet_id > 0).then_some(self.packet_id),
                payload: self.payload.clone(),
                properties: self.properties.clone(),
            }),
        }
    }

    fn to_ack(&self) -> Ack {
        Ack {
            packet_id: self.packet_id,
            reason_code: self.reason_code,
            properties: self.properties.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_validate_packet_id_rules() {
        let mut pk = Publish {
            topic: Arc::from("a/b"),
            ..Default::default()
        };
        assert_eq!(pk.validate(65535), ReasonCode::Success);

        pk.packet_id = Some(1);
        assert_eq!(pk.validate(65535), ReasonCode::ProtocolError);

        pk.qos = QoS::AtLeastOnce;
        assert_eq!(pk.validate(65535), ReasonCode::Success);

        pk.packet_id = None;
        assert_eq!(pk.validate(65535), ReasonCode::ProtocolError);
    }

    #[test]
    fn publish_validate_topic_alias_bounds() {
        let mut pk = Publish {
            topic: Arc::from("a"),
            ..Default::default()
        };
        pk.properties.topic_alias = Some(10);
        assert_eq!(pk.validate(5), ReasonCode::TopicAliasInvalid);
        assert_eq!(pk.validate(10), ReasonCode::Success);
    }

    #[test]
    fn subscription_options_byte_round_trip() {
        let mut sub = Subscription::new("a/b", QoS::AtLeastOnce);
        sub.no_local = true;
        sub.retain_handling = RetainHandling::SendAtSubscribeIfNew;
        let byte = sub.options_byte();
        let mut decoded = Subscription::new("a/b", QoS::AtMostOnce);
        decoded.apply_options_byte(byte).unwrap();
        assert_eq!(decoded.qos, QoS::AtLeastOnce);
        assert!(decoded.no_local);
        assert_eq!(decoded.retain_handling, RetainHandling::SendAtSubscribeIfNew);
    }

    #[test]
    fn subscription_options_reserved_bits() {
        let mut sub = Subscription::default();
        assert!(sub.apply_options_byte(0x80).is_none());
    }

    #[test]
    fn stored_ack_round_trips_as_ack_packet() {
        let msg = Message {
            packet_type: PacketType::PubRel,
            packet_id: 11,
            ..Default::default()
        };
        match msg.to_packet() {
            Packet::PubRel(ack) => assert_eq!(ack.packet_id, 11),
            other => panic!("expected pubrel, got {:?}", other.packet_type()),
        }
    }

    #[test]
    fn connect_validate_rejects_wildcard_will_topic() {
        let connect = Connect {
            will: Some(Will {
                topic: "a/+/b".into(),
                payload: Bytes::new(),
                qos: QoS::AtMostOnce,
                retain: false,
                properties: Properties::default(),
            }),
            ..Default::default()
        };
        assert_eq!(connect.validate(), ReasonCode::TopicNameInvalid);
    }
}
