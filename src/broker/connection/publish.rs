//! Inbound PUBLISH processing

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{Connection, ConnectionError};
use crate::hooks::PublishCheck;
use crate::protocol::{Message, PacketType, ProtocolVersion, Publish, QoS, ReasonCode};
use crate::session::Client;
use crate::system::{unix_now, Info};
use crate::topic::validate_topic_name;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) async fn process_publish(
        &mut self,
        client: &Arc<Client>,
        mut publish: Publish,
    ) -> Result<(), ConnectionError> {
        let version = client.properties.read().protocol_version;

        // resolve the v5 inbound topic alias before topic validation
        if let Some(alias) = publish.properties.topic_alias {
            if alias > 0 {
                if publish.topic.is_empty() {
                    match client.aliases.resolve_inbound(alias) {
                        Some(topic) => publish.topic = topic,
                        None => {
                            return Err(ConnectionError::Reason(ReasonCode::TopicAliasInvalid))
                        }
                    }
                } else {
                    client.aliases.set_inbound(alias, publish.topic.clone()); // [MQTT-3.3.2-11]
                }
            }
        }

        // wildcard or null-bearing topics are dropped silently
        if !client.inline && validate_topic_name(&publish.topic).is_err() {
            debug!(client = %client.id, "dropping publish with invalid topic name");
            return Ok(());
        }

        if client.inflight.receive_quota() == 0 {
            // ~[MQTT-3.3.4-7] ~[MQTT-3.3.4-8]
            return Err(ConnectionError::Reason(ReasonCode::ReceiveMaxExceeded));
        }

        if !client.inline && !self.broker.hooks.on_acl_check(client, &publish.topic, true).await {
            let reason = if self.broker.options.compatibilities.obscure_not_authorized {
                ReasonCode::UnspecifiedError
            } else {
                ReasonCode::NotAuthorized
            };
            return match publish.qos {
                QoS::AtMostOnce => Ok(()),
                _ if version != ProtocolVersion::V5 => Err(ConnectionError::Reason(reason)),
                QoS::AtLeastOnce => {
                    let ack = self.broker.build_ack(
                        publish.packet_id.unwrap_or(0),
                        PacketType::PubAck,
                        &publish.properties,
                        reason,
                    );
                    self.write_packet(&ack.to_packet()).await
                }
                QoS::ExactlyOnce => {
                    let ack = self.broker.build_ack(
                        publish.packet_id.unwrap_or(0),
                        PacketType::PubRec,
                        &publish.properties,
                        reason,
                    );
                    self.write_packet(&ack.to_packet()).await
                }
            };
        }

        let mut msg = Message::from_publish(&publish, client.id.clone());
        msg.created = unix_now();

        if !client.inline {
            if let Some(existing) = client.inflight.get(msg.packet_id) {
                if existing.packet_type == PacketType::PubRec {
                    // unacknowledged QoS 2 exchange still open [MQTT-4.3.3-10]
                    let ack = self.broker.build_ack(
                        msg.packet_id,
                        PacketType::PubRec,
                        &publish.properties,
                        ReasonCode::PacketIdInUse,
                    );
                    return self.write_packet(&ack.to_packet()).await;
                }
                if client.inflight.delete(msg.packet_id) {
                    // [MQTT-4.3.2-5]
                    Info::add(&self.broker.info.inflight, -1);
                }
            }
        }

        msg.qos = self.broker.options.capabilities.cap_qos(msg.qos); // [MQTT-3.2.2-9]

        match self.broker.hooks.on_publish(client, msg).await {
            PublishCheck::Allow(m) | PublishCheck::Ignore(m) => msg = m,
            PublishCheck::Reject => return Ok(()),
            PublishCheck::Error(code) => {
                if version == ProtocolVersion::V5 && publish.qos != QoS::AtMostOnce {
                    let ack = self.broker.build_ack(
                        publish.packet_id.unwrap_or(0),
                        PacketType::PubAck,
                        &publish.properties,
                        code,
                    );
                    self.write_packet(&ack.to_packet()).await?;
                }
                return Ok(());
            }
        }

        if msg.retain {
            // [MQTT-3.3.1-5] ![MQTT-3.3.1-8]
            self.broker.retain_message(client, &msg).await;
        }

        // inline publishes skip the inbound QoS exchange entirely
        if msg.qos == QoS::AtMostOnce || client.inline {
            self.broker.fan_out(msg.clone()).await;
            self.broker.hooks.on_published(client, &msg).await;
            return Ok(());
        }

        client.inflight.decrease_receive_quota();

        let ack = if msg.qos == QoS::ExactlyOnce {
            // [MQTT-3.3.4-1] [MQTT-4.3.3-8]
            self.broker.build_ack(
                msg.packet_id,
                PacketType::PubRec,
                &publish.properties,
                ReasonCode::Success,
            )
        } else {
            // [MQTT-4.3.2-4]
            self.broker.build_ack(
                msg.packet_id,
                PacketType::PubAck,
                &publish.properties,
                ReasonCode::granted(msg.qos),
            )
        };

        if client.inflight.set(ack.clone()) {
            Info::add(&self.broker.info.inflight, 1);
            self.broker.hooks.on_qos_publish(client, &ack).await;
        }

        self.write_packet(&ack.to_packet()).await?;

        if msg.qos == QoS::AtLeastOnce {
            // the QoS 1 exchange completes with the ack on the wire
            if client.inflight.delete(ack.packet_id) {
                Info::add(&self.broker.info.inflight, -1);
            }
            client.inflight.increase_receive_quota();
            self.broker.hooks.on_qos_complete(client, &ack).await;
        }

        self.broker.fan_out(msg.clone()).await;
        self.broker.hooks.on_published(client, &msg).await;

        Ok(())
    }
}
