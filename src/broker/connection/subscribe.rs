//! SUBSCRIBE and UNSUBSCRIBE processing

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{Connection, ConnectionError};
use crate::protocol::{
    Packet, ReasonCode, SubAck, Subscribe, UnsubAck, Unsubscribe,
};
use crate::session::Client;
use crate::system::Info;
use crate::topic::{is_shared_filter, validate_topic_filter};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) async fn process_subscribe(
        &mut self,
        client: &Arc<Client>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let broker = self.broker.clone();
        let packet = broker.hooks.on_subscribe(client, subscribe).await;
        let version = client.properties.read().protocol_version;
        let capabilities = &broker.options.capabilities;

        // 3.9.3 non-normative: a reused packet id fails every filter
        let packet_code = if client.inflight.contains(packet.packet_id) {
            ReasonCode::PacketIdInUse
        } else {
            ReasonCode::Success
        };

        let mut reason_codes = Vec::with_capacity(packet.filters.len());
        let mut counts = vec![0usize; packet.filters.len()];
        let mut filter_existed = vec![false; packet.filters.len()];

        for (i, sub) in packet.filters.iter().enumerate() {
            let mut sub = sub.clone();
            let code = if packet_code.is_error() {
                packet_code
            } else if validate_topic_filter(&sub.filter).is_err() {
                ReasonCode::TopicFilterInvalid
            } else if sub.no_local && is_shared_filter(&sub.filter) {
                ReasonCode::ProtocolError // [MQTT-3.8.3-4]
            } else if !capabilities.wildcard_sub_available && sub.filter.contains(['+', '#']) {
                ReasonCode::WildcardSubsNotSupported
            } else if !capabilities.shared_sub_available && is_shared_filter(&sub.filter) {
                ReasonCode::SharedSubsNotSupported
            } else if !capabilities.sub_id_available && sub.identifier.is_some() {
                ReasonCode::SubIdNotSupported
            } else if !broker.hooks.on_acl_check(client, &sub.filter, false).await {
                if broker.options.compatibilities.obscure_not_authorized {
                    ReasonCode::UnspecifiedError
                } else {
                    ReasonCode::NotAuthorized
                }
            } else {
                sub.qos = capabilities.cap_qos(sub.qos); // [MQTT-3.2.2-9]
                let (is_new, count) = broker.topics.subscribe(&client.id, sub.clone()); // [MQTT-3.8.4-3]
                if is_new {
                    Info::add(&broker.info.subscriptions, 1);
                }
                client
                    .subscriptions
                    .write()
                    .insert(sub.filter.clone(), sub.clone()); // [MQTT-3.2.2-10]
                filter_existed[i] = !is_new;
                counts[i] = count;
                ReasonCode::granted(sub.qos) // [MQTT-3.9.3-1] [MQTT-3.8.4-7]
            };

            let mut code_byte = code as u8;
            // v3 lacks the richer codes; anything above granted-qos-2 collapses
            if code_byte > ReasonCode::GrantedQoS2 as u8 && version.is_v3() {
                code_byte = ReasonCode::UnspecifiedError as u8;
            }
            reason_codes.push(code_byte);
        }

        let mut suback = SubAck {
            packet_id: packet.packet_id, // [MQTT-3.8.4-2]
            reason_codes: reason_codes.clone(),
            properties: Default::default(),
        };
        suback.properties.user_properties = packet.properties.user_properties.clone();
        if packet_code.is_error() {
            suback.properties.reason_string = Some(packet_code.reason().to_string());
        }

        broker
            .hooks
            .on_subscribed(client, &packet, &reason_codes, &counts)
            .await;
        self.write_packet(&Packet::SubAck(suback)).await?;

        // deliver retained snapshots for the accepted filters [MQTT-3.3.1-9]
        for (i, sub) in packet.filters.iter().enumerate() {
            if reason_codes[i] >= ReasonCode::UnspecifiedError as u8 {
                continue;
            }
            broker
                .publish_retained_to_client(client, sub, filter_existed[i])
                .await;
        }

        debug!(client = %client.id, filters = packet.filters.len(), "subscribed");
        Ok(())
    }

    pub(crate) async fn process_unsubscribe(
        &mut self,
        client: &Arc<Client>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        let broker = self.broker.clone();
        let packet = broker.hooks.on_unsubscribe(client, unsubscribe).await;
        let version = client.properties.read().protocol_version;

        let packet_code = if client.inflight.contains(packet.packet_id) {
            ReasonCode::PacketIdInUse
        } else {
            ReasonCode::Success
        };

        let mut reason_codes = Vec::with_capacity(packet.filters.len());
        let mut counts = vec![0usize; packet.filters.len()];

        for (i, filter) in packet.filters.iter().enumerate() {
            if packet_code.is_error() {
                reason_codes.push(packet_code as u8);
                continue;
            }

            let (removed, count) = broker.topics.unsubscribe(filter, &client.id);
            if removed {
                Info::add(&broker.info.subscriptions, -1);
                reason_codes.push(ReasonCode::Success as u8);
            } else {
                reason_codes.push(ReasonCode::NoSubscriptionExisted as u8);
            }
            counts[i] = count;

            client.subscriptions.write().remove(filter); // [MQTT-3.10.4-2]
        }

        let mut unsuback = UnsubAck {
            packet_id: packet.packet_id, // [MQTT-3.10.4-5]
            reason_codes: if version.is_v3() {
                Vec::new() // v3 UNSUBACK has no payload
            } else {
                reason_codes.clone() // [MQTT-3.11.3-2]
            },
            properties: Default::default(),
        };
        unsuback.properties.user_properties = packet.properties.user_properties.clone();
        if packet_code.is_error() {
            unsuback.properties.reason_string = Some(packet_code.reason().to_string());
        }

        broker
            .hooks
            .on_unsubscribed(client, &packet, &reason_codes, &counts)
            .await;
        self.write_packet(&Packet::UnsubAck(unsuback)).await // [MQTT-3.10.4-4]
    }
}
