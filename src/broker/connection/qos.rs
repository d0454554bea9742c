//! QoS acknowledgement handling (PUBACK, PUBREC, PUBREL, PUBCOMP)

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use super::{Connection, ConnectionError};
use crate::protocol::{Ack, PacketType};
use crate::session::Client;
use crate::system::Info;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// PUBACK completes a QoS 1 exchange the broker initiated.
    pub(crate) async fn process_puback(
        &mut self,
        client: &Arc<Client>,
        ack: Ack,
    ) -> Result<(), ConnectionError> {
        if !client.inflight.contains(ack.packet_id) {
            return Ok(()); // would be packet-identifier-not-found; omitted
        }

        if client.inflight.delete(ack.packet_id) {
            // [MQTT-4.3.2-5]
            client.inflight.increase_send_quota();
            Info::add(&self.broker.info.inflight, -1);
            let msg = self.msg_for(&ack, PacketType::PubAck);
            self.broker.hooks.on_qos_complete(client, &msg).await;
        }
        Ok(())
    }

    /// PUBREC acknowledges receipt of a QoS 2 publish the broker sent.
    pub(crate) async fn process_pubrec(
        &mut self,
        client: &Arc<Client>,
        ack: Ack,
    ) -> Result<(), ConnectionError> {
        if !client.inflight.contains(ack.packet_id) {
            // [MQTT-4.3.3-7] [MQTT-4.3.3-13]
            let out = self.broker.build_ack(
                ack.packet_id,
                PacketType::PubRel,
                &ack.properties,
                crate::protocol::ReasonCode::PacketIdNotFound,
            );
            return self.write_packet(&out.to_packet()).await;
        }

        if ack.reason_code.is_error() {
            // abandoned by the receiver, per v5 section 4.13.2
            if client.inflight.delete(ack.packet_id) {
                Info::add(&self.broker.info.inflight, -1);
            }
            let msg = self.msg_for(&ack, PacketType::PubRec);
            self.broker.hooks.on_qos_dropped(client, &msg).await;
            return Ok(());
        }

        let out = self.broker.build_ack(
            ack.packet_id,
            PacketType::PubRel,
            &ack.properties,
            crate::protocol::ReasonCode::Success,
        ); // [MQTT-4.3.3-4]
        client.inflight.decrease_receive_quota();
        client.inflight.set(out.clone()); // [MQTT-4.3.3-5]
        self.write_packet(&out.to_packet()).await
    }

    /// PUBREL releases a QoS 2 publish the client sent.
    pub(crate) async fn process_pubrel(
        &mut self,
        client: &Arc<Client>,
        ack: Ack,
    ) -> Result<(), ConnectionError> {
        if !client.inflight.contains(ack.packet_id) {
            // [MQTT-4.3.3-7] [MQTT-4.3.3-13]
            let out = self.broker.build_ack(
                ack.packet_id,
                PacketType::PubComp,
                &ack.properties,
                crate::protocol::ReasonCode::PacketIdNotFound,
            );
            return self.write_packet(&out.to_packet()).await;
        }

        if ack.reason_code.is_error() {
            // [MQTT-4.3.3-9]
            if client.inflight.delete(ack.packet_id) {
                Info::add(&self.broker.info.inflight, -1);
            }
            let msg = self.msg_for(&ack, PacketType::PubRel);
            self.broker.hooks.on_qos_dropped(client, &msg).await;
            return Ok(());
        }

        let out = self.broker.build_ack(
            ack.packet_id,
            PacketType::PubComp,
            &ack.properties,
            crate::protocol::ReasonCode::Success,
        ); // [MQTT-4.3.3-11]
        client.inflight.set(out.clone());
        self.write_packet(&out.to_packet()).await?;

        client.inflight.increase_receive_quota();
        client.inflight.increase_send_quota();
        if client.inflight.delete(ack.packet_id) {
            // [MQTT-4.3.3-12]
            Info::add(&self.broker.info.inflight, -1);
            self.broker.hooks.on_qos_complete(client, &out).await;
        }
        Ok(())
    }

    /// PUBCOMP finishes a QoS 2 exchange the broker initiated. The flow ends
    /// and the quotas are restored whatever the reason code says.
    pub(crate) async fn process_pubcomp(
        &mut self,
        client: &Arc<Client>,
        ack: Ack,
    ) -> Result<(), ConnectionError> {
        client.inflight.increase_receive_quota();
        client.inflight.increase_send_quota();
        if client.inflight.delete(ack.packet_id) {
            Info::add(&self.broker.info.inflight, -1);
            let msg = self.msg_for(&ack, PacketType::PubComp);
            self.broker.hooks.on_qos_complete(client, &msg).await;
        }
        Ok(())
    }

    fn msg_for(&self, ack: &Ack, packet_type: PacketType) -> crate::protocol::Message {
        crate::protocol::Message {
            packet_type,
            packet_id: ack.packet_id,
            reason_code: ack.reason_code,
            properties: ack.properties.clone(),
            ..Default::default()
        }
    }
}
