//! CONNECT handshake and session inheritance

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::debug;

use super::{Connection, ConnectionError};
use crate::protocol::{
    ConnAck, Connect, Packet, PacketType, ProtocolError, ProtocolVersion, QoS, ReasonCode,
    Subscribe, EXPIRY_PARKED,
};
use crate::session::Client;
use crate::system::Info;

/// Receive maximum assumed when a client does not advertise one.
const DEFAULT_RECEIVE_MAXIMUM: u16 = 65535;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Read the first packet and establish the session. Anything but a
    /// CONNECT is a protocol violation [MQTT-3.1.0-1].
    pub(crate) async fn handshake(&mut self) -> Result<(), ConnectionError> {
        let packet = self.read_first_packet().await?;
        match packet {
            Packet::Connect(connect) => self.process_connect(*connect).await,
            _ => Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                "first packet must be CONNECT",
            ))),
        }
    }

    async fn read_first_packet(&mut self) -> Result<Packet, ConnectionError> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                use bytes::Buf;
                self.read_buf.advance(consumed);
                Info::add(&self.broker.info.bytes_received, consumed as i64);
                Info::add(&self.broker.info.packets_received, 1);
                return Ok(packet);
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before CONNECT",
                )));
            }
        }
    }

    async fn process_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        let version = connect.protocol_version;
        self.decoder.set_protocol_version(version);
        self.encoder.set_protocol_version(version);

        let assigned_id = connect.client_id.is_empty();
        let client_id: Arc<str> = if assigned_id {
            Arc::from(format!("emberlink-{:016x}", rand_id()).as_str())
        } else {
            Arc::from(connect.client_id.as_str())
        };

        if self.broker.is_blacklisted(&client_id) {
            debug!(client = %client_id, remote = %self.addr, "rejecting blacklisted client");
            return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                "blacklisted client",
            )));
        }

        let code = self.validate_connect(&connect);
        if code.is_error() {
            // [MQTT-3.2.2-7] [MQTT-3.1.4-6]
            self.send_connack_error(code).await?;
            return Err(ConnectionError::Reason(code));
        }

        let capabilities = &self.broker.options.capabilities;
        let (client, outbound) = Client::new(
            client_id.clone(),
            self.listener.clone(),
            Some(self.addr),
            capabilities.maximum_client_writes_pending,
        );

        let clamped_expiry = {
            let mut props = client.properties.write();
            props.protocol_version = version;
            props.username = connect.username.clone();
            props.clean_start = connect.clean_start;
            props.keepalive = connect.keep_alive;
            props.will = connect.will.clone();
            if assigned_id {
                props.assigned_client_id = Some(client_id.to_string()); // [MQTT-3.1.3-7]
            }

            if version == ProtocolVersion::V5 {
                if let Some(interval) = connect.properties.session_expiry_interval {
                    props.session_expiry_interval =
                        interval.min(capabilities.maximum_session_expiry_interval);
                    props.session_expiry_set = true;
                }
                props.receive_maximum = connect
                    .properties
                    .receive_maximum
                    .unwrap_or(DEFAULT_RECEIVE_MAXIMUM);
                props.topic_alias_maximum =
                    connect.properties.topic_alias_maximum.unwrap_or(0);
                props.maximum_packet_size = connect.properties.maximum_packet_size.unwrap_or(0);
            } else {
                props.receive_maximum = DEFAULT_RECEIVE_MAXIMUM;
            }

            connect
                .properties
                .session_expiry_interval
                .filter(|interval| *interval > capabilities.maximum_session_expiry_interval)
                .map(|_| props.session_expiry_interval)
        };

        client
            .inflight
            .reset_receive_quota(i32::from(capabilities.receive_maximum));
        client
            .inflight
            .reset_send_quota(i32::from(client.properties.read().receive_maximum));
        client
            .aliases
            .set_outbound_max(client.properties.read().topic_alias_maximum);
        self.client_max_packet_size = client.properties.read().maximum_packet_size;

        self.broker.hooks.on_connect(&client, &connect).await.map_err(|e| {
            debug!(client = %client_id, error = %e, "connect hook refused connection");
            ConnectionError::Protocol(ProtocolError::ProtocolViolation("connection refused"))
        })?;

        if !self.broker.hooks.on_connect_authenticate(&client, &connect).await {
            let code = if self.broker.options.compatibilities.obscure_not_authorized {
                ReasonCode::UnspecifiedError
            } else {
                ReasonCode::BadUserNameOrPassword
            };
            self.send_connack_error(code).await?; // [MQTT-3.1.4-2]
            return Err(ConnectionError::Reason(code));
        }

        Info::add(&self.broker.info.clients_connected, 1);
        self.client = Some(client.clone());
        self.outbound = Some(outbound);

        self.broker.hooks.on_session_establish(&client, &connect).await;

        let session_present = self.inherit_session(&connect, &client).await;
        self.broker.clients.add(client.clone()); // [MQTT-4.1.0-1]

        self.send_connack_success(&client, session_present, clamped_expiry)
            .await?;

        self.broker.cancel_delayed_will(&client.id); // [MQTT-3.1.3-9]

        if session_present {
            self.resend_inflight(&client).await?;
        }

        self.broker
            .hooks
            .on_session_established(&client, &connect)
            .await;

        debug!(client = %client.id, remote = %self.addr, session_present, "session established");
        Ok(())
    }

    /// Server-side CONNECT validation on top of the packet validator.
    fn validate_connect(&self, connect: &Connect) -> ReasonCode {
        let code = connect.validate(); // [MQTT-3.1.4-1] [MQTT-3.1.4-2]
        if code.is_error() {
            return code;
        }

        let capabilities = &self.broker.options.capabilities;
        if connect.protocol_version.is_v3()
            && !connect.clean_start
            && connect.client_id.is_empty()
        {
            return ReasonCode::UnspecifiedError;
        }
        if (connect.protocol_version as u8) < capabilities.minimum_protocol_version {
            return ReasonCode::UnsupportedProtocolVersion; // [MQTT-3.1.2-2]
        }
        if let Some(will) = &connect.will {
            if will.qos as u8 > capabilities.maximum_qos {
                return ReasonCode::QoSNotSupported; // [MQTT-3.2.2-12]
            }
            if will.retain && !capabilities.retain_available {
                return ReasonCode::RetainNotSupported; // [MQTT-3.2.2-13]
            }
        }
        ReasonCode::Success
    }

    /// Inherit the session of an existing client with the same id, or load
    /// one from the persistence hooks. Returns the session-present flag.
    async fn inherit_session(&mut self, connect: &Connect, client: &Arc<Client>) -> bool {
        let broker = self.broker.clone();

        if let Some(existing) = broker.clients.get(&client.id) {
            broker.disconnect_client(&existing, ReasonCode::SessionTakenOver); // [MQTT-3.1.4-3]

            let existing_clean = {
                let props = existing.properties.read();
                props.clean_start && props.protocol_version.is_v3()
            };
            if connect.clean_start || existing_clean {
                // [MQTT-3.1.2-4] [MQTT-3.1.4-4]: discard the old session
                broker.unsubscribe_client(&existing).await;
                let cleared = existing.inflight.clear_expired(i64::MAX, 0);
                if !cleared.is_empty() {
                    Info::add(&broker.info.inflight, -(cleared.len() as i64));
                }
                // only mark taken over once the unsubscribe has run
                existing.set_taken_over();
                return false; // [MQTT-3.2.2-3]
            }

            existing.set_taken_over();

            if !existing.inflight.is_empty() {
                client.inflight.install(existing.inflight.entries()); // [MQTT-3.1.2-5]
                if client.inflight.max_receive_quota() == 0
                    && broker.options.capabilities.receive_maximum != 0
                {
                    client
                        .inflight
                        .reset_receive_quota(i32::from(broker.options.capabilities.receive_maximum));
                    client
                        .inflight
                        .reset_send_quota(i32::from(client.properties.read().receive_maximum));
                }
            }

            let inherited: Vec<_> = existing.subscriptions.read().values().cloned().collect();
            for sub in inherited {
                let (is_new, count) = broker.topics.subscribe(&client.id, sub.clone()); // [MQTT-3.8.4-3]
                if is_new {
                    Info::add(&broker.info.subscriptions, 1);
                    let packet = Subscribe {
                        packet_id: 0,
                        filters: vec![sub.clone()],
                        properties: Default::default(),
                    };
                    broker
                        .hooks
                        .on_subscribed(client, &packet, &[sub.qos as u8], &[count])
                        .await;
                }
                client
                    .subscriptions
                    .write()
                    .insert(sub.filter.clone(), sub.clone());
                broker.publish_retained_to_client(client, &sub, !is_new).await;
            }

            // bound takeover memory: sequential takeovers must not pile up
            // inflight + subscription state on displaced clients
            broker.unsubscribe_client(&existing).await;
            existing.inflight.clear();

            debug!(
                client = %client.id,
                old_remote = ?existing.remote_addr,
                new_remote = %self.addr,
                "session taken over"
            );
            return true; // [MQTT-3.2.2-3]
        }

        if Info::get(&broker.info.clients_connected) > Info::get(&broker.info.clients_maximum) {
            Info::add(&broker.info.clients_maximum, 1);
        }

        if connect.clean_start {
            return false;
        }

        self.load_client_history(client).await
    }

    /// Restore a stored session for this client id from the persistence
    /// hooks, if one exists.
    async fn load_client_history(&self, client: &Arc<Client>) -> bool {
        let broker = &self.broker;
        let subs = broker.hooks.stored_subscriptions_by_cid(&client.id).await;
        let inflight = broker.hooks.stored_inflight_by_cid(&client.id).await;
        if subs.is_empty() && inflight.is_empty() {
            return false;
        }

        for stored in subs {
            let sub = stored.subscription;
            let (is_new, _) = broker.topics.subscribe(&client.id, sub.clone());
            if is_new {
                Info::add(&broker.info.subscriptions, 1);
            }
            client
                .subscriptions
                .write()
                .insert(sub.filter.clone(), sub);
        }
        for msg in inflight {
            if client.inflight.set(msg) {
                Info::add(&broker.info.inflight, 1);
            }
        }
        true
    }

    async fn send_connack_error(&mut self, code: ReasonCode) -> Result<(), ConnectionError> {
        let mut connack = ConnAck {
            session_present: false, // [MQTT-3.2.2-6]
            reason_code: code,      // [MQTT-3.2.2-8]
            ..Default::default()
        };
        connack.properties.reason_string = Some(code.reason().to_string());
        self.write_packet(&Packet::ConnAck(connack)).await
    }

    async fn send_connack_success(
        &mut self,
        client: &Arc<Client>,
        session_present: bool,
        clamped_expiry: Option<u32>,
    ) -> Result<(), ConnectionError> {
        let capabilities = &self.broker.options.capabilities;
        let mut connack = ConnAck {
            session_present, // [MQTT-3.2.0-1] [MQTT-3.2.0-2]
            reason_code: ReasonCode::Success,
            ..Default::default()
        };

        let props = &mut connack.properties;
        props.receive_maximum = Some(capabilities.receive_maximum); // 3.2.2.3.3
        if capabilities.maximum_qos < QoS::ExactlyOnce as u8 {
            props.maximum_qos = Some(capabilities.maximum_qos); // [MQTT-3.2.2-9]
        }
        {
            let client_props = client.properties.read();
            if client_props.server_keepalive {
                props.server_keep_alive = Some(client_props.keepalive); // [MQTT-3.1.2-21]
            }
            if let Some(ref assigned) = client_props.assigned_client_id {
                props.assigned_client_identifier = Some(assigned.clone()); // [MQTT-3.2.2-16]
            }
        }
        if let Some(expiry) = clamped_expiry {
            props.session_expiry_interval = Some(expiry);
        }
        if self.broker.options.compatibilities.always_return_response_info {
            props.response_information = Some(String::new());
        }

        self.write_packet(&Packet::ConnAck(connack)).await // [MQTT-3.1.4-5]
    }

    /// Rewrite non-parked inflight state to the wire after inheriting a
    /// session [MQTT-4.4.0-1]: stored PUBREL/PUBREC acks as themselves,
    /// publishes with the DUP flag.
    async fn resend_inflight(&mut self, client: &Arc<Client>) -> Result<(), ConnectionError> {
        for mut msg in client.inflight.entries() {
            if msg.expiry == EXPIRY_PARKED {
                continue;
            }
            if msg.packet_type == PacketType::Publish && msg.qos != QoS::AtMostOnce {
                msg.dup = true; // [MQTT-3.3.1-1]
            }
            self.write_packet(&msg.to_packet()).await?;
        }
        Ok(())
    }
}

/// Random id for server-assigned client identifiers.
pub(crate) fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    RandomState::new().build_hasher().finish()
}
