//! Connection handler (session machine)
//!
//! Owns one accepted byte stream: executes the MQTT handshake, reads and
//! dispatches packets, drains the client's outbound channel, and enforces
//! the keepalive deadline. Teardown publishes the will, notifies hooks and
//! applies the session expiry rules.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use super::Broker;
use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    Disconnect, Packet, PacketType, ProtocolError, ProtocolVersion, ReasonCode,
};
use crate::session::Client;
use crate::system::{unix_now, Info};

/// Grace period for the CONNECT packet to arrive.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    /// Packet dispatch decided on a disconnect-class close
    Reason(ReasonCode),
    /// CONNECT did not arrive in time
    ConnectTimeout,
    /// Keepalive deadline exceeded
    KeepAlive,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "io error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "{}", e),
            ConnectionError::Reason(code) => write!(f, "{}", code),
            ConnectionError::ConnectTimeout => write!(f, "connect timeout"),
            ConnectionError::KeepAlive => write!(f, "keepalive timeout"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<crate::protocol::DecodeError> for ConnectionError {
    fn from(e: crate::protocol::DecodeError) -> Self {
        ConnectionError::Protocol(ProtocolError::Decode(e))
    }
}

impl From<crate::protocol::EncodeError> for ConnectionError {
    fn from(e: crate::protocol::EncodeError) -> Self {
        ConnectionError::Protocol(ProtocolError::Encode(e))
    }
}

impl ConnectionError {
    /// Reason reported to the disconnect hooks.
    fn reason(&self) -> Option<ReasonCode> {
        match self {
            ConnectionError::Io(_) => Some(ReasonCode::UnspecifiedError),
            ConnectionError::Protocol(_) => Some(ReasonCode::MalformedPacket),
            ConnectionError::Reason(code) => Some(*code),
            ConnectionError::ConnectTimeout => Some(ReasonCode::MaximumConnectTime),
            ConnectionError::KeepAlive => Some(ReasonCode::KeepAliveTimeout),
        }
    }
}

/// Session machine for a single connection.
pub struct Connection<S> {
    pub(crate) broker: Arc<Broker>,
    pub(crate) listener: Arc<str>,
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    /// Set once the handshake completes
    pub(crate) client: Option<Arc<Client>>,
    pub(crate) outbound: Option<mpsc::Receiver<Packet>>,
    /// Client's advertised maximum packet size (0 = unbounded)
    pub(crate) client_max_packet_size: u32,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(broker: Arc<Broker>, listener: Arc<str>, stream: S, addr: SocketAddr) -> Self {
        let max_packet_size = broker.options.capabilities.maximum_packet_size as usize;
        Self {
            broker,
            listener,
            stream,
            addr,
            decoder: Decoder::new().with_max_packet_size(max_packet_size),
            encoder: Encoder::default(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            client: None,
            outbound: None,
            client_max_packet_size: 0,
        }
    }

    /// Run the connection to completion.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let handshake = tokio::time::timeout(CONNECT_TIMEOUT, self.handshake()).await;
        match handshake {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // no session was established; nothing to tear down
                if self.client.is_none() {
                    debug!(remote = %self.addr, error = %e, "handshake failed");
                    return Err(e);
                }
                return self.teardown(Err(e)).await;
            }
            Err(_) => {
                debug!(remote = %self.addr, "connect timeout");
                return Err(ConnectionError::ConnectTimeout);
            }
        }

        let result = self.read_loop().await;
        self.teardown(result).await
    }

    /// Read, dispatch, write and watch the keepalive until the connection
    /// ends.
    async fn read_loop(&mut self) -> Result<(), ConnectionError> {
        let client = self
            .client
            .clone()
            .ok_or(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                "read loop without session",
            )))?;
        let mut outbound = self
            .outbound
            .take()
            .ok_or(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                "read loop without outbound channel",
            )))?;

        // server-side read deadline of 1.5x the keepalive; 0 disables it
        let keepalive_secs = client.properties.read().keepalive;
        let keepalive = if keepalive_secs > 0 {
            Duration::from_millis(u64::from(keepalive_secs) * 1500)
        } else {
            Duration::from_secs(60 * 60 * 24 * 365)
        };
        let mut deadline = Instant::now() + keepalive;

        loop {
            tokio::select! {
                biased;

                _ = client.stopped() => {
                    if let Some(packet) = client.take_stop_packet() {
                        let _ = self.write_packet(&packet).await;
                    }
                    return Ok(());
                }

                delivery = outbound.recv() => {
                    if let Some(packet) = delivery {
                        self.write_packet(&packet).await?;
                    }
                }

                read = self.stream.read_buf(&mut self.read_buf) => {
                    match read {
                        Ok(0) => {
                            return Err(ConnectionError::Io(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "connection closed by peer",
                            )));
                        }
                        Ok(n) => {
                            Info::add(&self.broker.info.bytes_received, n as i64);
                            while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                                self.read_buf.advance(consumed);
                                deadline = Instant::now() + keepalive;
                                Info::add(&self.broker.info.packets_received, 1);
                                if packet.packet_type() == PacketType::Publish {
                                    Info::add(&self.broker.info.messages_received, 1);
                                }
                                if let Err(e) = self.process_packet(&client, packet).await {
                                    self.report_dispatch_error(&client, e).await?;
                                }
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                _ = sleep_until(deadline) => {
                    debug!(client = %client.id, "keepalive deadline exceeded");
                    if client.properties.read().protocol_version == ProtocolVersion::V5 {
                        let mut disconnect = Disconnect {
                            reason_code: ReasonCode::KeepAliveTimeout,
                            ..Default::default()
                        };
                        disconnect.properties.reason_string =
                            Some(ReasonCode::KeepAliveTimeout.reason().to_string());
                        let _ = self.write_packet(&Packet::Disconnect(disconnect)).await;
                    }
                    return Err(ConnectionError::KeepAlive);
                }
            }
        }
    }

    /// Disconnect-class errors (reason >= 0x80) close the connection, with a
    /// DISCONNECT first on v5 [MQTT-4.13.1-1]; everything else closes as-is.
    async fn report_dispatch_error(
        &mut self,
        client: &Arc<Client>,
        error: ConnectionError,
    ) -> Result<(), ConnectionError> {
        if let ConnectionError::Reason(code) = &error {
            if code.is_error()
                && client.properties.read().protocol_version == ProtocolVersion::V5
            {
                let mut disconnect = Disconnect {
                    reason_code: *code,
                    ..Default::default()
                };
                disconnect.properties.reason_string = Some(code.reason().to_string());
                let _ = self.write_packet(&Packet::Disconnect(disconnect)).await;
            }
        }
        warn!(client = %client.id, listener = %client.listener, error = %error, "error processing packet");
        Err(error)
    }

    /// Dispatch one packet, then release the next parked inflight entry if
    /// the send quota allows.
    async fn process_packet(
        &mut self,
        client: &Arc<Client>,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        match packet {
            Packet::Connect(_) => {
                // a second CONNECT is a protocol violation [MQTT-3.1.0-2]
                self.broker.send_lwt(client).await;
                return Err(ConnectionError::Reason(ReasonCode::ProtocolError));
            }
            Packet::PingReq => {
                self.write_packet(&Packet::PingResp).await?; // [MQTT-3.12.4-1]
            }
            Packet::Publish(publish) => {
                let code = publish.validate(self.broker.options.capabilities.topic_alias_maximum);
                if code.is_error() {
                    return Err(ConnectionError::Reason(code));
                }
                self.process_publish(client, publish).await?;
            }
            Packet::PubAck(ack) => self.process_puback(client, ack).await?,
            Packet::PubRec(ack) => self.process_pubrec(client, ack).await?,
            Packet::PubRel(ack) => self.process_pubrel(client, ack).await?,
            Packet::PubComp(ack) => self.process_pubcomp(client, ack).await?,
            Packet::Subscribe(subscribe) => {
                let code = subscribe.validate();
                if code.is_error() {
                    return Err(ConnectionError::Reason(code));
                }
                self.process_subscribe(client, subscribe).await?;
            }
            Packet::Unsubscribe(unsubscribe) => {
                let code = unsubscribe.validate();
                if code.is_error() {
                    return Err(ConnectionError::Reason(code));
                }
                self.process_unsubscribe(client, unsubscribe).await?;
            }
            Packet::Auth(auth) => {
                let code = auth.validate();
                if code.is_error() {
                    return Err(ConnectionError::Reason(code));
                }
                if self.broker.hooks.on_auth_packet(client, &auth).await.is_err() {
                    return Err(ConnectionError::Reason(ReasonCode::NotAuthorized));
                }
            }
            Packet::Disconnect(disconnect) => {
                self.process_disconnect(client, disconnect)?;
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                return Err(ConnectionError::Reason(ReasonCode::ProtocolError));
            }
        }

        // opportunistic send: a freed quota slot releases the parked head
        if !client.inflight.is_empty() && client.inflight.send_quota() > 0 {
            if let Some(next) = client.inflight.next_immediate() {
                self.write_packet(&next.to_packet()).await?;
                if client.inflight.delete(next.packet_id) {
                    Info::add(&self.broker.info.inflight, -1);
                }
                client.inflight.decrease_send_quota();
            }
        }

        Ok(())
    }

    /// Encode and write a packet, enforcing the client's maximum packet size
    /// for publishes [MQTT-3.1.2-24] and keeping the wire counters.
    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)?;

        if self.client_max_packet_size > 0
            && self.write_buf.len() > self.client_max_packet_size as usize
            && packet.packet_type() == PacketType::Publish
        {
            debug!(
                size = self.write_buf.len(),
                limit = self.client_max_packet_size,
                "dropping publish exceeding client maximum packet size"
            );
            return Ok(());
        }

        let written = self.write_buf.len();
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        Info::add(&self.broker.info.bytes_sent, written as i64);
        Info::add(&self.broker.info.packets_sent, 1);
        if packet.packet_type() == PacketType::Publish {
            Info::add(&self.broker.info.messages_sent, 1);
        }
        Ok(())
    }

    /// Release the session according to how the connection ended.
    async fn teardown(self, result: Result<(), ConnectionError>) -> Result<(), ConnectionError> {
        let Some(client) = self.client.clone() else {
            return result;
        };

        if result.is_err() {
            // ungraceful close publishes the will [MQTT-3.1.2-8]
            self.broker.send_lwt(&client).await;
        } else {
            client.properties.write().will = None; // [MQTT-3.14.4-3]
        }

        client.stop(None);
        client.mark_disconnected(unix_now());
        Info::add(&self.broker.info.clients_connected, -1);

        let expire = client.expires_immediately();
        let reason = result.as_ref().err().and_then(ConnectionError::reason);
        self.broker.hooks.on_disconnect(&client, reason, expire).await;

        if expire && !client.is_taken_over() {
            let cleared = client.inflight.clear_expired(i64::MAX, 0);
            if !cleared.is_empty() {
                Info::add(&self.broker.info.inflight, -(cleared.len() as i64));
            }
            self.broker.unsubscribe_client(&client).await;
            self.broker.clients.delete_if_same(&client); // [MQTT-4.1.0-2]
        }

        debug!(
            client = %client.id,
            remote = %self.addr,
            listener = %self.listener,
            error = ?result.as_ref().err(),
            "client disconnected"
        );
        result
    }
}
