//! Test harness: a broker on an ephemeral port plus a raw MQTT client
//! speaking through the crate's own codec.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use emberlink::broker::{Broker, Options};
use emberlink::codec::{Decoder, Encoder};
use emberlink::listener::TcpListener;
use emberlink::protocol::{
    Ack, ConnAck, Connect, Packet, Properties, ProtocolVersion, Publish, QoS, SubAck, Subscribe,
    Subscription,
};

/// Start a broker with the given options on an ephemeral port.
pub async fn start_broker(options: Options) -> (Arc<Broker>, SocketAddr) {
    let broker = Broker::new(options);
    let listener = TcpListener::bind("tcp", "127.0.0.1:0".parse().unwrap())
        .await
        .expect("bind test listener");
    let addr = listener.local_addr();
    broker.add_listener(Arc::new(listener));
    broker.serve().await;
    (broker, addr)
}

/// Raw MQTT client for protocol-level testing.
pub struct TestClient {
    stream: TcpStream,
    decoder: Decoder,
    encoder: Encoder,
    buf: BytesMut,
}

impl TestClient {
    pub async fn dial(addr: SocketAddr, version: ProtocolVersion) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to broker");
        let mut decoder = Decoder::new();
        decoder.set_protocol_version(version);
        Self {
            stream,
            decoder,
            encoder: Encoder::new(version),
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        let mut out = BytesMut::new();
        self.encoder.encode(&packet, &mut out).expect("encode packet");
        self.stream.write_all(&out).await.expect("write packet");
    }

    /// Next packet, or `None` when the deadline passes or the peer closes.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(Duration::from_secs(2)).await
    }

    pub async fn recv_within(&mut self, deadline: Duration) -> Option<Packet> {
        let result = timeout(deadline, async {
            loop {
                if let Ok(Some((packet, consumed))) = self.decoder.decode(&self.buf) {
                    self.buf.advance(consumed);
                    return Some(packet);
                }
                match self.stream.read_buf(&mut self.buf).await {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        })
        .await;
        result.unwrap_or(None)
    }

    /// True when the peer closes the socket within the deadline. Packets
    /// still arriving (e.g. a final DISCONNECT) are drained.
    pub async fn expect_close(&mut self, deadline: Duration) -> bool {
        timeout(deadline, async {
            loop {
                match self.stream.read_buf(&mut self.buf).await {
                    Ok(0) | Err(_) => return true,
                    Ok(_) => self.buf.clear(),
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    /// Send CONNECT and return the CONNACK.
    pub async fn connect(
        &mut self,
        version: ProtocolVersion,
        client_id: &str,
        clean_start: bool,
        mutate: impl FnOnce(&mut Connect),
    ) -> ConnAck {
        let mut connect = Connect {
            protocol_version: version,
            client_id: client_id.to_string(),
            clean_start,
            keep_alive: 60,
            ..Default::default()
        };
        mutate(&mut connect);
        self.send(Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    /// Subscribe to one filter and return the SUBACK.
    pub async fn subscribe(&mut self, packet_id: u16, sub: Subscription) -> SubAck {
        self.send(Packet::Subscribe(Subscribe {
            packet_id,
            filters: vec![sub],
            properties: Properties::default(),
        }))
        .await;
        match self.recv().await {
            Some(Packet::SubAck(ack)) => ack,
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    pub async fn publish_qos0(&mut self, topic: &str, payload: &[u8], retain: bool) {
        self.send(Packet::Publish(Publish {
            qos: QoS::AtMostOnce,
            retain,
            topic: Arc::from(topic),
            payload: Bytes::copy_from_slice(payload),
            ..Default::default()
        }))
        .await;
    }

    /// Wait for a PUBLISH, skipping unrelated packets.
    pub async fn expect_publish(&mut self) -> Publish {
        loop {
            match self.recv().await {
                Some(Packet::Publish(publish)) => return publish,
                Some(_) => continue,
                None => panic!("expected PUBLISH, connection idle or closed"),
            }
        }
    }

    pub fn ack(packet_id: u16) -> Ack {
        Ack::new(packet_id)
    }
}
