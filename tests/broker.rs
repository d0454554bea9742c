//! End-to-end broker behaviour over real TCP connections.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::sleep;

use emberlink::broker::Options;
use emberlink::hooks::{Hook, HookEvent};
use emberlink::protocol::{
    Packet, Properties, ProtocolVersion, Publish, QoS, ReasonCode, Subscription, Will,
};
use support::{start_broker, TestClient};

fn quiet_options() -> Options {
    let mut options = Options::default();
    // keep the background chatter out of protocol-level assertions
    options.sys_topic_interval = Duration::from_secs(3600);
    options
}

#[tokio::test]
async fn qos0_fanout_round_trip() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut subscriber = TestClient::dial(addr, ProtocolVersion::V311).await;
    subscriber
        .connect(ProtocolVersion::V311, "sub-a", true, |_| {})
        .await;
    let suback = subscriber
        .subscribe(1, Subscription::new("a/b", QoS::AtMostOnce))
        .await;
    assert_eq!(suback.reason_codes, vec![0x00]);

    let mut publisher = TestClient::dial(addr, ProtocolVersion::V311).await;
    publisher
        .connect(ProtocolVersion::V311, "pub-b", true, |_| {})
        .await;
    publisher.publish_qos0("a/b", b"hello", false).await;

    let publish = subscriber.expect_publish().await;
    assert_eq!(&*publish.topic, "a/b");
    assert_eq!(&publish.payload[..], b"hello");
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert!(!publish.retain);
}

#[tokio::test]
async fn qos2_round_trip_both_directions() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut subscriber = TestClient::dial(addr, ProtocolVersion::V5).await;
    subscriber
        .connect(ProtocolVersion::V5, "qos2-sub", true, |_| {})
        .await;
    subscriber
        .subscribe(1, Subscription::new("x", QoS::ExactlyOnce))
        .await;

    let mut publisher = TestClient::dial(addr, ProtocolVersion::V5).await;
    publisher
        .connect(ProtocolVersion::V5, "qos2-pub", true, |_| {})
        .await;

    publisher
        .send(Packet::Publish(Publish {
            qos: QoS::ExactlyOnce,
            topic: Arc::from("x"),
            packet_id: Some(10),
            payload: Bytes::from_static(b"p"),
            ..Default::default()
        }))
        .await;

    // publisher side: PUBREC -> PUBREL -> PUBCOMP
    match publisher.recv().await {
        Some(Packet::PubRec(ack)) => {
            assert_eq!(ack.packet_id, 10);
            assert!(ack.reason_code.is_success());
        }
        other => panic!("expected PUBREC, got {:?}", other),
    }
    publisher.send(Packet::PubRel(TestClient::ack(10))).await;
    match publisher.recv().await {
        Some(Packet::PubComp(ack)) => assert_eq!(ack.packet_id, 10),
        other => panic!("expected PUBCOMP, got {:?}", other),
    }

    // subscriber side: broker-assigned id, full exchange
    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.qos, QoS::ExactlyOnce);
    let packet_id = publish.packet_id.expect("qos 2 publish carries an id");
    assert_eq!(packet_id, 1);

    subscriber
        .send(Packet::PubRec(TestClient::ack(packet_id)))
        .await;
    match subscriber.recv().await {
        Some(Packet::PubRel(ack)) => assert_eq!(ack.packet_id, packet_id),
        other => panic!("expected PUBREL, got {:?}", other),
    }
    subscriber
        .send(Packet::PubComp(TestClient::ack(packet_id)))
        .await;
}

#[tokio::test]
async fn qos1_round_trip_with_broker_assigned_id() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut subscriber = TestClient::dial(addr, ProtocolVersion::V311).await;
    subscriber
        .connect(ProtocolVersion::V311, "q1-sub", true, |_| {})
        .await;
    subscriber
        .subscribe(1, Subscription::new("bulk", QoS::AtLeastOnce))
        .await;

    let payload: Vec<u8> = (0..2048).map(|_| rand::random::<u8>()).collect();

    let mut publisher = TestClient::dial(addr, ProtocolVersion::V311).await;
    publisher
        .connect(ProtocolVersion::V311, "q1-pub", true, |_| {})
        .await;
    publisher
        .send(Packet::Publish(Publish {
            qos: QoS::AtLeastOnce,
            topic: Arc::from("bulk"),
            packet_id: Some(7),
            payload: Bytes::from(payload.clone()),
            ..Default::default()
        }))
        .await;

    // publisher's exchange completes with the broker's ack
    match publisher.recv().await {
        Some(Packet::PubAck(ack)) => {
            assert_eq!(ack.packet_id, 7);
            assert!(ack.reason_code.is_success());
        }
        other => panic!("expected PUBACK, got {:?}", other),
    }

    // the delivered copy carries a broker-assigned id and the full payload
    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert_eq!(&publish.payload[..], &payload[..]);
    let packet_id = publish.packet_id.expect("qos 1 delivery carries an id");
    subscriber
        .send(Packet::PubAck(TestClient::ack(packet_id)))
        .await;
}

#[tokio::test]
async fn retained_message_delivered_on_subscribe() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut publisher = TestClient::dial(addr, ProtocolVersion::V311).await;
    publisher
        .connect(ProtocolVersion::V311, "ret-pub", true, |_| {})
        .await;
    publisher.publish_qos0("r", b"v", true).await;
    // ensure the retain is indexed before the subscriber arrives
    sleep(Duration::from_millis(100)).await;

    let mut subscriber = TestClient::dial(addr, ProtocolVersion::V311).await;
    subscriber
        .connect(ProtocolVersion::V311, "ret-sub", true, |_| {})
        .await;
    subscriber
        .subscribe(1, Subscription::new("r", QoS::AtMostOnce))
        .await;

    let publish = subscriber.expect_publish().await;
    assert_eq!(&*publish.topic, "r");
    assert_eq!(&publish.payload[..], b"v");
    assert!(publish.retain);
}

#[tokio::test]
async fn empty_payload_clears_retained() {
    let (broker, addr) = start_broker(quiet_options()).await;

    let mut publisher = TestClient::dial(addr, ProtocolVersion::V311).await;
    publisher
        .connect(ProtocolVersion::V311, "clear-pub", true, |_| {})
        .await;
    publisher.publish_qos0("gone", b"x", true).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.topics.retained_len(), 1);

    publisher.publish_qos0("gone", b"", true).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.topics.retained_len(), 0);
}

#[tokio::test]
async fn session_takeover_preserves_session() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut first = TestClient::dial(addr, ProtocolVersion::V5).await;
    let connack = first
        .connect(ProtocolVersion::V5, "c1", false, |c| {
            c.properties.session_expiry_interval = Some(300);
        })
        .await;
    assert!(!connack.session_present);
    first
        .subscribe(1, Subscription::new("s", QoS::AtLeastOnce))
        .await;

    let mut second = TestClient::dial(addr, ProtocolVersion::V5).await;
    let connack = second
        .connect(ProtocolVersion::V5, "c1", false, |c| {
            c.properties.session_expiry_interval = Some(300);
        })
        .await;
    assert!(connack.session_present);

    // the displaced connection is told why
    match first.recv().await {
        Some(Packet::Disconnect(d)) => {
            assert_eq!(d.reason_code, ReasonCode::SessionTakenOver);
        }
        other => panic!("expected DISCONNECT, got {:?}", other),
    }

    // a publish to the inherited subscription lands on the new connection
    let mut publisher = TestClient::dial(addr, ProtocolVersion::V5).await;
    publisher
        .connect(ProtocolVersion::V5, "tk-pub", true, |_| {})
        .await;
    publisher.publish_qos0("s", b"after", false).await;

    let publish = second.expect_publish().await;
    assert_eq!(&publish.payload[..], b"after");
    assert!(first.recv().await.is_none());
}

#[tokio::test]
async fn receive_maximum_exceeded_disconnects() {
    let mut options = quiet_options();
    options.capabilities.receive_maximum = 2;
    let (_broker, addr) = start_broker(options).await;

    let mut publisher = TestClient::dial(addr, ProtocolVersion::V5).await;
    publisher
        .connect(ProtocolVersion::V5, "greedy", true, |_| {})
        .await;

    // two open QoS 2 exchanges exhaust the quota; the third breaches it
    for packet_id in [1u16, 2, 3] {
        publisher
            .send(Packet::Publish(Publish {
                qos: QoS::ExactlyOnce,
                topic: Arc::from("q"),
                packet_id: Some(packet_id),
                payload: Bytes::from_static(b"x"),
                ..Default::default()
            }))
            .await;
    }

    let mut saw_receive_max = false;
    for _ in 0..4 {
        match publisher.recv().await {
            Some(Packet::Disconnect(d)) => {
                assert_eq!(d.reason_code, ReasonCode::ReceiveMaxExceeded);
                saw_receive_max = true;
                break;
            }
            Some(Packet::PubRec(_)) => continue,
            other => panic!("unexpected packet: {:?}", other),
        }
    }
    assert!(saw_receive_max);
    assert!(publisher.expect_close(Duration::from_secs(2)).await);
}

/// Counts retained-expiry notifications.
struct RetainedExpiryProbe {
    expired: AtomicUsize,
}

#[async_trait]
impl Hook for RetainedExpiryProbe {
    fn id(&self) -> &'static str {
        "retained-expiry-probe"
    }
    fn provides(&self, event: HookEvent) -> bool {
        matches!(event, HookEvent::OnRetainedExpired)
    }
    async fn on_retained_expired(&self, _topic: &str) {
        self.expired.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn retained_message_expires() {
    let mut options = quiet_options();
    options.retained_expiry_interval = Duration::from_millis(200);
    let (broker, addr) = start_broker(options).await;

    let probe = Arc::new(RetainedExpiryProbe {
        expired: AtomicUsize::new(0),
    });
    broker.add_hook(probe.clone());

    let mut publisher = TestClient::dial(addr, ProtocolVersion::V5).await;
    publisher
        .connect(ProtocolVersion::V5, "exp-pub", true, |_| {})
        .await;
    publisher
        .send(Packet::Publish(Publish {
            qos: QoS::AtMostOnce,
            retain: true,
            topic: Arc::from("t"),
            payload: Bytes::from_static(b"p"),
            properties: Properties {
                message_expiry_interval: Some(1),
                ..Default::default()
            },
            ..Default::default()
        }))
        .await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.topics.retained_len(), 1);

    sleep(Duration::from_secs(2)).await;

    let mut subscriber = TestClient::dial(addr, ProtocolVersion::V5).await;
    subscriber
        .connect(ProtocolVersion::V5, "exp-sub", true, |_| {})
        .await;
    subscriber
        .subscribe(1, Subscription::new("t", QoS::AtMostOnce))
        .await;
    assert!(
        subscriber.recv_within(Duration::from_millis(500)).await.is_none(),
        "expired retained message must not be delivered"
    );
    assert_eq!(probe.expired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shared_subscription_round_robin_is_fair() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut members = Vec::new();
    for name in ["m1", "m2", "m3"] {
        let mut member = TestClient::dial(addr, ProtocolVersion::V5).await;
        member.connect(ProtocolVersion::V5, name, true, |_| {}).await;
        member
            .subscribe(1, Subscription::new("$share/g/t", QoS::AtMostOnce))
            .await;
        members.push(member);
    }

    let mut publisher = TestClient::dial(addr, ProtocolVersion::V5).await;
    publisher
        .connect(ProtocolVersion::V5, "share-pub", true, |_| {})
        .await;
    for i in 0..6u8 {
        publisher.publish_qos0("t", &[i], false).await;
    }

    let mut counts = [0usize; 3];
    for (i, member) in members.iter_mut().enumerate() {
        while member.recv_within(Duration::from_millis(700)).await.is_some() {
            counts[i] += 1;
        }
    }
    assert_eq!(counts.iter().sum::<usize>(), 6);
    assert_eq!(counts, [2, 2, 2], "round robin must distribute evenly");
}

#[tokio::test]
async fn no_local_suppresses_echo() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut client = TestClient::dial(addr, ProtocolVersion::V5).await;
    client
        .connect(ProtocolVersion::V5, "echoless", true, |_| {})
        .await;
    let mut sub = Subscription::new("loop", QoS::AtMostOnce);
    sub.no_local = true;
    client.subscribe(1, sub).await;

    client.publish_qos0("loop", b"me", false).await;
    assert!(
        client.recv_within(Duration::from_millis(500)).await.is_none(),
        "no-local subscription must not receive its own publish"
    );
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut subscriber = TestClient::dial(addr, ProtocolVersion::V5).await;
    subscriber
        .connect(ProtocolVersion::V5, "fickle", true, |_| {})
        .await;
    subscriber
        .subscribe(1, Subscription::new("u", QoS::AtMostOnce))
        .await;

    subscriber
        .send(Packet::Unsubscribe(emberlink::protocol::Unsubscribe {
            packet_id: 2,
            filters: vec!["u".to_string()],
            properties: Properties::default(),
        }))
        .await;
    match subscriber.recv().await {
        Some(Packet::UnsubAck(ack)) => {
            assert_eq!(ack.packet_id, 2);
            assert_eq!(ack.reason_codes, vec![ReasonCode::Success as u8]);
        }
        other => panic!("expected UNSUBACK, got {:?}", other),
    }

    let mut publisher = TestClient::dial(addr, ProtocolVersion::V5).await;
    publisher
        .connect(ProtocolVersion::V5, "u-pub", true, |_| {})
        .await;
    publisher.publish_qos0("u", b"late", false).await;
    assert!(subscriber.recv_within(Duration::from_millis(500)).await.is_none());
}

#[tokio::test]
async fn unsubscribe_unknown_filter_reports_no_subscription() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut client = TestClient::dial(addr, ProtocolVersion::V5).await;
    client
        .connect(ProtocolVersion::V5, "nothing", true, |_| {})
        .await;
    client
        .send(Packet::Unsubscribe(emberlink::protocol::Unsubscribe {
            packet_id: 9,
            filters: vec!["never/subscribed".to_string()],
            properties: Properties::default(),
        }))
        .await;
    match client.recv().await {
        Some(Packet::UnsubAck(ack)) => {
            assert_eq!(ack.reason_codes, vec![ReasonCode::NoSubscriptionExisted as u8]);
        }
        other => panic!("expected UNSUBACK, got {:?}", other),
    }
}

#[tokio::test]
async fn will_published_on_ungraceful_close() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut watcher = TestClient::dial(addr, ProtocolVersion::V311).await;
    watcher
        .connect(ProtocolVersion::V311, "watcher", true, |_| {})
        .await;
    watcher
        .subscribe(1, Subscription::new("dead/+", QoS::AtMostOnce))
        .await;

    let mortal = TestClient::dial(addr, ProtocolVersion::V311).await;
    let mut mortal = mortal;
    mortal
        .connect(ProtocolVersion::V311, "mortal", true, |c| {
            c.will = Some(Will {
                topic: "dead/mortal".into(),
                payload: Bytes::from_static(b"gone"),
                qos: QoS::AtMostOnce,
                retain: false,
                properties: Properties::default(),
            });
        })
        .await;
    drop(mortal); // ungraceful: no DISCONNECT

    let publish = watcher.expect_publish().await;
    assert_eq!(&*publish.topic, "dead/mortal");
    assert_eq!(&publish.payload[..], b"gone");
}

#[tokio::test]
async fn graceful_disconnect_suppresses_will() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut watcher = TestClient::dial(addr, ProtocolVersion::V311).await;
    watcher
        .connect(ProtocolVersion::V311, "watcher2", true, |_| {})
        .await;
    watcher
        .subscribe(1, Subscription::new("dead/#", QoS::AtMostOnce))
        .await;

    let mut polite = TestClient::dial(addr, ProtocolVersion::V311).await;
    polite
        .connect(ProtocolVersion::V311, "polite", true, |c| {
            c.will = Some(Will {
                topic: "dead/polite".into(),
                payload: Bytes::from_static(b"oops"),
                qos: QoS::AtMostOnce,
                retain: false,
                properties: Properties::default(),
            });
        })
        .await;
    polite
        .send(Packet::Disconnect(Default::default()))
        .await;
    drop(polite);

    assert!(
        watcher.recv_within(Duration::from_millis(700)).await.is_none(),
        "graceful disconnect must not publish the will"
    );
}

#[tokio::test]
async fn keepalive_timeout_closes_connection() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut client = TestClient::dial(addr, ProtocolVersion::V5).await;
    client
        .connect(ProtocolVersion::V5, "sleepy", true, |c| {
            c.keep_alive = 1;
        })
        .await;

    // 1.5x keepalive is 1.5s; the broker closes with a reason on v5
    match client.recv_within(Duration::from_secs(3)).await {
        Some(Packet::Disconnect(d)) => {
            assert_eq!(d.reason_code, ReasonCode::KeepAliveTimeout);
        }
        None => {} // close without DISCONNECT also acceptable for the socket race
        other => panic!("unexpected packet: {:?}", other),
    }
    assert!(client.expect_close(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn pingreq_refreshes_keepalive() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut client = TestClient::dial(addr, ProtocolVersion::V311).await;
    client
        .connect(ProtocolVersion::V311, "pinger", true, |c| {
            c.keep_alive = 1;
        })
        .await;

    for _ in 0..3 {
        sleep(Duration::from_millis(800)).await;
        client.send(Packet::PingReq).await;
        match client.recv().await {
            Some(Packet::PingResp) => {}
            other => panic!("expected PINGRESP, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn second_connect_is_a_protocol_violation() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut client = TestClient::dial(addr, ProtocolVersion::V5).await;
    client
        .connect(ProtocolVersion::V5, "twice", true, |_| {})
        .await;
    client
        .send(Packet::Connect(Box::new(emberlink::protocol::Connect {
            protocol_version: ProtocolVersion::V5,
            client_id: "twice".into(),
            ..Default::default()
        })))
        .await;

    match client.recv().await {
        Some(Packet::Disconnect(d)) => assert!(d.reason_code.is_error()),
        None => {} // already closed
        other => panic!("unexpected packet: {:?}", other),
    }
    assert!(client.expect_close(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn first_packet_must_be_connect() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut client = TestClient::dial(addr, ProtocolVersion::V311).await;
    client.send(Packet::PingReq).await;
    assert!(client.expect_close(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn inline_client_publish_and_subscribe() {
    let (broker, addr) = start_broker(quiet_options()).await;

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in_handler = seen.clone();
    broker
        .subscribe(
            "inline/#",
            1,
            Arc::new(move |_client, _sub, msg| {
                assert_eq!(&*msg.topic, "inline/x");
                seen_in_handler.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

    // a wire client's publish reaches the in-process handler
    let mut publisher = TestClient::dial(addr, ProtocolVersion::V311).await;
    publisher
        .connect(ProtocolVersion::V311, "to-inline", true, |_| {})
        .await;
    publisher.publish_qos0("inline/x", b"ping", false).await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    // and an inline publish reaches wire subscribers
    let mut subscriber = TestClient::dial(addr, ProtocolVersion::V311).await;
    subscriber
        .connect(ProtocolVersion::V311, "from-inline", true, |_| {})
        .await;
    subscriber
        .subscribe(1, Subscription::new("announce", QoS::AtMostOnce))
        .await;
    broker
        .publish("announce", Bytes::from_static(b"hi"), false, QoS::AtMostOnce)
        .await
        .unwrap();
    let publish = subscriber.expect_publish().await;
    assert_eq!(&publish.payload[..], b"hi");
}

#[tokio::test]
async fn blacklisted_client_is_refused() {
    let mut options = quiet_options();
    options.blacklist = vec!["banned".to_string()];
    let (_broker, addr) = start_broker(options).await;

    let mut client = TestClient::dial(addr, ProtocolVersion::V311).await;
    client
        .send(Packet::Connect(Box::new(emberlink::protocol::Connect {
            protocol_version: ProtocolVersion::V311,
            client_id: "banned".into(),
            ..Default::default()
        })))
        .await;
    assert!(client.expect_close(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn subscription_identifier_attached_to_deliveries() {
    let (_broker, addr) = start_broker(quiet_options()).await;

    let mut subscriber = TestClient::dial(addr, ProtocolVersion::V5).await;
    subscriber
        .connect(ProtocolVersion::V5, "with-id", true, |_| {})
        .await;
    subscriber
        .send(Packet::Subscribe(emberlink::protocol::Subscribe {
            packet_id: 3,
            filters: vec![Subscription::new("ids/+", QoS::AtMostOnce)],
            properties: Properties {
                subscription_identifiers: vec![42],
                ..Default::default()
            },
        }))
        .await;
    match subscriber.recv().await {
        Some(Packet::SubAck(_)) => {}
        other => panic!("expected SUBACK, got {:?}", other),
    }

    let mut publisher = TestClient::dial(addr, ProtocolVersion::V5).await;
    publisher
        .connect(ProtocolVersion::V5, "id-pub", true, |_| {})
        .await;
    publisher.publish_qos0("ids/a", b"x", false).await;

    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.properties.subscription_identifiers, vec![42]);
}
