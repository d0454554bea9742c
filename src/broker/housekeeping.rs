//! Periodic housekeeping
//!
//! One task drives five independent intervals: $SYS telemetry, expired
//! client/inflight/retained sweeps, and delayed will delivery. Each sweep
//! uses the same locking discipline as the connection handlers and may run
//! concurrently with them.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::Broker;
use crate::protocol::{Message, PacketType, ProtocolVersion};
use crate::system::{process_memory_bytes, process_threads, unix_now, Info};

pub(crate) fn spawn(broker: Arc<Broker>) {
    let mut shutdown = broker.subscribe_shutdown();
    tokio::spawn(async move {
        debug!("housekeeping loop started");

        // first tick after one full period, not immediately
        let after = |period: std::time::Duration| {
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        };
        let mut sys_topics = after(broker.options.sys_topic_interval);
        let mut client_expiry = after(broker.options.client_expiry_interval);
        let mut inflight_expiry = after(broker.options.inflight_expiry_interval);
        let mut retained_expiry = after(broker.options.retained_expiry_interval);
        let mut delayed_wills = after(broker.options.delayed_will_interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = sys_topics.tick() => publish_sys_topics(&broker).await,
                _ = client_expiry.tick() => clear_expired_clients(&broker, unix_now()).await,
                _ = inflight_expiry.tick() => clear_expired_inflights(&broker, unix_now()).await,
                _ = retained_expiry.tick() => clear_expired_retained(&broker, unix_now()).await,
                _ = delayed_wills.tick() => send_delayed_wills(&broker, unix_now()).await,
            }
        }

        debug!("housekeeping loop halted");
    });
}

/// Snapshot the counters and republish the `$SYS/broker/#` topic set as
/// retained messages through the ordinary fan-out path.
pub(crate) async fn publish_sys_topics(broker: &Arc<Broker>) {
    let info = &broker.info;
    let now = unix_now();
    Info::set(&info.time, now);
    Info::set(&info.uptime, now - Info::get(&info.started));
    Info::set(&info.memory_alloc, process_memory_bytes());
    Info::set(&info.threads, process_threads());
    // registry includes the inline pseudo-client; it is not a device
    let total = broker.clients.len().saturating_sub(1) as i64;
    Info::set(&info.clients_total, total);
    Info::set(
        &info.clients_disconnected,
        total - Info::get(&info.clients_connected),
    );

    let snapshot = info.snapshot();
    let topics: [(&str, String); 20] = [
        ("$SYS/broker/version", super::VERSION.to_string()),
        ("$SYS/broker/time", snapshot.time.to_string()),
        ("$SYS/broker/uptime", snapshot.uptime.to_string()),
        ("$SYS/broker/started", snapshot.started.to_string()),
        (
            "$SYS/broker/load/bytes/received",
            snapshot.bytes_received.to_string(),
        ),
        ("$SYS/broker/load/bytes/sent", snapshot.bytes_sent.to_string()),
        (
            "$SYS/broker/clients/connected",
            snapshot.clients_connected.to_string(),
        ),
        (
            "$SYS/broker/clients/disconnected",
            snapshot.clients_disconnected.to_string(),
        ),
        (
            "$SYS/broker/clients/maximum",
            snapshot.clients_maximum.to_string(),
        ),
        ("$SYS/broker/clients/total", snapshot.clients_total.to_string()),
        (
            "$SYS/broker/packets/received",
            snapshot.packets_received.to_string(),
        ),
        ("$SYS/broker/packets/sent", snapshot.packets_sent.to_string()),
        (
            "$SYS/broker/messages/received",
            snapshot.messages_received.to_string(),
        ),
        ("$SYS/broker/messages/sent", snapshot.messages_sent.to_string()),
        (
            "$SYS/broker/messages/dropped",
            snapshot.messages_dropped.to_string(),
        ),
        ("$SYS/broker/messages/inflight", snapshot.inflight.to_string()),
        ("$SYS/broker/retained", snapshot.retained.to_string()),
        ("$SYS/broker/subscriptions", snapshot.subscriptions.to_string()),
        ("$SYS/broker/system/memory", snapshot.memory_alloc.to_string()),
        ("$SYS/broker/system/threads", snapshot.threads.to_string()),
    ];

    for (topic, payload) in topics {
        let msg = Message {
            packet_type: PacketType::Publish,
            retain: true,
            topic: Arc::from(topic),
            payload: Bytes::from(payload),
            created: now,
            ..Default::default()
        };
        broker.topics.retain_message(msg.clone());
        broker.fan_out(msg).await;
    }
    Info::set(&info.retained, broker.topics.retained_len() as i64);

    broker.hooks.on_sys_info_tick(&snapshot).await;
}

/// Remove clients whose session expiry elapsed since disconnect.
pub(crate) async fn clear_expired_clients(broker: &Arc<Broker>, now: i64) {
    for client in broker.clients.all() {
        let disconnected = client.disconnected_at();
        if disconnected == 0 {
            continue;
        }

        let expiry = {
            let props = client.properties.read();
            if props.protocol_version == ProtocolVersion::V5 && props.session_expiry_set {
                props.session_expiry_interval
            } else {
                broker.options.capabilities.maximum_session_expiry_interval
            }
        };

        if disconnected + i64::from(expiry) < now {
            broker.hooks.on_client_expired(&client).await;
            broker.clients.delete_if_same(&client); // [MQTT-4.1.0-2]
        }
    }
}

/// Drop inflight entries past their expiry, per client.
pub(crate) async fn clear_expired_inflights(broker: &Arc<Broker>, now: i64) {
    let max_expiry = broker.options.capabilities.maximum_message_expiry_interval;
    for client in broker.clients.all() {
        let deleted = client.inflight.clear_expired(now, max_expiry);
        if deleted.is_empty() {
            continue;
        }
        Info::add(&broker.info.inflight, -(deleted.len() as i64));
        Info::add(&broker.info.inflight_dropped, deleted.len() as i64);
        for packet_id in deleted {
            let msg = Message {
                packet_id,
                ..Default::default()
            };
            broker.hooks.on_qos_dropped(&client, &msg).await;
        }
    }
}

/// Drop retained messages past their expiry.
pub(crate) async fn clear_expired_retained(broker: &Arc<Broker>, now: i64) {
    let max_expiry = broker.options.capabilities.maximum_message_expiry_interval;
    let expired = broker.topics.clear_expired_retained(now, max_expiry);
    if expired.is_empty() {
        return;
    }
    Info::set(&broker.info.retained, broker.topics.retained_len() as i64);
    for topic in expired {
        broker.hooks.on_retained_expired(&topic).await;
    }
}

/// Publish delayed wills whose delay interval has elapsed.
pub(crate) async fn send_delayed_wills(broker: &Arc<Broker>, now: i64) {
    let due: Vec<(Arc<str>, Message)> = broker
        .delayed_wills()
        .iter()
        .filter(|entry| now > entry.value().expiry)
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();

    for (client_id, mut msg) in due {
        broker.delayed_wills().remove(&client_id);
        // the stored expiry was the will fire time; recompute on delivery
        msg.created = now;
        msg.expiry = 0;
        broker.fan_out(msg.clone()).await;
        if let Some(client) = broker.clients.get(&client_id) {
            if msg.retain {
                broker.retain_message(&client, &msg).await;
            }
            client.properties.write().will = None; // [MQTT-3.1.2-10]
            broker.hooks.on_will_sent(&client, &msg).await;
        }
    }
}
