//! Device events hook
//!
//! Publishes client connect/disconnect events as JSON under
//! `$SYS/brokers/<node>/clients/<client-id>/{connected,disconnected}` so
//! fleet tooling can watch device presence without polling.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error};

use super::{Hook, HookEvent};
use crate::broker::Broker;
use crate::protocol::{Connect, Message, ReasonCode};
use crate::session::Client;
use crate::system::unix_now;

/// Payload shape of a device presence event.
#[derive(Debug, Serialize)]
pub struct DeviceEvent {
    pub client_id: String,
    pub remote_addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub timestamp: i64,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clean_session: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive: Option<u16>,
}

/// Hook publishing device presence events.
pub struct DeviceEventsHook {
    node_name: String,
    broker: RwLock<Option<Weak<Broker>>>,
}

impl DeviceEventsHook {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            broker: RwLock::new(None),
        }
    }

    /// Install the broker handle; events published before this are dropped.
    pub fn attach(&self, broker: &Arc<Broker>) {
        *self.broker.write() = Some(Arc::downgrade(broker));
    }

    async fn publish_event(&self, event: DeviceEvent) {
        let Some(broker) = self.broker.read().clone().and_then(|w| w.upgrade()) else {
            error!(client = %event.client_id, "device events hook not attached to a broker");
            return;
        };

        let topic = format!(
            "$SYS/brokers/{}/clients/{}/{}",
            self.node_name, event.client_id, event.event
        );
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(client = %event.client_id, error = %e, "failed to serialise device event");
                return;
            }
        };

        let msg = Message {
            topic: Arc::from(topic.as_str()),
            payload: Bytes::from(payload),
            created: unix_now(),
            ..Default::default()
        };
        broker.fan_out(msg).await;
        debug!(topic = %topic, client = %event.client_id, "published device event");
    }
}

#[async_trait]
impl Hook for DeviceEventsHook {
    fn id(&self) -> &'static str {
        "device-events"
    }

    fn provides(&self, event: HookEvent) -> bool {
        matches!(
            event,
            HookEvent::OnSessionEstablished | HookEvent::OnDisconnect
        )
    }

    async fn on_session_established(&self, client: &Arc<Client>, connect: &Connect) {
        let props = client.properties.read().clone();
        self.publish_event(DeviceEvent {
            client_id: client.id.to_string(),
            remote_addr: client
                .remote_addr
                .map(|a| a.to_string())
                .unwrap_or_default(),
            username: props.username,
            timestamp: unix_now(),
            event: "connected",
            protocol_version: Some(props.protocol_version as u8),
            clean_session: Some(connect.clean_start),
            keepalive: Some(connect.keep_alive),
        })
        .await;
    }

    async fn on_disconnect(&self, client: &Arc<Client>, _reason: Option<ReasonCode>, _expire: bool) {
        let username = client.properties.read().username.clone();
        self.publish_event(DeviceEvent {
            client_id: client.id.to_string(),
            remote_addr: client
                .remote_addr
                .map(|a| a.to_string())
                .unwrap_or_default(),
            username,
            timestamp: unix_now(),
            event: "disconnected",
            protocol_version: None,
            clean_session: None,
            keepalive: None,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_payload_shape() {
        let event = DeviceEvent {
            client_id: "dev-1".into(),
            remote_addr: "10.0.0.9:52100".into(),
            username: None,
            timestamp: 1700000000,
            event: "connected",
            protocol_version: Some(5),
            clean_session: Some(true),
            keepalive: Some(30),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["client_id"], "dev-1");
        assert_eq!(json["event"], "connected");
        assert!(json.get("username").is_none());
        assert_eq!(json["keepalive"], 30);
    }
}
