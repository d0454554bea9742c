//! Publish fan-out
//!
//! Resolves the subscriber set for a topic, applies per-subscription
//! overrides (qos caps, no-local, retain-as-published, identifiers, topic
//! aliases), walks each recipient through its inflight store and enqueues
//! outbound copies. Errors against one recipient never abort the fan-out.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use super::Broker;
use crate::hooks::SharedFilterResults;
use crate::protocol::{
    Message, PacketType, Properties, ProtocolVersion, ReasonCode, Subscription, EXPIRY_PARKED,
};
use crate::session::{Client, EnqueueError};
use crate::system::{unix_now, Info};
use crate::topic::is_shared_filter;

/// Why a single recipient did not receive its copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryError {
    NotAuthorized,
    /// Packet id space exhausted
    QuotaExceeded,
    /// Recipient has no live connection; QoS copies stay inflight
    Gone,
    /// Outbound channel full; the copy was dropped and rolled back
    WritesExceeded,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::NotAuthorized => write!(f, "not authorized"),
            DeliveryError::QuotaExceeded => write!(f, "packet ids exhausted"),
            DeliveryError::Gone => write!(f, "connection not open"),
            DeliveryError::WritesExceeded => write!(f, "pending client writes exceeded"),
        }
    }
}

impl Broker {
    /// Publish a message to every matching subscriber.
    pub async fn fan_out(&self, msg: Message) {
        self.fan_out_scoped(msg, true).await;
    }

    /// `local` is false for copies arriving from an external forwarder, which
    /// must not re-report shared-filter results.
    pub async fn fan_out_scoped(&self, mut msg: Message, local: bool) {
        if msg.ignore {
            return;
        }

        if msg.created == 0 {
            msg.created = unix_now();
        }
        msg.expiry = self.message_expiry(msg.created, msg.properties.message_expiry_interval);

        let mut shared_results = SharedFilterResults::default();
        let mut subscribers = self.topics.subscribers(&msg.topic);

        if !subscribers.shared.is_empty() {
            subscribers = self.hooks.on_select_subscribers(subscribers, &msg).await;
            if subscribers.shared_selected.is_empty() {
                self.topics.select_shared(&mut subscribers);
            }
            for sub in subscribers.shared_selected.values() {
                shared_results.insert(sub.filter.clone(), false);
            }
            subscribers.merge_shared_selected();
        } else if local && !msg.topic.starts_with("$SYS") {
            self.hooks
                .on_published_with_shared_filters(&msg, &shared_results)
                .await;
        }

        for inline_sub in &subscribers.inline {
            let mut sub = Subscription::new(inline_sub.filter.clone(), msg.qos);
            sub.identifier = (inline_sub.identifier > 0).then_some(inline_sub.identifier);
            (inline_sub.handler)(&self.inline_client, &sub, &msg);
        }

        for (client_id, sub) in subscribers.ordinary {
            let Some(client) = self.clients.get(&client_id) else {
                continue;
            };
            match self.publish_to_client(&client, &sub, &msg).await {
                Ok(()) => {
                    if is_shared_filter(&sub.filter) {
                        shared_results.insert(sub.filter.clone(), true);
                    }
                }
                Err(e) => {
                    if is_shared_filter(&sub.filter) {
                        shared_results.insert(sub.filter.clone(), false);
                    }
                    debug!(client = %client.id, topic = %msg.topic, error = %e, "failed publishing to subscriber");
                }
            }
        }

        if !shared_results.is_empty() && local {
            self.hooks
                .on_published_with_shared_filters(&msg, &shared_results)
                .await;
        }
    }

    /// Deliver one copy to one recipient, applying its merged subscription.
    pub(crate) async fn publish_to_client(
        &self,
        client: &Arc<Client>,
        sub: &Subscription,
        msg: &Message,
    ) -> Result<(), DeliveryError> {
        if sub.no_local && msg.origin == client.id {
            return Ok(()); // [MQTT-3.8.3-3]
        }

        let protocol_version = client.properties.read().protocol_version;

        if !self.hooks.on_acl_check(client, &msg.topic, false).await {
            return Err(DeliveryError::NotAuthorized);
        }

        let mut out = msg.clone();
        out.dup = false;
        out.packet_id = 0;

        // retained deliveries keep the retain bit; live copies keep it only
        // for v5 retain-as-published subscriptions [MQTT-3.3.1-12]
        if !sub.fwd_retained
            && (protocol_version.is_v3()
                || (protocol_version == ProtocolVersion::V5 && !sub.retain_as_published))
        {
            out.retain = false;
        }

        if !sub.identifiers.is_empty() {
            let mut ids = sub.identifiers.clone();
            ids.sort_unstable();
            ids.dedup();
            out.properties.subscription_identifiers = ids; // [MQTT-3.3.4-4]
        }

        out.qos = self.options.capabilities.cap_qos(out.qos.min(sub.qos));

        let alias_maximum = client.properties.read().topic_alias_maximum;
        if alias_maximum > 0 {
            let (alias, existed) = client.aliases.obtain_outbound(&msg.topic);
            if alias > 0 {
                out.properties.topic_alias = Some(alias);
                if existed {
                    out.topic = Arc::from("");
                }
            }
        }

        if out.qos as u8 > 0 {
            let packet_id = match client.next_packet_id() {
                Ok(id) => id, // [MQTT-2.2.1-4]
                Err(_) => {
                    self.hooks.on_packet_id_exhausted(client, msg).await;
                    warn!(client = %client.id, listener = %client.listener, "packet ids exhausted");
                    return Err(DeliveryError::QuotaExceeded);
                }
            };
            out.packet_id = packet_id;

            let send_quota = client.inflight.send_quota();
            if client.inflight.set(out.clone()) {
                Info::add(&self.info.inflight, 1);
                self.hooks.on_qos_publish(client, &out).await;
                client.inflight.decrease_send_quota();
            }

            if send_quota == 0 && client.inflight.max_send_quota() > 0 {
                // park until an ack frees a slot; the dispatch tail releases it
                out.expiry = EXPIRY_PARKED;
                client.inflight.set(out);
                return Ok(());
            }
        }

        if client.is_closed() {
            // QoS copies stay inflight for resend on session inheritance
            return Err(DeliveryError::Gone);
        }

        match client.enqueue(out.to_packet()) {
            Ok(()) => Ok(()),
            Err(EnqueueError::WritesExceeded) => {
                Info::add(&self.info.messages_dropped, 1);
                self.hooks.on_publish_dropped(client, msg).await;
                if out.packet_id > 0 && client.inflight.delete(out.packet_id) {
                    Info::add(&self.info.inflight, -1);
                }
                client.inflight.increase_send_quota();
                Err(DeliveryError::WritesExceeded)
            }
            Err(EnqueueError::Closed) => Err(DeliveryError::Gone),
        }
    }

    /// Deliver the retained snapshot for a fresh subscription, honouring the
    /// retain-handling option. Shared filters never receive retained
    /// messages.
    pub(crate) async fn publish_retained_to_client(
        &self,
        client: &Arc<Client>,
        sub: &Subscription,
        existed: bool,
    ) {
        if is_shared_filter(&sub.filter) {
            return; // 4.8.2 non-normative: shared subscriptions get no retained messages
        }
        if matches!(sub.retain_handling, crate::protocol::RetainHandling::DoNotSend)
            || (matches!(
                sub.retain_handling,
                crate::protocol::RetainHandling::SendAtSubscribeIfNew
            ) && existed)
        {
            return; // [MQTT-3.3.1-10] [MQTT-3.3.1-11]
        }

        let mut sub = sub.clone();
        sub.fwd_retained = true;
        for msg in self.topics.messages(&sub.filter, unix_now()) {
            if let Err(e) = self.publish_to_client(client, &sub, &msg).await {
                debug!(client = %client.id, topic = %msg.topic, error = %e, "failed to deliver retained message");
            }
        }
    }

    /// Standardised ack for PUBACK/PUBREC/PUBREL/PUBCOMP.
    pub(crate) fn build_ack(
        &self,
        packet_id: u16,
        packet_type: PacketType,
        inherited: &Properties,
        reason: ReasonCode,
    ) -> Message {
        let mut properties = if self.options.compatibilities.no_inherited_properties_on_ack {
            Properties::default()
        } else {
            let mut props = Properties::default();
            props.user_properties = inherited.user_properties.clone();
            props
        };
        if reason.is_error() {
            properties.reason_string = Some(reason.reason().to_string());
        }

        let created = unix_now();
        Message {
            packet_type,
            packet_id,
            reason_code: reason,
            properties,
            created,
            expiry: created + self.options.capabilities.maximum_message_expiry_interval,
            ..Default::default()
        }
    }
}
