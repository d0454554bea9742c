//! Broker core
//!
//! The [`Broker`] is the compositional root: it owns the client registry,
//! the topic index, the hook chain, the counters and the housekeeping loop,
//! accepts connections from listeners, and exposes the inline client for
//! in-process publish/subscribe.

pub mod connection;
mod housekeeping;
mod router;

pub use connection::{Connection, ConnectionError};

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::hooks::{HookChain, HookEvent, PublishCheck};
use crate::listener::Listener;
use crate::protocol::{
    Disconnect, Message, Packet, PacketType, ProtocolVersion, QoS, ReasonCode, Subscribe,
    Subscription, Unsubscribe,
};
use crate::session::{Client, ClientRegistry, LOCAL_LISTENER};
use crate::system::{unix_now, Info};
use crate::topic::{validate_topic_filter, InlineHandler, InlineSubscription, TopicsIndex};

/// Broker version advertised under `$SYS/broker/version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Features and limits the server advertises and enforces.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Cap on v5 session expiry, seconds
    pub maximum_session_expiry_interval: u32,
    /// Cap on message expiry and retained lifetimes, seconds
    pub maximum_message_expiry_interval: i64,
    /// Concurrent unacked QoS messages allowed per client
    pub receive_maximum: u16,
    /// Highest QoS granted (0, 1 or 2)
    pub maximum_qos: u8,
    pub retain_available: bool,
    /// 0 = unbounded
    pub maximum_packet_size: u32,
    pub topic_alias_maximum: u16,
    pub wildcard_sub_available: bool,
    pub sub_id_available: bool,
    pub shared_sub_available: bool,
    /// Reject CONNECTs below this protocol level
    pub minimum_protocol_version: u8,
    /// Outbound channel depth per client
    pub maximum_client_writes_pending: usize,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            maximum_session_expiry_interval: u32::MAX,
            maximum_message_expiry_interval: 60 * 60 * 24,
            receive_maximum: 1024,
            maximum_qos: 2,
            retain_available: true,
            maximum_packet_size: 0,
            topic_alias_maximum: u16::MAX,
            wildcard_sub_available: true,
            sub_id_available: true,
            shared_sub_available: true,
            minimum_protocol_version: 3,
            maximum_client_writes_pending: 1024 * 8,
        }
    }
}

impl Capabilities {
    /// Clamp a QoS to the server maximum.
    pub fn cap_qos(&self, qos: QoS) -> QoS {
        if qos as u8 > self.maximum_qos {
            QoS::from_u8(self.maximum_qos).unwrap_or(QoS::AtMostOnce)
        } else {
            qos
        }
    }
}

/// Spec-deviation toggles for interoperating with non-conforming clients.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Compatibilities {
    /// Report `unspecified-error` instead of `not-authorized`
    pub obscure_not_authorized: bool,
    /// Send DISCONNECT but leave the socket open for the client to close
    pub passive_client_disconnect: bool,
    /// Always echo response info on CONNACK
    pub always_return_response_info: bool,
    /// Restore cumulative $SYS counters from the store on startup
    pub restore_sys_info_on_restart: bool,
    /// Strip inherited user properties from acks
    pub no_inherited_properties_on_ack: bool,
}

/// Configurable broker options.
#[derive(Debug, Clone)]
pub struct Options {
    pub capabilities: Capabilities,
    pub compatibilities: Compatibilities,
    pub sys_topic_interval: Duration,
    pub client_expiry_interval: Duration,
    pub inflight_expiry_interval: Duration,
    pub retained_expiry_interval: Duration,
    pub delayed_will_interval: Duration,
    /// Client ids refused at connect
    pub blacklist: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            capabilities: Capabilities::default(),
            compatibilities: Compatibilities::default(),
            sys_topic_interval: Duration::from_secs(1),
            client_expiry_interval: Duration::from_secs(10),
            inflight_expiry_interval: Duration::from_secs(10),
            retained_expiry_interval: Duration::from_secs(30),
            delayed_will_interval: Duration::from_secs(5),
            blacklist: Vec::new(),
        }
    }
}

/// The MQTT broker.
pub struct Broker {
    pub options: Options,
    pub clients: ClientRegistry,
    pub topics: TopicsIndex,
    pub info: Info,
    pub hooks: HookChain,
    inline_client: Arc<Client>,
    /// client-id -> pending will, swept by housekeeping
    delayed_wills: DashMap<Arc<str>, Message>,
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
    shutdown: broadcast::Sender<()>,
    /// Back-reference for handing `Arc<Broker>` to spawned tasks
    self_ref: Weak<Broker>,
}

impl Broker {
    pub fn new(options: Options) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        let clients = ClientRegistry::new();
        let inline_client = Client::new_inline();
        clients.add(inline_client.clone());
        Arc::new_cyclic(|self_ref| Self {
            options,
            clients,
            topics: TopicsIndex::new(),
            info: Info::new(unix_now()),
            hooks: HookChain::new(),
            inline_client,
            delayed_wills: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            shutdown,
            self_ref: self_ref.clone(),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(Options::default())
    }

    /// Owning handle to this broker, for spawned tasks.
    fn arc(&self) -> Arc<Broker> {
        self.self_ref.upgrade().expect("broker is referenced")
    }

    pub fn inline_client(&self) -> &Arc<Client> {
        &self.inline_client
    }

    /// Attach a hook; call before `serve` so it observes startup events.
    pub fn add_hook(&self, hook: Arc<dyn crate::hooks::Hook>) {
        info!(hook = hook.id(), "added hook");
        self.hooks.add(hook);
    }

    /// Register a listener to be served once the broker starts.
    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        info!(
            id = listener.id(),
            protocol = listener.protocol(),
            address = %listener.address(),
            "attached listener"
        );
        self.listeners.lock().push(listener);
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Start serving: restore stored state, spawn housekeeping and listener
    /// accept loops, and fire the started hooks. Returns immediately.
    pub async fn serve(&self) {
        if self.hooks.provides(HookEvent::StoredClients)
            || self.hooks.provides(HookEvent::StoredSubscriptions)
            || self.hooks.provides(HookEvent::StoredInflightMessages)
            || self.hooks.provides(HookEvent::StoredRetainedMessages)
            || self.hooks.provides(HookEvent::StoredSysInfo)
        {
            self.read_store().await;
        }

        housekeeping::spawn(self.arc());

        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            let broker = self.arc();
            tokio::spawn(async move {
                listener.serve(broker).await;
            });
        }

        self.hooks.on_started().await;
        info!(version = VERSION, "broker started");
    }

    /// Entry point for listeners: run the session machine for one accepted
    /// byte stream.
    pub async fn establish_connection<S>(
        self: Arc<Self>,
        listener_id: &str,
        stream: S,
        addr: std::net::SocketAddr,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        Connection::new(self, Arc::from(listener_id), stream, addr)
            .run()
            .await
    }

    /// Gracefully stop: notify hooks, disconnect every client, close the
    /// listeners, then stop the hooks so persistence sees all disconnects.
    pub async fn close(&self) {
        self.hooks.on_stopped().await;

        for client in self.clients.all() {
            if !client.inline {
                self.disconnect_client(&client, ReasonCode::ServerShuttingDown);
            }
        }
        // give connection loops a moment to flush the disconnects
        tokio::time::sleep(Duration::from_millis(100)).await;

        let _ = self.shutdown.send(());
        for listener in self.listeners.lock().iter() {
            listener.close();
        }

        self.hooks.stop_all().await;
        info!("broker stopped");
    }

    /// Send DISCONNECT with `code` and close the connection (unless the
    /// passive compatibility toggle leaves closing to the client).
    pub fn disconnect_client(&self, client: &Arc<Client>, code: ReasonCode) {
        let mut disconnect = Disconnect {
            reason_code: code,
            ..Default::default()
        };
        if code.is_error() {
            disconnect.properties.reason_string = Some(code.reason().to_string());
        }
        let packet = Packet::Disconnect(disconnect);
        if self.options.compatibilities.passive_client_disconnect {
            let _ = client.enqueue(packet);
        } else {
            client.stop(Some(packet));
        }
    }

    /// Cancel a pending delayed will, e.g. when its client reconnects.
    pub(crate) fn cancel_delayed_will(&self, client_id: &str) {
        self.delayed_wills.remove(client_id);
    }

    pub(crate) fn schedule_delayed_will(&self, client_id: Arc<str>, msg: Message) {
        self.delayed_wills.insert(client_id, msg);
    }

    pub(crate) fn delayed_wills(&self) -> &DashMap<Arc<str>, Message> {
        &self.delayed_wills
    }

    /// Publish the client's will, immediately or after its delay interval.
    pub(crate) async fn send_lwt(&self, client: &Arc<Client>) {
        let will = client.properties.read().will.clone();
        let Some(will) = will else { return };

        let will = self.hooks.on_will(client, will).await;
        let delay = will.properties.will_delay_interval.unwrap_or(0);

        let mut msg = Message {
            packet_type: PacketType::Publish,
            qos: will.qos,
            retain: will.retain,
            topic: Arc::from(will.topic.as_str()),
            payload: will.payload.clone(),
            origin: client.id.clone(),
            created: unix_now(),
            ..Default::default()
        };
        msg.properties.user_properties = will.properties.user_properties.clone();

        if delay > 0 {
            msg.expiry = msg.created + i64::from(delay);
            self.schedule_delayed_will(client.id.clone(), msg);
            return;
        }

        if msg.retain {
            self.retain_message(client, &msg).await;
        }
        self.fan_out(msg.clone()).await;
        client.properties.write().will = None;
        self.hooks.on_will_sent(client, &msg).await;
    }

    /// Expiry stamp for a message: its own expiry interval capped by the
    /// server maximum.
    pub(crate) fn message_expiry(&self, created: i64, interval: Option<u32>) -> i64 {
        let max = self.options.capabilities.maximum_message_expiry_interval;
        created
            + match interval {
                Some(interval) if interval > 0 => max.min(i64::from(interval)),
                _ => max,
            }
    }

    /// Index a retain-flagged publish (or clear on empty payload) and update
    /// the retained gauge.
    pub(crate) async fn retain_message(&self, client: &Arc<Client>, msg: &Message) {
        if !self.options.capabilities.retain_available || msg.ignore {
            return;
        }
        let mut stored = msg.clone();
        stored.dup = false;
        stored.packet_id = 0;
        if stored.created == 0 {
            stored.created = unix_now();
        }
        stored.expiry =
            self.message_expiry(stored.created, stored.properties.message_expiry_interval);
        let result = self.topics.retain_message(stored);
        self.hooks.on_retain_message(client, msg, result).await;
        Info::set(&self.info.retained, self.topics.retained_len() as i64);
    }

    /// Publish from the embedding process through the inline client. The qos
    /// caps outbound delivery; there is no inbound QoS exchange.
    pub async fn publish(
        &self,
        topic: &str,
        payload: bytes::Bytes,
        retain: bool,
        qos: QoS,
    ) -> Result<(), ReasonCode> {
        let client = self.inline_client.clone();
        let mut msg = Message {
            packet_type: PacketType::Publish,
            qos: self.options.capabilities.cap_qos(qos),
            retain,
            topic: Arc::from(topic),
            payload,
            origin: client.id.clone(),
            created: unix_now(),
            ..Default::default()
        };

        match self.hooks.on_publish(&client, msg).await {
            PublishCheck::Allow(m) => msg = m,
            PublishCheck::Ignore(mut m) => {
                m.ignore = true;
                msg = m;
            }
            PublishCheck::Reject => return Ok(()),
            PublishCheck::Error(code) => return Err(code),
        }

        if msg.retain {
            self.retain_message(&client, &msg).await;
        }

        Info::add(&self.info.packets_received, 1);
        Info::add(&self.info.messages_received, 1);
        self.fan_out(msg.clone()).await;
        self.hooks.on_published(&client, &msg).await;
        Ok(())
    }

    /// Register an in-process subscription with a handler invoked for every
    /// matching publish. Retained matches are delivered immediately.
    pub async fn subscribe(
        &self,
        filter: &str,
        subscription_id: u32,
        handler: InlineHandler,
    ) -> Result<(), ReasonCode> {
        if validate_topic_filter(filter).is_err() {
            return Err(ReasonCode::TopicFilterInvalid);
        }

        let mut subscription = Subscription::new(filter, QoS::AtMostOnce);
        subscription.identifier = (subscription_id > 0).then_some(subscription_id);

        let packet = self
            .hooks
            .on_subscribe(
                &self.inline_client,
                Subscribe {
                    packet_id: 0,
                    filters: vec![subscription.clone()],
                    properties: Default::default(),
                },
            )
            .await;

        let inline = InlineSubscription {
            filter: filter.to_string(),
            identifier: subscription_id,
            handler: handler.clone(),
        };
        let (_, count) = self.topics.inline_subscribe(inline);
        self.hooks
            .on_subscribed(
                &self.inline_client,
                &packet,
                &[ReasonCode::Success as u8],
                &[count],
            )
            .await;

        for msg in self.topics.messages(filter, unix_now()) {
            handler(&self.inline_client, &subscription, &msg);
        }
        Ok(())
    }

    /// Remove an in-process subscription.
    pub async fn unsubscribe(&self, filter: &str, subscription_id: u32) -> Result<(), ReasonCode> {
        if validate_topic_filter(filter).is_err() {
            return Err(ReasonCode::TopicFilterInvalid);
        }

        let packet = self
            .hooks
            .on_unsubscribe(
                &self.inline_client,
                Unsubscribe {
                    packet_id: 0,
                    filters: vec![filter.to_string()],
                    properties: Default::default(),
                },
            )
            .await;

        let (_, count) = self.topics.inline_unsubscribe(subscription_id, filter);
        self.hooks
            .on_unsubscribed(
                &self.inline_client,
                &packet,
                &[ReasonCode::Success as u8],
                &[count],
            )
            .await;
        Ok(())
    }

    /// Remove a client's subscriptions from its own set and, unless it was
    /// taken over, from the topic index.
    pub(crate) async fn unsubscribe_client(&self, client: &Arc<Client>) {
        let filters: Vec<(String, Subscription)> =
            client.subscriptions.write().drain().collect();

        if client.is_taken_over() || filters.is_empty() {
            return;
        }

        let mut reason_codes = Vec::with_capacity(filters.len());
        let mut counts = Vec::with_capacity(filters.len());
        let mut packet = Unsubscribe {
            packet_id: 0,
            filters: Vec::with_capacity(filters.len()),
            properties: Default::default(),
        };
        for (filter, _) in &filters {
            let (removed, count) = self.topics.unsubscribe(filter, &client.id);
            if removed {
                Info::add(&self.info.subscriptions, -1);
                reason_codes.push(ReasonCode::Success as u8);
            } else {
                reason_codes.push(ReasonCode::NoSubscriptionExisted as u8);
            }
            counts.push(count);
            packet.filters.push(filter.clone());
        }
        self.hooks
            .on_unsubscribed(client, &packet, &reason_codes, &counts)
            .await;
    }

    /// Restore clients, subscriptions, inflight and retained state from the
    /// persistence hooks at startup.
    async fn read_store(&self) {
        let stored_clients = self.hooks.stored_clients().await;
        let count = stored_clients.len();
        for record in stored_clients {
            let client = self.client_from_store(&record);
            self.clients.add(client);
        }
        if count > 0 {
            debug!(count, "loaded clients from store");
        }

        let subs = self.hooks.stored_subscriptions().await;
        let count = subs.len();
        self.load_subscriptions(subs).await;
        if count > 0 {
            debug!(count, "loaded subscriptions from store");
        }

        let inflight = self.hooks.stored_inflight_messages().await;
        let count = inflight.len();
        self.load_inflight(inflight);
        if count > 0 {
            debug!(count, "loaded inflight messages from store");
        }

        let retained = self.hooks.stored_retained_messages().await;
        let count = retained.len();
        for msg in retained {
            self.topics.retain_message(msg);
        }
        Info::set(&self.info.retained, self.topics.retained_len() as i64);
        if count > 0 {
            debug!(count, "loaded retained messages from store");
        }

        if let Some(snapshot) = self.hooks.stored_sys_info().await {
            self.info.restore(
                &snapshot,
                self.options.compatibilities.restore_sys_info_on_restart,
            );
            debug!("loaded $SYS info from store");
        }
    }

    fn client_from_store(&self, record: &crate::hooks::StoredClient) -> Arc<Client> {
        let listener = if record.listener.is_empty() {
            Arc::from(LOCAL_LISTENER)
        } else {
            Arc::from(record.listener.as_str())
        };
        let client = Client::new_detached(Arc::from(record.id.as_str()), listener);
        {
            let mut props = client.properties.write();
            props.username = record.username.clone();
            props.clean_start = record.clean_start;
            props.protocol_version =
                ProtocolVersion::from_u8(record.protocol_version).unwrap_or(ProtocolVersion::V311);
            props.session_expiry_interval = record.session_expiry_interval;
            props.session_expiry_set = record.session_expiry_set;
            props.receive_maximum = record.receive_maximum;
            props.topic_alias_maximum = record.topic_alias_maximum;
            props.maximum_packet_size = record.maximum_packet_size;
            props.will = record.will.clone();
        }
        client
    }

    pub(crate) async fn load_subscriptions(&self, subs: Vec<crate::hooks::StoredSubscription>) {
        for stored in subs {
            let Some(client) = self.clients.get(&stored.client_id) else {
                continue;
            };
            let sub = stored.subscription;
            let (is_new, count) = self.topics.subscribe(&client.id, sub.clone());
            if is_new {
                Info::add(&self.info.subscriptions, 1);
                let packet = Subscribe {
                    packet_id: 0,
                    filters: vec![sub.clone()],
                    properties: Default::default(),
                };
                self.hooks
                    .on_subscribed(&client, &packet, &[sub.qos as u8], &[count])
                    .await;
            }
            client
                .subscriptions
                .write()
                .insert(sub.filter.clone(), sub);
        }
    }

    pub(crate) fn load_inflight(&self, messages: Vec<Message>) {
        for msg in messages {
            // stored inflight entries carry the owning client id as origin
            let Some(client) = self.clients.get(&msg.origin) else {
                continue;
            };
            if client.inflight.set(msg) {
                Info::add(&self.info.inflight, 1);
            }
        }
    }

    pub(crate) fn is_blacklisted(&self, client_id: &str) -> bool {
        self.options.blacklist.iter().any(|id| id == client_id)
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("clients", &self.clients.len())
            .field("retained", &self.topics.retained_len())
            .finish()
    }
}
