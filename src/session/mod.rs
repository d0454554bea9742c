//! Client session state
//!
//! A [`Client`] is created per accepted connection (and per restored or
//! inline session) and holds everything the broker tracks for it: identity,
//! negotiated properties, the subscription set, topic aliases, the inflight
//! store and the outbound delivery channel. The [`ClientRegistry`] maps live
//! client ids to their clients; a new connection with a known id displaces
//! the previous client through the registry.

mod inflight;

pub use inflight::Inflight;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::protocol::{Packet, ProtocolVersion, ReasonCode, Subscription, Will};

/// Client id of the in-process pseudo-client.
pub const INLINE_CLIENT_ID: &str = "inline";
/// Listener id assigned to in-process and restored clients.
pub const LOCAL_LISTENER: &str = "local";

/// Receive quota granted to the inline client; effectively unbounded.
const INLINE_RECEIVE_QUOTA: i32 = i32::MAX;

/// Negotiated per-client properties, settled during the handshake.
#[derive(Debug, Clone)]
pub struct ClientProperties {
    pub protocol_version: ProtocolVersion,
    pub username: Option<String>,
    pub clean_start: bool,
    pub keepalive: u16,
    /// Set when the server assigned the keepalive rather than the client
    pub server_keepalive: bool,
    pub session_expiry_interval: u32,
    pub session_expiry_set: bool,
    /// Client's advertised receive maximum
    pub receive_maximum: u16,
    /// Client's advertised topic alias maximum
    pub topic_alias_maximum: u16,
    /// Client's advertised maximum packet size (0 = unbounded)
    pub maximum_packet_size: u32,
    /// Id the server generated for an empty v5 client id
    pub assigned_client_id: Option<String>,
    pub will: Option<Will>,
}

impl Default for ClientProperties {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V311,
            username: None,
            clean_start: true,
            keepalive: 60,
            server_keepalive: false,
            session_expiry_interval: 0,
            session_expiry_set: false,
            receive_maximum: 0,
            topic_alias_maximum: 0,
            maximum_packet_size: 0,
            assigned_client_id: None,
            will: None,
        }
    }
}

/// Failure modes for enqueueing onto a client's outbound channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The connection is gone
    Closed,
    /// The bounded channel is full; the packet was dropped
    WritesExceeded,
}

/// One MQTT client (live connection, restored session, or the inline
/// pseudo-client).
pub struct Client {
    pub id: Arc<str>,
    pub listener: Arc<str>,
    pub remote_addr: Option<SocketAddr>,
    pub inline: bool,
    pub properties: RwLock<ClientProperties>,
    pub inflight: Inflight,
    /// filter -> subscription, the client's own record of its subscriptions
    pub subscriptions: RwLock<AHashMap<String, Subscription>>,
    pub aliases: TopicAliases,
    outbound: mpsc::Sender<Packet>,
    last_packet_id: Mutex<u16>,
    /// Unix seconds of disconnect; 0 while connected
    disconnected_at: AtomicI64,
    taken_over: AtomicBool,
    closed: AtomicBool,
    /// Wakes the connection loop for shutdown; the reason packet to flush
    /// first is parked in `stop_packet`
    stop: Notify,
    stop_packet: Mutex<Option<Packet>>,
}

impl Client {
    /// Create a client bound to a connection. The receiver side of the
    /// outbound channel belongs to the connection's select loop.
    pub fn new(
        id: Arc<str>,
        listener: Arc<str>,
        remote_addr: Option<SocketAddr>,
        outbound_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(outbound_capacity.max(1));
        let client = Arc::new(Self {
            id,
            listener,
            remote_addr,
            inline: false,
            properties: RwLock::new(ClientProperties::default()),
            inflight: Inflight::new(),
            subscriptions: RwLock::new(AHashMap::new()),
            aliases: TopicAliases::new(),
            outbound: tx,
            last_packet_id: Mutex::new(0),
            disconnected_at: AtomicI64::new(0),
            taken_over: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stop: Notify::new(),
            stop_packet: Mutex::new(None),
        });
        (client, rx)
    }

    /// Create a client with no connection: restored from a persistence hook.
    /// It never receives wire writes; QoS messages park in its inflight
    /// store until a real connection inherits the session.
    pub fn new_detached(id: Arc<str>, listener: Arc<str>) -> Arc<Self> {
        let (client, _rx) = Self::new(id, listener, None, 1);
        client.closed.store(true, Ordering::Release);
        client.mark_disconnected(0);
        client
    }

    /// The in-process pseudo-client: bypasses ACL and receive quota.
    pub fn new_inline() -> Arc<Self> {
        let (tx, _rx) = mpsc::channel(1);
        let client = Arc::new(Self {
            id: Arc::from(INLINE_CLIENT_ID),
            listener: Arc::from(LOCAL_LISTENER),
            remote_addr: None,
            inline: true,
            properties: RwLock::new(ClientProperties::default()),
            inflight: Inflight::new(),
            subscriptions: RwLock::new(AHashMap::new()),
            aliases: TopicAliases::new(),
            outbound: tx,
            last_packet_id: Mutex::new(0),
            disconnected_at: AtomicI64::new(0),
            taken_over: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stop: Notify::new(),
            stop_packet: Mutex::new(None),
        });
        client.inflight.reset_receive_quota(INLINE_RECEIVE_QUOTA);
        client
    }

    /// Enqueue a packet for the connection writer without blocking. A full
    /// channel drops the packet and reports [`EnqueueError::WritesExceeded`].
    pub fn enqueue(&self, packet: Packet) -> Result<(), EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }
        self.outbound.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::WritesExceeded,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Ask the connection loop to flush `packet` (if any) and close.
    pub fn stop(&self, packet: Option<Packet>) {
        if let Some(packet) = packet {
            *self.stop_packet.lock() = Some(packet);
        }
        self.closed.store(true, Ordering::Release);
        self.stop.notify_waiters();
        self.stop.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Awaitable shutdown signal for the connection loop.
    pub async fn stopped(&self) {
        if self.is_closed() {
            return;
        }
        self.stop.notified().await;
    }

    /// Take the packet to flush before closing, if a stop reason was set.
    pub fn take_stop_packet(&self) -> Option<Packet> {
        self.stop_packet.lock().take()
    }

    pub fn mark_disconnected(&self, now: i64) {
        self.disconnected_at.store(now, Ordering::Release);
    }

    /// Unix seconds of disconnect; 0 while connected.
    pub fn disconnected_at(&self) -> i64 {
        self.disconnected_at.load(Ordering::Acquire)
    }

    pub fn set_taken_over(&self) {
        self.taken_over.store(true, Ordering::Release);
    }

    pub fn is_taken_over(&self) -> bool {
        self.taken_over.load(Ordering::Acquire)
    }

    /// Allocate the next packet id: monotonic, wrapping at 65535, skipping
    /// ids currently inflight [MQTT-4.3.2-1] [MQTT-4.3.3-1].
    pub fn next_packet_id(&self) -> Result<u16, ReasonCode> {
        let mut last = self.last_packet_id.lock();
        if self.inflight.len() >= u16::MAX as usize {
            return Err(ReasonCode::QuotaExceeded);
        }
        let mut candidate = *last;
        loop {
            candidate = if candidate == u16::MAX { 1 } else { candidate + 1 };
            if candidate == *last {
                return Err(ReasonCode::QuotaExceeded);
            }
            if !self.inflight.contains(candidate) {
                *last = candidate;
                return Ok(candidate);
            }
        }
    }

    /// True when this session ends with the connection: v5 with a zero
    /// session expiry, or a clean pre-v5 session.
    pub fn expires_immediately(&self) -> bool {
        let props = self.properties.read();
        if props.protocol_version == ProtocolVersion::V5 {
            props.session_expiry_interval == 0
        } else {
            props.clean_start
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("listener", &self.listener)
            .field("inline", &self.inline)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Per-connection topic alias maps (v5).
#[derive(Debug)]
pub struct TopicAliases {
    inbound: Mutex<AHashMap<u16, Arc<str>>>,
    outbound: Mutex<OutboundAliases>,
}

#[derive(Debug, Default)]
struct OutboundAliases {
    by_topic: AHashMap<Arc<str>, u16>,
    next: u16,
    max: u16,
}

impl Default for TopicAliases {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicAliases {
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(AHashMap::new()),
            outbound: Mutex::new(OutboundAliases {
                by_topic: AHashMap::new(),
                next: 0,
                max: 0,
            }),
        }
    }

    /// Record an inbound (alias, topic) binding, replacing any previous one.
    pub fn set_inbound(&self, alias: u16, topic: Arc<str>) {
        self.inbound.lock().insert(alias, topic);
    }

    /// Topic previously bound to `alias`, if any.
    pub fn resolve_inbound(&self, alias: u16) -> Option<Arc<str>> {
        self.inbound.lock().get(&alias).cloned()
    }

    /// Cap for outbound aliases, from the client's advertised maximum.
    pub fn set_outbound_max(&self, max: u16) {
        self.outbound.lock().max = max;
    }

    /// Existing or newly allocated outbound alias for `topic`. Returns
    /// `(alias, existed)`; alias 0 means the space is exhausted.
    pub fn obtain_outbound(&self, topic: &Arc<str>) -> (u16, bool) {
        let mut out = self.outbound.lock();
        if let Some(&alias) = out.by_topic.get(topic) {
            return (alias, true);
        }
        if out.next < out.max {
            out.next += 1;
            let alias = out.next;
            out.by_topic.insert(topic.clone(), alias);
            return (alias, false);
        }
        (0, false)
    }
}

/// Live clients known to the broker, keyed by client id.
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<Arc<str>, Arc<Client>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Insert or replace; at most one live client per id.
    pub fn add(&self, client: Arc<Client>) {
        self.clients.insert(client.id.clone(), client);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.get(id).map(|c| c.clone())
    }

    /// Remove the id only while it still maps to `client`; a takeover that
    /// already replaced the entry is left alone.
    pub fn delete_if_same(&self, client: &Arc<Client>) {
        self.clients
            .remove_if(&client.id, |_, current| Arc::ptr_eq(current, client));
    }

    pub fn delete(&self, id: &str) {
        self.clients.remove(id);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<Client>> {
        self.clients.iter().map(|c| c.clone()).collect()
    }

    pub fn by_listener(&self, listener: &str) -> Vec<Arc<Client>> {
        self.clients
            .iter()
            .filter(|c| &*c.listener == listener)
            .map(|c| c.clone())
            .collect()
    }
}
