//! Hook chain
//!
//! An ordered, dynamically extensible pipeline of observers and filters
//! consulted at every decision boundary: connect, authenticate, ACL,
//! subscribe, publish, deliver, disconnect, expiry, plus the persistence
//! read API used at startup and session takeover.
//!
//! Each hook declares the events it provides; the chain dispatches only to
//! providers. Boolean events resolve to allow when nothing provides them,
//! and to allow when any provider allows (auth backends are alternatives,
//! not vetoes).

pub mod events;

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::protocol::{Auth, Connect, Message, ReasonCode, Subscribe, Subscription, Unsubscribe, Will};
use crate::session::Client;
use crate::system::InfoSnapshot;
use crate::topic::Subscribers;

/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal hook failure; boolean decisions read this as deny
    Internal(String),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "internal hook error: {}", msg),
        }
    }
}

impl std::error::Error for HookError {}

pub type HookResult<T> = Result<T, HookError>;

/// Event points a hook can provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    OnStarted,
    OnStopped,
    OnConnect,
    OnConnectAuthenticate,
    OnAclCheck,
    OnSessionEstablish,
    OnSessionEstablished,
    OnDisconnect,
    OnAuthPacket,
    OnSubscribe,
    OnSubscribed,
    OnUnsubscribe,
    OnUnsubscribed,
    OnPublish,
    OnPublished,
    OnPublishDropped,
    OnRetainMessage,
    OnRetainedExpired,
    OnClientExpired,
    OnQosPublish,
    OnQosComplete,
    OnQosDropped,
    OnPacketIdExhausted,
    OnWill,
    OnWillSent,
    OnSysInfoTick,
    OnSelectSubscribers,
    OnPublishedWithSharedFilters,
    StoredClients,
    StoredSubscriptions,
    StoredInflightMessages,
    StoredRetainedMessages,
    StoredSysInfo,
}

/// Outcome of the publish interception point.
#[derive(Debug)]
pub enum PublishCheck {
    /// Deliver, possibly rewritten
    Allow(Message),
    /// Acknowledge normally but suppress delivery
    Ignore(Message),
    /// Drop silently, no ack
    Reject,
    /// Acknowledge with an error code (v5, qos > 0)
    Error(ReasonCode),
}

/// A client record restored through the persistence read API.
#[derive(Debug, Clone, Default)]
pub struct StoredClient {
    pub id: String,
    pub listener: String,
    pub username: Option<String>,
    pub clean_start: bool,
    pub protocol_version: u8,
    pub session_expiry_interval: u32,
    pub session_expiry_set: bool,
    pub receive_maximum: u16,
    pub topic_alias_maximum: u16,
    pub maximum_packet_size: u32,
    pub will: Option<Will>,
}

/// A subscription restored through the persistence read API.
#[derive(Debug, Clone)]
pub struct StoredSubscription {
    pub client_id: String,
    pub subscription: Subscription,
}

/// Per-shared-filter delivery results reported after fan-out.
pub type SharedFilterResults = AHashMap<String, bool>;

/// A single hook. Every event method has an allowing/no-op default; a hook
/// implements the ones it declares in [`Hook::provides`].
#[async_trait]
pub trait Hook: Send + Sync {
    fn id(&self) -> &'static str;
    fn provides(&self, event: HookEvent) -> bool;

    /// Called when the broker shuts down, after all clients disconnected.
    async fn stop(&self) {}

    async fn on_started(&self) {}
    async fn on_stopped(&self) {}

    /// May refuse the connection outright by returning an error.
    async fn on_connect(&self, _client: &Arc<Client>, _connect: &Connect) -> HookResult<()> {
        Ok(())
    }

    async fn on_connect_authenticate(&self, _client: &Arc<Client>, _connect: &Connect) -> bool {
        true
    }

    /// `write` is true for publish access, false for subscribe/deliver.
    async fn on_acl_check(&self, _client: &Arc<Client>, _topic: &str, _write: bool) -> bool {
        true
    }

    async fn on_session_establish(&self, _client: &Arc<Client>, _connect: &Connect) {}
    async fn on_session_established(&self, _client: &Arc<Client>, _connect: &Connect) {}

    async fn on_disconnect(&self, _client: &Arc<Client>, _reason: Option<ReasonCode>, _expire: bool) {
    }

    async fn on_auth_packet(&self, _client: &Arc<Client>, _auth: &Auth) -> HookResult<()> {
        Ok(())
    }

    /// May rewrite the subscribe packet.
    async fn on_subscribe(&self, _client: &Arc<Client>, packet: Subscribe) -> Subscribe {
        packet
    }

    async fn on_subscribed(
        &self,
        _client: &Arc<Client>,
        _packet: &Subscribe,
        _reason_codes: &[u8],
        _counts: &[usize],
    ) {
    }

    /// May rewrite the unsubscribe packet.
    async fn on_unsubscribe(&self, _client: &Arc<Client>, packet: Unsubscribe) -> Unsubscribe {
        packet
    }

    async fn on_unsubscribed(
        &self,
        _client: &Arc<Client>,
        _packet: &Unsubscribe,
        _reason_codes: &[u8],
        _counts: &[usize],
    ) {
    }

    /// May rewrite, ignore, reject or error the publish.
    async fn on_publish(&self, _client: &Arc<Client>, msg: Message) -> PublishCheck {
        PublishCheck::Allow(msg)
    }

    async fn on_published(&self, _client: &Arc<Client>, _msg: &Message) {}
    async fn on_publish_dropped(&self, _client: &Arc<Client>, _msg: &Message) {}

    /// `result` is 1 stored/replaced, -1 cleared, 0 no-op.
    async fn on_retain_message(&self, _client: &Arc<Client>, _msg: &Message, _result: i32) {}
    async fn on_retained_expired(&self, _topic: &str) {}

    async fn on_client_expired(&self, _client: &Arc<Client>) {}

    async fn on_qos_publish(&self, _client: &Arc<Client>, _msg: &Message) {}
    async fn on_qos_complete(&self, _client: &Arc<Client>, _msg: &Message) {}
    async fn on_qos_dropped(&self, _client: &Arc<Client>, _msg: &Message) {}

    async fn on_packet_id_exhausted(&self, _client: &Arc<Client>, _msg: &Message) {}

    /// May rewrite the will before it is published.
    async fn on_will(&self, _client: &Arc<Client>, will: Will) -> Will {
        will
    }

    async fn on_will_sent(&self, _client: &Arc<Client>, _msg: &Message) {}

    async fn on_sys_info_tick(&self, _info: &InfoSnapshot) {}

    /// May fill `shared_selected` to override the default round-robin.
    async fn on_select_subscribers(
        &self,
        subscribers: Subscribers,
        _msg: &Message,
    ) -> Subscribers {
        subscribers
    }

    async fn on_published_with_shared_filters(
        &self,
        _msg: &Message,
        _results: &SharedFilterResults,
    ) {
    }

    // Persistence read API. A provider returns the stored records; the chain
    // consults the first provider only.

    async fn stored_clients(&self) -> HookResult<Vec<StoredClient>> {
        Ok(Vec::new())
    }

    async fn stored_subscriptions(&self) -> HookResult<Vec<StoredSubscription>> {
        Ok(Vec::new())
    }

    async fn stored_inflight_messages(&self) -> HookResult<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn stored_retained_messages(&self) -> HookResult<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn stored_sys_info(&self) -> HookResult<Option<InfoSnapshot>> {
        Ok(None)
    }

    async fn stored_subscriptions_by_cid(
        &self,
        _client_id: &str,
    ) -> HookResult<Vec<StoredSubscription>> {
        Ok(Vec::new())
    }

    async fn stored_inflight_by_cid(&self, _client_id: &str) -> HookResult<Vec<Message>> {
        Ok(Vec::new())
    }
}

/// Ordered chain of hooks.
#[derive(Default)]
pub struct HookChain {
    hooks: RwLock<Vec<Arc<dyn Hook>>>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, hook: Arc<dyn Hook>) {
        self.hooks.write().push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    /// True when any hook provides `event`.
    pub fn provides(&self, event: HookEvent) -> bool {
        self.hooks.read().iter().any(|h| h.provides(event))
    }

    fn providers(&self, event: HookEvent) -> Vec<Arc<dyn Hook>> {
        self.hooks
            .read()
            .iter()
            .filter(|h| h.provides(event))
            .cloned()
            .collect()
    }

    pub async fn stop_all(&self) {
        for hook in self.hooks.read().clone() {
            hook.stop().await;
        }
    }

    pub async fn on_started(&self) {
        for hook in self.providers(HookEvent::OnStarted) {
            hook.on_started().await;
        }
    }

    pub async fn on_stopped(&self) {
        for hook in self.providers(HookEvent::OnStopped) {
            hook.on_stopped().await;
        }
    }

    pub async fn on_connect(&self, client: &Arc<Client>, connect: &Connect) -> HookResult<()> {
        for hook in self.providers(HookEvent::OnConnect) {
            hook.on_connect(client, connect).await?;
        }
        Ok(())
    }

    /// Allow when no hook provides authentication; otherwise allow when any
    /// provider accepts the credentials.
    pub async fn on_connect_authenticate(&self, client: &Arc<Client>, connect: &Connect) -> bool {
        let providers = self.providers(HookEvent::OnConnectAuthenticate);
        if providers.is_empty() {
            return true;
        }
        for hook in providers {
            if hook.on_connect_authenticate(client, connect).await {
                return true;
            }
        }
        false
    }

    /// Same default-allow / any-provider-allows shape as authentication.
    pub async fn on_acl_check(&self, client: &Arc<Client>, topic: &str, write: bool) -> bool {
        let providers = self.providers(HookEvent::OnAclCheck);
        if providers.is_empty() {
            return true;
        }
        for hook in providers {
            if hook.on_acl_check(client, topic, write).await {
                return true;
            }
        }
        false
    }

    pub async fn on_session_establish(&self, client: &Arc<Client>, connect: &Connect) {
        for hook in self.providers(HookEvent::OnSessionEstablish) {
            hook.on_session_establish(client, connect).await;
        }
    }

    pub async fn on_session_established(&self, client: &Arc<Client>, connect: &Connect) {
        for hook in self.providers(HookEvent::OnSessionEstablished) {
            hook.on_session_established(client, connect).await;
        }
    }

    pub async fn on_disconnect(&self, client: &Arc<Client>, reason: Option<ReasonCode>, expire: bool) {
        for hook in self.providers(HookEvent::OnDisconnect) {
            hook.on_disconnect(client, reason, expire).await;
        }
    }

    pub async fn on_auth_packet(&self, client: &Arc<Client>, auth: &Auth) -> HookResult<()> {
        for hook in self.providers(HookEvent::OnAuthPacket) {
            hook.on_auth_packet(client, auth).await?;
        }
        Ok(())
    }

    pub async fn on_subscribe(&self, client: &Arc<Client>, mut packet: Subscribe) -> Subscribe {
        for hook in self.providers(HookEvent::OnSubscribe) {
            packet = hook.on_subscribe(client, packet).await;
        }
        packet
    }

    pub async fn on_subscribed(
        &self,
        client: &Arc<Client>,
        packet: &Subscribe,
        reason_codes: &[u8],
        counts: &[usize],
    ) {
        for hook in self.providers(HookEvent::OnSubscribed) {
            hook.on_subscribed(client, packet, reason_codes, counts).await;
        }
    }

    pub async fn on_unsubscribe(&self, client: &Arc<Client>, mut packet: Unsubscribe) -> Unsubscribe {
        for hook in self.providers(HookEvent::OnUnsubscribe) {
            packet = hook.on_unsubscribe(client, packet).await;
        }
        packet
    }

    pub async fn on_unsubscribed(
        &self,
        client: &Arc<Client>,
        packet: &Unsubscribe,
        reason_codes: &[u8],
        counts: &[usize],
    ) {
        for hook in self.providers(HookEvent::OnUnsubscribed) {
            hook.on_unsubscribed(client, packet, reason_codes, counts)
                .await;
        }
    }

    /// Run the publish interceptors in order; the first non-allow outcome
    /// wins, except `Ignore` which taints the message and continues.
    pub async fn on_publish(&self, client: &Arc<Client>, msg: Message) -> PublishCheck {
        let mut msg = msg;
        for hook in self.providers(HookEvent::OnPublish) {
            match hook.on_publish(client, msg).await {
                PublishCheck::Allow(m) => msg = m,
                PublishCheck::Ignore(mut m) => {
                    m.ignore = true;
                    msg = m;
                }
                outcome => return outcome,
            }
        }
        PublishCheck::Allow(msg)
    }

    pub async fn on_published(&self, client: &Arc<Client>, msg: &Message) {
        for hook in self.providers(HookEvent::OnPublished) {
            hook.on_published(client, msg).await;
        }
    }

    pub async fn on_publish_dropped(&self, client: &Arc<Client>, msg: &Message) {
        for hook in self.providers(HookEvent::OnPublishDropped) {
            hook.on_publish_dropped(client, msg).await;
        }
    }

    pub async fn on_retain_message(&self, client: &Arc<Client>, msg: &Message, result: i32) {
        for hook in self.providers(HookEvent::OnRetainMessage) {
            hook.on_retain_message(client, msg, result).await;
        }
    }

    pub async fn on_retained_expired(&self, topic: &str) {
        for hook in self.providers(HookEvent::OnRetainedExpired) {
            hook.on_retained_expired(topic).await;
        }
    }

    pub async fn on_client_expired(&self, client: &Arc<Client>) {
        for hook in self.providers(HookEvent::OnClientExpired) {
            hook.on_client_expired(client).await;
        }
    }

    pub async fn on_qos_publish(&self, client: &Arc<Client>, msg: &Message) {
        for hook in self.providers(HookEvent::OnQosPublish) {
            hook.on_qos_publish(client, msg).await;
        }
    }

    pub async fn on_qos_complete(&self, client: &Arc<Client>, msg: &Message) {
        for hook in self.providers(HookEvent::OnQosComplete) {
            hook.on_qos_complete(client, msg).await;
        }
    }

    pub async fn on_qos_dropped(&self, client: &Arc<Client>, msg: &Message) {
        for hook in self.providers(HookEvent::OnQosDropped) {
            hook.on_qos_dropped(client, msg).await;
        }
    }

    pub async fn on_packet_id_exhausted(&self, client: &Arc<Client>, msg: &Message) {
        for hook in self.providers(HookEvent::OnPacketIdExhausted) {
            hook.on_packet_id_exhausted(client, msg).await;
        }
    }

    pub async fn on_will(&self, client: &Arc<Client>, mut will: Will) -> Will {
        for hook in self.providers(HookEvent::OnWill) {
            will = hook.on_will(client, will).await;
        }
        will
    }

    pub async fn on_will_sent(&self, client: &Arc<Client>, msg: &Message) {
        for hook in self.providers(HookEvent::OnWillSent) {
            hook.on_will_sent(client, msg).await;
        }
    }

    pub async fn on_sys_info_tick(&self, info: &InfoSnapshot) {
        for hook in self.providers(HookEvent::OnSysInfoTick) {
            hook.on_sys_info_tick(info).await;
        }
    }

    pub async fn on_select_subscribers(
        &self,
        mut subscribers: Subscribers,
        msg: &Message,
    ) -> Subscribers {
        for hook in self.providers(HookEvent::OnSelectSubscribers) {
            subscribers = hook.on_select_subscribers(subscribers, msg).await;
        }
        subscribers
    }

    pub async fn on_published_with_shared_filters(
        &self,
        msg: &Message,
        results: &SharedFilterResults,
    ) {
        for hook in self.providers(HookEvent::OnPublishedWithSharedFilters) {
            hook.on_published_with_shared_filters(msg, results).await;
        }
    }

    pub async fn stored_clients(&self) -> Vec<StoredClient> {
        self.first_provider_read(HookEvent::StoredClients, |h| async move {
            h.stored_clients().await
        })
        .await
        .unwrap_or_default()
    }

    pub async fn stored_subscriptions(&self) -> Vec<StoredSubscription> {
        self.first_provider_read(HookEvent::StoredSubscriptions, |h| async move {
            h.stored_subscriptions().await
        })
        .await
        .unwrap_or_default()
    }

    pub async fn stored_inflight_messages(&self) -> Vec<Message> {
        self.first_provider_read(HookEvent::StoredInflightMessages, |h| async move {
            h.stored_inflight_messages().await
        })
        .await
        .unwrap_or_default()
    }

    pub async fn stored_retained_messages(&self) -> Vec<Message> {
        self.first_provider_read(HookEvent::StoredRetainedMessages, |h| async move {
            h.stored_retained_messages().await
        })
        .await
        .unwrap_or_default()
    }

    pub async fn stored_sys_info(&self) -> Option<InfoSnapshot> {
        self.first_provider_read(HookEvent::StoredSysInfo, |h| async move {
            h.stored_sys_info().await
        })
        .await
        .flatten()
    }

    pub async fn stored_subscriptions_by_cid(&self, client_id: &str) -> Vec<StoredSubscription> {
        let cid = client_id.to_string();
        self.first_provider_read(HookEvent::StoredSubscriptions, move |h| {
            let cid = cid.clone();
            async move { h.stored_subscriptions_by_cid(&cid).await }
        })
        .await
        .unwrap_or_default()
    }

    pub async fn stored_inflight_by_cid(&self, client_id: &str) -> Vec<Message> {
        let cid = client_id.to_string();
        self.first_provider_read(HookEvent::StoredInflightMessages, move |h| {
            let cid = cid.clone();
            async move { h.stored_inflight_by_cid(&cid).await }
        })
        .await
        .unwrap_or_default()
    }

    async fn first_provider_read<T, F, Fut>(&self, event: HookEvent, read: F) -> Option<T>
    where
        F: Fn(Arc<dyn Hook>) -> Fut,
        Fut: std::future::Future<Output = HookResult<T>>,
    {
        let hook = self.providers(event).into_iter().next()?;
        let id = hook.id();
        match read(hook).await {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(hook = id, error = %e, "storage hook read failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyAuth;

    #[async_trait]
    impl Hook for DenyAuth {
        fn id(&self) -> &'static str {
            "deny-auth"
        }
        fn provides(&self, event: HookEvent) -> bool {
            matches!(event, HookEvent::OnConnectAuthenticate)
        }
        async fn on_connect_authenticate(&self, _client: &Arc<Client>, _connect: &Connect) -> bool {
            false
        }
    }

    struct AllowAuth;

    #[async_trait]
    impl Hook for AllowAuth {
        fn id(&self) -> &'static str {
            "allow-auth"
        }
        fn provides(&self, event: HookEvent) -> bool {
            matches!(event, HookEvent::OnConnectAuthenticate)
        }
    }

    struct RewriteTopic;

    #[async_trait]
    impl Hook for RewriteTopic {
        fn id(&self) -> &'static str {
            "rewrite-topic"
        }
        fn provides(&self, event: HookEvent) -> bool {
            matches!(event, HookEvent::OnPublish)
        }
        async fn on_publish(&self, _client: &Arc<Client>, mut msg: Message) -> PublishCheck {
            msg.topic = Arc::from("rewritten");
            PublishCheck::Allow(msg)
        }
    }

    fn test_client() -> Arc<Client> {
        let (client, _rx) = Client::new(Arc::from("c"), Arc::from("t"), None, 4);
        client
    }

    #[tokio::test]
    async fn boolean_hooks_default_to_allow() {
        let chain = HookChain::new();
        let client = test_client();
        assert!(chain.on_connect_authenticate(&client, &Connect::default()).await);
        assert!(chain.on_acl_check(&client, "t", true).await);
    }

    #[tokio::test]
    async fn any_allowing_provider_wins() {
        let chain = HookChain::new();
        chain.add(Arc::new(DenyAuth));
        let client = test_client();
        assert!(!chain.on_connect_authenticate(&client, &Connect::default()).await);

        chain.add(Arc::new(AllowAuth));
        assert!(chain.on_connect_authenticate(&client, &Connect::default()).await);
    }

    #[tokio::test]
    async fn publish_rewrite_flows_through_chain() {
        let chain = HookChain::new();
        chain.add(Arc::new(RewriteTopic));
        let client = test_client();
        let msg = Message {
            topic: Arc::from("original"),
            ..Default::default()
        };
        match chain.on_publish(&client, msg).await {
            PublishCheck::Allow(m) => assert_eq!(&*m.topic, "rewritten"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn provides_gates_dispatch() {
        let chain = HookChain::new();
        chain.add(Arc::new(RewriteTopic));
        assert!(chain.provides(HookEvent::OnPublish));
        assert!(!chain.provides(HookEvent::OnAclCheck));
        // RewriteTopic does not provide auth, so the default allow applies
        let client = test_client();
        assert!(chain.on_connect_authenticate(&client, &Connect::default()).await);
    }
}
