//! Topic index: subscription filters and retained messages
//!
//! Answers "who matches topic T" for the router. Ordinary and shared
//! subscriptions live in a trie keyed by the filter (for shared filters, the
//! inner filter after `$share/<group>/`); retained messages live in a flat
//! concurrent map keyed by topic.

mod trie;
pub mod validation;

pub use trie::TopicTrie;
pub use validation::{
    is_shared_filter, parse_shared, topic_matches_filter, validate_topic_filter,
    validate_topic_name, SHARE_PREFIX,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::protocol::{Message, Subscription};
use crate::session::Client;

/// Handler invoked synchronously by the router for inline subscriptions.
pub type InlineHandler = Arc<dyn Fn(&Client, &Subscription, &Message) + Send + Sync>;

/// An in-process subscription owned by the embedding application.
#[derive(Clone)]
pub struct InlineSubscription {
    pub filter: String,
    pub identifier: u32,
    pub handler: InlineHandler,
}

impl std::fmt::Debug for InlineSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineSubscription")
            .field("filter", &self.filter)
            .field("identifier", &self.identifier)
            .finish()
    }
}

/// Per-filter subscriber sets stored at a trie node.
#[derive(Debug, Default)]
struct FilterEntry {
    /// client-id -> subscription
    subs: AHashMap<Arc<str>, Subscription>,
    /// group -> client-id -> subscription
    shared: AHashMap<String, AHashMap<Arc<str>, Subscription>>,
    inline: Vec<InlineSubscription>,
}

impl FilterEntry {
    fn is_empty(&self) -> bool {
        self.subs.is_empty() && self.shared.is_empty() && self.inline.is_empty()
    }

    fn subscriber_count(&self) -> usize {
        self.subs.len() + self.shared.values().map(|m| m.len()).sum::<usize>()
    }
}

/// The resolved subscriber set for one topic.
#[derive(Debug, Default)]
pub struct Subscribers {
    /// Merged per-client ordinary subscriptions
    pub ordinary: AHashMap<Arc<str>, Subscription>,
    /// Full shared filter (`$share/<group>/<filter>`) -> members
    pub shared: AHashMap<String, AHashMap<Arc<str>, Subscription>>,
    /// One selected member per shared filter, keyed by client id
    pub shared_selected: AHashMap<Arc<str>, Subscription>,
    pub inline: Vec<InlineSubscription>,
}

impl Subscribers {
    /// Fold the selected shared members into the ordinary map so delivery is
    /// uniform.
    pub fn merge_shared_selected(&mut self) {
        for (cid, sub) in std::mem::take(&mut self.shared_selected) {
            merge_into(&mut self.ordinary, cid, sub);
        }
    }
}

/// Merge `sub` into the per-client map: max qos, union of identifiers, OR of
/// no-local, AND of retain-as-published; the filter string follows the
/// higher-qos subscription.
fn merge_into(map: &mut AHashMap<Arc<str>, Subscription>, cid: Arc<str>, sub: Subscription) {
    match map.entry(cid) {
        std::collections::hash_map::Entry::Vacant(slot) => {
            let mut sub = sub;
            if let Some(id) = sub.identifier {
                if !sub.identifiers.contains(&id) {
                    sub.identifiers.push(id);
                }
            }
            sub.identifiers.sort_unstable();
            slot.insert(sub);
        }
        std::collections::hash_map::Entry::Occupied(mut slot) => {
            let existing = slot.get_mut();
            if sub.qos > existing.qos {
                existing.qos = sub.qos;
                existing.filter = sub.filter;
            }
            existing.no_local |= sub.no_local;
            existing.retain_as_published &= sub.retain_as_published;
            for id in sub.identifiers.iter().copied().chain(sub.identifier) {
                if !existing.identifiers.contains(&id) {
                    existing.identifiers.push(id);
                }
            }
            existing.identifiers.sort_unstable();
        }
    }
}

/// Concurrent index of subscription filters and retained messages.
pub struct TopicsIndex {
    trie: RwLock<TopicTrie<FilterEntry>>,
    retained: DashMap<String, Message>,
    /// Round-robin cursors for shared filters, keyed by the full filter
    share_cursors: DashMap<String, AtomicUsize>,
}

impl Default for TopicsIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicsIndex {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(TopicTrie::new()),
            retained: DashMap::new(),
            share_cursors: DashMap::new(),
        }
    }

    /// Register a subscription. `sub.filter` keeps the full filter string,
    /// `$share` prefix included. Returns whether the client's subscription to
    /// this filter is new, and the filter's subscriber count afterwards.
    pub fn subscribe(&self, client_id: &Arc<str>, sub: Subscription) -> (bool, usize) {
        let shared = parse_shared(&sub.filter).map(|(g, inner)| (g.to_string(), inner.to_string()));
        let mut trie = self.trie.write();
        match shared {
            Some((group, inner)) => {
                let entry = trie.entry(&inner);
                let members = entry.shared.entry(group).or_default();
                let is_new = members.insert(client_id.clone(), sub).is_none();
                (is_new, entry.subscriber_count())
            }
            None => {
                let filter = sub.filter.clone();
                let entry = trie.entry(&filter);
                let is_new = entry.subs.insert(client_id.clone(), sub).is_none();
                (is_new, entry.subscriber_count())
            }
        }
    }

    /// Remove a client's subscription. Returns whether anything was removed
    /// and the filter's remaining subscriber count.
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> (bool, usize) {
        let mut trie = self.trie.write();
        let (inner, group) = match parse_shared(filter) {
            Some((group, inner)) => (inner, Some(group)),
            None => (filter, None),
        };

        let Some(entry) = trie.get_mut(inner) else {
            return (false, 0);
        };
        let removed = match group {
            Some(group) => match entry.shared.get_mut(group) {
                Some(members) => {
                    let removed = members.remove(client_id).is_some();
                    if members.is_empty() {
                        entry.shared.remove(group);
                    }
                    removed
                }
                None => false,
            },
            None => entry.subs.remove(client_id).is_some(),
        };
        let count = entry.subscriber_count();
        if entry.is_empty() {
            trie.remove(inner);
        }
        (removed, count)
    }

    /// Register an in-process subscription, replacing any with the same
    /// filter and identifier.
    pub fn inline_subscribe(&self, sub: InlineSubscription) -> (bool, usize) {
        let mut trie = self.trie.write();
        let filter = sub.filter.clone();
        let entry = trie.entry(&filter);
        let existing = entry
            .inline
            .iter()
            .position(|s| s.identifier == sub.identifier && s.filter == sub.filter);
        let is_new = existing.is_none();
        match existing {
            Some(i) => entry.inline[i] = sub,
            None => entry.inline.push(sub),
        }
        (is_new, entry.inline.len())
    }

    pub fn inline_unsubscribe(&self, identifier: u32, filter: &str) -> (bool, usize) {
        let mut trie = self.trie.write();
        let Some(entry) = trie.get_mut(filter) else {
            return (false, 0);
        };
        let before = entry.inline.len();
        entry
            .inline
            .retain(|s| !(s.identifier == identifier && s.filter == filter));
        let removed = entry.inline.len() != before;
        let count = entry.inline.len();
        if entry.is_empty() {
            trie.remove(filter);
        }
        (removed, count)
    }

    /// Resolve all subscribers of `topic`. Shared members are returned
    /// unselected; the router picks one per filter (or lets a hook do it).
    pub fn subscribers(&self, topic: &str) -> Subscribers {
        let trie = self.trie.read();
        let mut out = Subscribers::default();
        trie.matches(topic, |entry| {
            for (cid, sub) in &entry.subs {
                merge_into(&mut out.ordinary, cid.clone(), sub.clone());
            }
            for members in entry.shared.values() {
                for (cid, sub) in members {
                    // the stored subscription keeps the full `$share/...` filter
                    out.shared
                        .entry(sub.filter.clone())
                        .or_default()
                        .insert(cid.clone(), sub.clone());
                }
            }
            out.inline.extend(entry.inline.iter().cloned());
        });
        out
    }

    /// Default shared-subscription selection: deterministic round-robin over
    /// the members of each shared filter.
    pub fn select_shared(&self, subscribers: &mut Subscribers) {
        for (filter, members) in &subscribers.shared {
            if members.is_empty() {
                continue;
            }
            let mut ids: Vec<&Arc<str>> = members.keys().collect();
            ids.sort_unstable();
            let cursor = self
                .share_cursors
                .entry(filter.clone())
                .or_insert_with(|| AtomicUsize::new(0));
            let picked = ids[cursor.fetch_add(1, Ordering::Relaxed) % ids.len()].clone();
            if let Some(sub) = members.get(&picked) {
                merge_into(&mut subscribers.shared_selected, picked, sub.clone());
            }
        }
    }

    /// Store or clear a retained message. Returns 1 when stored/replaced,
    /// -1 when an empty payload cleared an entry, 0 otherwise.
    pub fn retain_message(&self, msg: Message) -> i32 {
        let topic = msg.topic.to_string();
        if msg.payload.is_empty() {
            return match self.retained.remove(&topic) {
                Some(_) => -1,
                None => 0,
            };
        }
        self.retained.insert(topic, msg);
        1
    }

    /// Retained messages whose topics match `filter`, skipping entries
    /// already past their expiry.
    pub fn messages(&self, filter: &str, now: i64) -> Vec<Message> {
        self.retained
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Drop retained messages past their expiry or older than the server
    /// maximum. Returns the expired topics.
    pub fn clear_expired_retained(&self, now: i64, max_expiry: i64) -> Vec<String> {
        let mut expired = Vec::new();
        self.retained.retain(|topic, msg| {
            let dead = msg.is_expired(now) || msg.created + max_expiry < now;
            if dead {
                expired.push(topic.clone());
            }
            !dead
        });
        expired
    }

    pub fn retained_len(&self) -> usize {
        self.retained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;
    use bytes::Bytes;

    fn cid(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    fn sub(filter: &str, qos: QoS) -> Subscription {
        Subscription::new(filter, qos)
    }

    #[test]
    fn subscribe_reports_new_and_count() {
        let index = TopicsIndex::new();
        let (is_new, count) = index.subscribe(&cid("a"), sub("x/y", QoS::AtMostOnce));
        assert!(is_new);
        assert_eq!(count, 1);
        let (is_new, count) = index.subscribe(&cid("a"), sub("x/y", QoS::AtLeastOnce));
        assert!(!is_new);
        assert_eq!(count, 1);
        let (is_new, count) = index.subscribe(&cid("b"), sub("x/y", QoS::AtMostOnce));
        assert!(is_new);
        assert_eq!(count, 2);
    }

    #[test]
    fn unsubscribe_prunes_filter() {
        let index = TopicsIndex::new();
        index.subscribe(&cid("a"), sub("x", QoS::AtMostOnce));
        let (removed, count) = index.unsubscribe("x", "a");
        assert!(removed);
        assert_eq!(count, 0);
        let (removed, _) = index.unsubscribe("x", "a");
        assert!(!removed);
    }

    #[test]
    fn overlapping_filters_merge_per_client() {
        let index = TopicsIndex::new();
        let mut first = sub("a/#", QoS::AtLeastOnce);
        first.identifier = Some(7);
        first.retain_as_published = true;
        let mut second = sub("a/+", QoS::ExactlyOnce);
        second.identifier = Some(9);
        second.no_local = true;
        index.subscribe(&cid("c"), first);
        index.subscribe(&cid("c"), second);

        let subscribers = index.subscribers("a/b");
        let merged = subscribers.ordinary.get(&cid("c")).unwrap();
        assert_eq!(merged.qos, QoS::ExactlyOnce);
        assert_eq!(merged.identifiers, vec![7, 9]);
        assert!(merged.no_local);
        // AND rule: one of the two had retain_as_published=false
        assert!(!merged.retain_as_published);
        assert_eq!(merged.filter, "a/+");
    }

    #[test]
    fn shared_members_kept_apart_until_selection() {
        let index = TopicsIndex::new();
        index.subscribe(&cid("m1"), sub("$share/g/jobs", QoS::AtMostOnce));
        index.subscribe(&cid("m2"), sub("$share/g/jobs", QoS::AtMostOnce));
        index.subscribe(&cid("solo"), sub("jobs", QoS::AtMostOnce));

        let mut subscribers = index.subscribers("jobs");
        assert_eq!(subscribers.ordinary.len(), 1);
        assert_eq!(subscribers.shared["$share/g/jobs"].len(), 2);

        index.select_shared(&mut subscribers);
        assert_eq!(subscribers.shared_selected.len(), 1);
        subscribers.merge_shared_selected();
        assert_eq!(subscribers.ordinary.len(), 2);
    }

    #[test]
    fn shared_round_robin_is_fair() {
        let index = TopicsIndex::new();
        index.subscribe(&cid("m1"), sub("$share/g/t", QoS::AtMostOnce));
        index.subscribe(&cid("m2"), sub("$share/g/t", QoS::AtMostOnce));
        index.subscribe(&cid("m3"), sub("$share/g/t", QoS::AtMostOnce));

        let mut counts: AHashMap<Arc<str>, usize> = AHashMap::new();
        for _ in 0..9 {
            let mut subscribers = index.subscribers("t");
            index.select_shared(&mut subscribers);
            for cid in subscribers.shared_selected.keys() {
                *counts.entry(cid.clone()).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&n| n == 3));
    }

    #[test]
    fn retain_store_and_clear() {
        let index = TopicsIndex::new();
        let msg = Message {
            topic: Arc::from("r"),
            payload: Bytes::from_static(b"v"),
            retain: true,
            ..Default::default()
        };
        assert_eq!(index.retain_message(msg.clone()), 1);
        assert_eq!(index.retain_message(msg), 1);
        assert_eq!(index.retained_len(), 1);

        let clear = Message {
            topic: Arc::from("r"),
            retain: true,
            ..Default::default()
        };
        assert_eq!(index.retain_message(clear.clone()), -1);
        assert_eq!(index.retain_message(clear), 0);
        assert_eq!(index.retained_len(), 0);
    }

    #[test]
    fn messages_skips_expired() {
        let index = TopicsIndex::new();
        let mut live = Message {
            topic: Arc::from("t/live"),
            payload: Bytes::from_static(b"x"),
            ..Default::default()
        };
        live.created = 100;
        live.expiry = 200;
        let mut dead = live.clone();
        dead.topic = Arc::from("t/dead");
        dead.expiry = 120;
        index.retain_message(live);
        index.retain_message(dead);

        let found = index.messages("t/#", 150);
        assert_eq!(found.len(), 1);
        assert_eq!(&*found[0].topic, "t/live");
    }

    #[test]
    fn expired_retained_swept() {
        let index = TopicsIndex::new();
        let mut msg = Message {
            topic: Arc::from("old"),
            payload: Bytes::from_static(b"x"),
            ..Default::default()
        };
        msg.created = 0;
        msg.expiry = 10;
        index.retain_message(msg);
        let expired = index.clear_expired_retained(100, 86_400);
        assert_eq!(expired, vec!["old".to_string()]);
        assert_eq!(index.retained_len(), 0);
    }
}
