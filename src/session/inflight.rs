//! Per-client inflight message store
//!
//! An insertion-ordered map of in-progress QoS messages keyed by packet id,
//! together with the connection's send/receive quotas. Quotas are signed
//! atomics clamped to `[0, max]`; the store itself serialises behind one
//! mutex since every operation is keyed to a single client.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::protocol::{Message, EXPIRY_PARKED};

#[derive(Debug, Default)]
struct Inner {
    entries: AHashMap<u16, Message>,
    order: VecDeque<u16>,
}

/// Inflight store with flow-control quotas.
#[derive(Debug)]
pub struct Inflight {
    inner: Mutex<Inner>,
    send_quota: AtomicI32,
    receive_quota: AtomicI32,
    max_send_quota: AtomicI32,
    max_receive_quota: AtomicI32,
}

impl Default for Inflight {
    fn default() -> Self {
        Self::new()
    }
}

impl Inflight {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            send_quota: AtomicI32::new(0),
            receive_quota: AtomicI32::new(0),
            max_send_quota: AtomicI32::new(0),
            max_receive_quota: AtomicI32::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn get(&self, packet_id: u16) -> Option<Message> {
        self.inner.lock().entries.get(&packet_id).cloned()
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.inner.lock().entries.contains_key(&packet_id)
    }

    /// Insert or replace the entry for the message's packet id. Replacement
    /// keeps the original queue position. Returns true when newly inserted.
    pub fn set(&self, msg: Message) -> bool {
        let mut inner = self.inner.lock();
        let id = msg.packet_id;
        let is_new = inner.entries.insert(id, msg).is_none();
        if is_new {
            inner.order.push_back(id);
        }
        is_new
    }

    pub fn delete(&self, packet_id: u16) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.remove(&packet_id).is_none() {
            return false;
        }
        inner.order.retain(|id| *id != packet_id);
        true
    }

    /// Peek the head entry if it is parked awaiting send quota.
    pub fn next_immediate(&self) -> Option<Message> {
        let inner = self.inner.lock();
        let head = inner.order.front()?;
        let msg = inner.entries.get(head)?;
        (msg.expiry == EXPIRY_PARKED).then(|| msg.clone())
    }

    /// Entries in insertion order, for resend after session inheritance.
    pub fn entries(&self) -> Vec<Message> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).cloned())
            .collect()
    }

    /// Replace the store contents with `entries`, preserving their order.
    /// Quotas are left untouched; the caller reinstalls them.
    pub fn install(&self, entries: Vec<Message>) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        for msg in entries {
            let id = msg.packet_id;
            if inner.entries.insert(id, msg).is_none() {
                inner.order.push_back(id);
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Delete entries past their expiry or older than the server maximum.
    /// Returns the deleted packet ids.
    pub fn clear_expired(&self, now: i64, max_expiry: i64) -> Vec<u16> {
        let mut inner = self.inner.lock();
        let mut deleted = Vec::new();
        inner.entries.retain(|id, msg| {
            let dead = (msg.expiry > 0 && msg.expiry < now) || msg.created + max_expiry < now;
            if dead {
                deleted.push(*id);
            }
            !dead
        });
        if !deleted.is_empty() {
            let entries = &inner.entries;
            let retained: VecDeque<u16> = inner
                .order
                .iter()
                .copied()
                .filter(|id| entries.contains_key(id))
                .collect();
            inner.order = retained;
        }
        deleted
    }

    pub fn send_quota(&self) -> i32 {
        self.send_quota.load(Ordering::Acquire)
    }

    pub fn receive_quota(&self) -> i32 {
        self.receive_quota.load(Ordering::Acquire)
    }

    pub fn max_send_quota(&self) -> i32 {
        self.max_send_quota.load(Ordering::Acquire)
    }

    pub fn max_receive_quota(&self) -> i32 {
        self.max_receive_quota.load(Ordering::Acquire)
    }

    /// Set the receive quota and its maximum.
    pub fn reset_receive_quota(&self, quota: i32) {
        self.receive_quota.store(quota, Ordering::Release);
        self.max_receive_quota.store(quota, Ordering::Release);
    }

    /// Set the send quota and its maximum.
    pub fn reset_send_quota(&self, quota: i32) {
        self.send_quota.store(quota, Ordering::Release);
        self.max_send_quota.store(quota, Ordering::Release);
    }

    pub fn decrease_receive_quota(&self) {
        if self.receive_quota.load(Ordering::Acquire) > 0 {
            self.receive_quota.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn increase_receive_quota(&self) {
        if self.receive_quota.load(Ordering::Acquire) < self.max_receive_quota.load(Ordering::Acquire)
        {
            self.receive_quota.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn decrease_send_quota(&self) {
        if self.send_quota.load(Ordering::Acquire) > 0 {
            self.send_quota.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn increase_send_quota(&self) {
        if self.send_quota.load(Ordering::Acquire) < self.max_send_quota.load(Ordering::Acquire) {
            self.send_quota.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketType;
    use std::sync::Arc;

    fn msg(id: u16) -> Message {
        Message {
            packet_id: id,
            topic: Arc::from("t"),
            ..Default::default()
        }
    }

    #[test]
    fn set_preserves_insertion_order() {
        let inflight = Inflight::new();
        assert!(inflight.set(msg(3)));
        assert!(inflight.set(msg(1)));
        assert!(inflight.set(msg(2)));
        // replacement keeps position
        let mut replacement = msg(3);
        replacement.packet_type = PacketType::PubRel;
        assert!(!inflight.set(replacement));

        let order: Vec<u16> = inflight.entries().iter().map(|m| m.packet_id).collect();
        assert_eq!(order, vec![3, 1, 2]);
        assert_eq!(inflight.get(3).unwrap().packet_type, PacketType::PubRel);
    }

    #[test]
    fn delete_restores_nothing_twice() {
        let inflight = Inflight::new();
        inflight.set(msg(9));
        assert!(inflight.delete(9));
        assert!(!inflight.delete(9));
        assert!(inflight.is_empty());
    }

    #[test]
    fn quotas_clamp_to_bounds() {
        let inflight = Inflight::new();
        inflight.reset_send_quota(2);
        inflight.decrease_send_quota();
        inflight.decrease_send_quota();
        inflight.decrease_send_quota();
        assert_eq!(inflight.send_quota(), 0);
        inflight.increase_send_quota();
        inflight.increase_send_quota();
        inflight.increase_send_quota();
        assert_eq!(inflight.send_quota(), 2);
        assert_eq!(inflight.max_send_quota(), 2);
    }

    #[test]
    fn next_immediate_only_sees_parked_head() {
        let inflight = Inflight::new();
        let mut first = msg(1);
        first.expiry = 100;
        inflight.set(first);
        let mut parked = msg(2);
        parked.expiry = EXPIRY_PARKED;
        inflight.set(parked);

        // head is not parked
        assert!(inflight.next_immediate().is_none());
        inflight.delete(1);
        assert_eq!(inflight.next_immediate().unwrap().packet_id, 2);
    }

    #[test]
    fn clear_expired_returns_ids_and_keeps_order() {
        let inflight = Inflight::new();
        for (id, expiry) in [(1u16, 50i64), (2, 500), (3, 60)] {
            let mut m = msg(id);
            m.created = 40;
            m.expiry = expiry;
            inflight.set(m);
        }
        let mut deleted = inflight.clear_expired(100, 86_400);
        deleted.sort_unstable();
        assert_eq!(deleted, vec![1, 3]);
        let order: Vec<u16> = inflight.entries().iter().map(|m| m.packet_id).collect();
        assert_eq!(order, vec![2]);
    }

    #[test]
    fn install_replaces_contents() {
        let inflight = Inflight::new();
        inflight.set(msg(1));
        inflight.install(vec![msg(7), msg(8)]);
        let order: Vec<u16> = inflight.entries().iter().map(|m| m.packet_id).collect();
        assert_eq!(order, vec![7, 8]);
    }
}
