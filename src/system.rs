//! Broker-wide counters surfaced as `$SYS` telemetry
//!
//! Every field is a 64-bit atomic updated from arbitrary tasks; the
//! housekeeping loop snapshots them with plain loads. Observability is
//! eventually consistent by design.

use std::sync::atomic::{AtomicI64, Ordering};

/// Live counter block. All counters are cumulative unless noted.
#[derive(Debug, Default)]
pub struct Info {
    /// Unix seconds the broker started
    pub started: AtomicI64,
    /// Unix seconds of the last $SYS publish
    pub time: AtomicI64,
    pub uptime: AtomicI64,
    pub bytes_received: AtomicI64,
    pub bytes_sent: AtomicI64,
    /// Gauge: currently connected clients
    pub clients_connected: AtomicI64,
    /// Gauge: known but disconnected clients
    pub clients_disconnected: AtomicI64,
    /// High-water mark of concurrently connected clients
    pub clients_maximum: AtomicI64,
    /// Gauge: clients known to the registry
    pub clients_total: AtomicI64,
    pub packets_received: AtomicI64,
    pub packets_sent: AtomicI64,
    pub messages_received: AtomicI64,
    pub messages_sent: AtomicI64,
    pub messages_dropped: AtomicI64,
    /// Gauge: inflight entries across all clients
    pub inflight: AtomicI64,
    pub inflight_dropped: AtomicI64,
    /// Gauge: retained messages indexed
    pub retained: AtomicI64,
    /// Gauge: registered subscriptions
    pub subscriptions: AtomicI64,
    /// Resident memory in bytes, best effort
    pub memory_alloc: AtomicI64,
    /// OS threads in this process, best effort
    pub threads: AtomicI64,
}

/// Point-in-time copy of [`Info`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InfoSnapshot {
    pub started: i64,
    pub time: i64,
    pub uptime: i64,
    pub bytes_received: i64,
    pub bytes_sent: i64,
    pub clients_connected: i64,
    pub clients_disconnected: i64,
    pub clients_maximum: i64,
    pub clients_total: i64,
    pub packets_received: i64,
    pub packets_sent: i64,
    pub messages_received: i64,
    pub messages_sent: i64,
    pub messages_dropped: i64,
    pub inflight: i64,
    pub inflight_dropped: i64,
    pub retained: i64,
    pub subscriptions: i64,
    pub memory_alloc: i64,
    pub threads: i64,
}

impl Info {
    pub fn new(started: i64) -> Self {
        let info = Self::default();
        info.started.store(started, Ordering::Relaxed);
        info
    }

    pub fn add(field: &AtomicI64, delta: i64) {
        field.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(field: &AtomicI64, value: i64) {
        field.store(value, Ordering::Relaxed);
    }

    pub fn get(field: &AtomicI64) -> i64 {
        field.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> InfoSnapshot {
        InfoSnapshot {
            started: Self::get(&self.started),
            time: Self::get(&self.time),
            uptime: Self::get(&self.uptime),
            bytes_received: Self::get(&self.bytes_received),
            bytes_sent: Self::get(&self.bytes_sent),
            clients_connected: Self::get(&self.clients_connected),
            clients_disconnected: Self::get(&self.clients_disconnected),
            clients_maximum: Self::get(&self.clients_maximum),
            clients_total: Self::get(&self.clients_total),
            packets_received: Self::get(&self.packets_received),
            packets_sent: Self::get(&self.packets_sent),
            messages_received: Self::get(&self.messages_received),
            messages_sent: Self::get(&self.messages_sent),
            messages_dropped: Self::get(&self.messages_dropped),
            inflight: Self::get(&self.inflight),
            inflight_dropped: Self::get(&self.inflight_dropped),
            retained: Self::get(&self.retained),
            subscriptions: Self::get(&self.subscriptions),
            memory_alloc: Self::get(&self.memory_alloc),
            threads: Self::get(&self.threads),
        }
    }

    /// Restore gauge-like fields (and, when `full`, the cumulative ones)
    /// from a stored snapshot.
    pub fn restore(&self, snap: &InfoSnapshot, full: bool) {
        if full {
            Self::set(&self.bytes_received, snap.bytes_received);
            Self::set(&self.bytes_sent, snap.bytes_sent);
            Self::set(&self.clients_maximum, snap.clients_maximum);
            Self::set(&self.clients_total, snap.clients_total);
            Self::set(&self.clients_disconnected, snap.clients_disconnected);
            Self::set(&self.messages_received, snap.messages_received);
            Self::set(&self.messages_sent, snap.messages_sent);
            Self::set(&self.messages_dropped, snap.messages_dropped);
            Self::set(&self.packets_received, snap.packets_received);
            Self::set(&self.packets_sent, snap.packets_sent);
            Self::set(&self.inflight_dropped, snap.inflight_dropped);
        }
        Self::set(&self.retained, snap.retained);
        Self::set(&self.inflight, snap.inflight);
        Self::set(&self.subscriptions, snap.subscriptions);
    }
}

/// Resident memory of this process in bytes; 0 where unavailable.
pub fn process_memory_bytes() -> i64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(resident_pages) = statm
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<i64>().ok())
            {
                return resident_pages * 4096;
            }
        }
    }
    0
}

/// OS thread count of this process; 0 where unavailable.
pub fn process_threads() -> i64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("Threads:") {
                    if let Ok(count) = rest.trim().parse::<i64>() {
                        return count;
                    }
                }
            }
        }
    }
    0
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_updates() {
        let info = Info::new(1000);
        Info::add(&info.messages_received, 3);
        Info::add(&info.clients_connected, 1);
        let snap = info.snapshot();
        assert_eq!(snap.started, 1000);
        assert_eq!(snap.messages_received, 3);
        assert_eq!(snap.clients_connected, 1);
    }

    #[test]
    fn restore_partial_keeps_cumulative_counters() {
        let info = Info::new(0);
        Info::add(&info.messages_received, 5);
        let snap = InfoSnapshot {
            retained: 2,
            subscriptions: 4,
            messages_received: 99,
            ..Default::default()
        };
        info.restore(&snap, false);
        assert_eq!(Info::get(&info.retained), 2);
        assert_eq!(Info::get(&info.subscriptions), 4);
        assert_eq!(Info::get(&info.messages_received), 5);
    }
}
