//! Structured counters for external observability collaborators.
//!
//! The broker never exports metrics itself; it keeps plain atomic counters
//! per queue and per subscription and hands out serializable snapshots from
//! `Broker::metrics_snapshot`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    replayed: AtomicU64,
    replay_acked: AtomicU64,
    replay_failed: AtomicU64,
    replay_dead_lettered: AtomicU64,
    duplicates_suppressed: AtomicU64,
}

impl Counters {
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self) {
        self.replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay_acked(&self) {
        self.replay_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay_failed(&self) {
        self.replay_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay_dead_lettered(&self) {
        self.replay_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, in_flight: usize) -> CounterSnapshot {
        CounterSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            in_flight: in_flight as u64,
            replayed: self.replayed.load(Ordering::Relaxed),
            replay_acked: self.replay_acked.load(Ordering::Relaxed),
            replay_failed: self.replay_failed.load(Ordering::Relaxed),
            replay_dead_lettered: self.replay_dead_lettered.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a destination's counters.
///
/// `delivered`, `acked`, `failed` and `dead_lettered` describe live traffic
/// only. Replayed copies are counted in `replayed` when enqueued and settle
/// into the `replay_*` counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub in_flight: u64,
    pub replayed: u64,
    pub replay_acked: u64,
    pub replay_failed: u64,
    pub replay_dead_lettered: u64,
    pub duplicates_suppressed: u64,
}

impl CounterSnapshot {
    /// Adds the delivery-side counters of `other`; `published` is left alone
    /// because a topic counts publishes once, not once per subscription.
    pub(crate) fn absorb_deliveries(&mut self, other: &CounterSnapshot) {
        self.delivered += other.delivered;
        self.acked += other.acked;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
        self.in_flight += other.in_flight;
        self.replayed += other.replayed;
        self.replay_acked += other.replay_acked;
        self.replay_failed += other.replay_failed;
        self.replay_dead_lettered += other.replay_dead_lettered;
        self.duplicates_suppressed += other.duplicates_suppressed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Queue,
    Topic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestinationSnapshot {
    pub kind: DestinationKind,
    pub counters: CounterSnapshot,
    /// Per-subscription breakdown; empty for queues.
    pub subscriptions: BTreeMap<String, CounterSnapshot>,
}

pub type MetricsSnapshot = BTreeMap<String, DestinationSnapshot>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let counters = Counters::default();
        counters.record_published();
        counters.record_delivered();
        counters.record_delivered();
        counters.record_failed();
        counters.record_acked();

        let snapshot = counters.snapshot(1);
        assert_eq!(snapshot.published, 1);
        assert_eq!(snapshot.delivered, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.acked, 1);
        assert_eq!(snapshot.in_flight, 1);
        assert_eq!(snapshot.dead_lettered, 0);
    }

    #[test]
    fn absorb_keeps_published() {
        let mut topic = CounterSnapshot {
            published: 3,
            ..CounterSnapshot::default()
        };
        let sub = CounterSnapshot {
            published: 3,
            delivered: 3,
            acked: 2,
            ..CounterSnapshot::default()
        };
        topic.absorb_deliveries(&sub);
        topic.absorb_deliveries(&sub);
        assert_eq!(topic.published, 3);
        assert_eq!(topic.delivered, 6);
        assert_eq!(topic.acked, 4);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let snapshot = DestinationSnapshot {
            kind: DestinationKind::Queue,
            counters: CounterSnapshot::default(),
            subscriptions: BTreeMap::new(),
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["kind"], "queue");
        assert_eq!(json["counters"]["in_flight"], 0);
    }
}
