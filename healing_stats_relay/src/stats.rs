// Relay statistics.
//
// `Counters` are bumped lock-free from the drive loop; `RelayStatistics` is
// the serializable snapshot `RelayHandle::statistics` returns and the relay
// binary logs periodically. Directory-derived figures (registered players,
// peer entries, known peers) are computed from the directory at snapshot
// time rather than tracked incrementally.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use healing_stats_protocol::MessageType;
use serde::Serialize;

use crate::directory::DirectoryStatistics;

/// Point-in-time relay statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatistics {
    pub registered_players: usize,
    pub registered_peers: usize,
    pub known_peers: usize,
    pub live_connections: usize,
    /// Messages received, by message type name.
    pub received: BTreeMap<String, u64>,
    /// Messages written to clients, by message type name.
    pub transmitted: BTreeMap<String, u64>,
    pub unknown_received: u64,
    pub stale_peers_skipped: u64,
    pub forced_disconnects: u64,
}

const TYPES: usize = MessageType::ALL.len();

#[derive(Default)]
pub(crate) struct Counters {
    received: [AtomicU64; TYPES],
    transmitted: [AtomicU64; TYPES],
    unknown_received: AtomicU64,
    stale_peers_skipped: AtomicU64,
    forced_disconnects: AtomicU64,
}

fn index(message_type: MessageType) -> usize {
    message_type as usize - 1
}

impl Counters {
    pub(crate) fn received(&self, message_type: MessageType) {
        self.received[index(message_type)].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transmitted(&self, message_type: MessageType) {
        self.transmitted[index(message_type)].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unknown_received(&self) {
        self.unknown_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn stale_peers_skipped(&self, count: usize) {
        self.stale_peers_skipped
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn forced_disconnect(&self) {
        self.forced_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(
        &self,
        directory: DirectoryStatistics,
        live_connections: usize,
    ) -> RelayStatistics {
        let by_type = |counters: &[AtomicU64; TYPES]| {
            MessageType::ALL
                .iter()
                .map(|t| (t.name().to_string(), counters[index(*t)].load(Ordering::Relaxed)))
                .collect()
        };
        RelayStatistics {
            registered_players: directory.registered_players,
            registered_peers: directory.registered_peers,
            known_peers: directory.known_peers,
            live_connections,
            received: by_type(&self.received),
            transmitted: by_type(&self.transmitted),
            unknown_received: self.unknown_received.load(Ordering::Relaxed),
            stale_peers_skipped: self.stale_peers_skipped.load(Ordering::Relaxed),
            forced_disconnects: self.forced_disconnects.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_every_message_type() {
        let counters = Counters::default();
        counters.received(MessageType::RegisterSelf);
        counters.received(MessageType::CombatEvent);
        counters.received(MessageType::CombatEvent);
        counters.transmitted(MessageType::Close);
        counters.stale_peers_skipped(3);

        let stats = counters.snapshot(DirectoryStatistics::default(), 2);
        assert_eq!(stats.received.len(), MessageType::ALL.len());
        assert_eq!(stats.received["CombatEvent"], 2);
        assert_eq!(stats.received["RegisterSelf"], 1);
        assert_eq!(stats.transmitted["Close"], 1);
        assert_eq!(stats.stale_peers_skipped, 3);
        assert_eq!(stats.live_connections, 2);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["received"]["CombatEvent"], 2);
    }
}
